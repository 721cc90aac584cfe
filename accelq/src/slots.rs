//! Accelerator slots.
//!
//! Each accelerator is guarded by a single slot. A worker must hold the slot of its assigned
//! accelerator for the whole duration of a job, which caps the number of jobs running on any
//! one accelerator at exactly one no matter how many workers share it.
use std::{fmt::Display, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// The environment variable used to discover the visible accelerators.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// The index of an accelerator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcceleratorIndex(usize);

impl AcceleratorIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl Display for AcceleratorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fixed pool of mutual exclusion slots, one per accelerator.
///
/// When there are no accelerators a single slot is still allocated to represent the CPU.
#[derive(Debug)]
pub struct AcceleratorSlots {
    slots: Vec<Arc<Mutex<()>>>,
    accelerators: usize,
}

/// Proof of exclusive access to an accelerator, released on drop.
#[derive(Debug)]
pub struct SlotGuard {
    index: AcceleratorIndex,
    _guard: OwnedMutexGuard<()>,
}

impl SlotGuard {
    pub fn index(&self) -> AcceleratorIndex {
        self.index
    }
}

impl AcceleratorSlots {
    pub fn new(accelerators: usize) -> Self {
        Self {
            slots: (0..accelerators.max(1))
                .map(|_| Arc::new(Mutex::new(())))
                .collect(),
            accelerators,
        }
    }

    /// The number of slots, at least one.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false, there is at least one slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the single slot stands for the CPU rather than an accelerator.
    pub fn is_cpu_fallback(&self) -> bool {
        self.accelerators == 0
    }

    /// The accelerator a given worker is bound to.
    pub fn index_for_worker(&self, worker: usize) -> AcceleratorIndex {
        AcceleratorIndex(worker % self.len())
    }

    /// Wait until the slot is free and take it.
    pub async fn acquire(&self, index: AcceleratorIndex) -> SlotGuard {
        let guard = self.slot(index).lock_owned().await;
        SlotGuard {
            index,
            _guard: guard,
        }
    }

    /// Take the slot if it is currently free.
    pub fn try_acquire(&self, index: AcceleratorIndex) -> Option<SlotGuard> {
        self.slot(index)
            .try_lock_owned()
            .ok()
            .map(|guard| SlotGuard {
                index,
                _guard: guard,
            })
    }

    fn slot(&self, index: AcceleratorIndex) -> Arc<Mutex<()>> {
        self.slots[index.get() % self.len()].clone()
    }
}

/// Count the accelerators made visible through [`VISIBLE_DEVICES_ENV`].
///
/// Returns zero when the variable is unset.
pub fn detect_accelerators() -> usize {
    std::env::var(VISIBLE_DEVICES_ENV)
        .map(|devices| parse_visible_devices(&devices))
        .unwrap_or(0)
}

/// Devices are listed up to the first invalid (e.g. `-1`) entry.
fn parse_visible_devices(devices: &str) -> usize {
    devices
        .split(',')
        .map(str::trim)
        .take_while(|device| !device.is_empty() && !device.starts_with('-'))
        .count()
}

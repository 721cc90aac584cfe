use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::JobRegistry;

use super::CleanupConfig;

pub(crate) struct CleanupRunner {
    config: CleanupConfig,
    registry: JobRegistry,
}

impl CleanupRunner {
    pub fn new(registry: JobRegistry, config: CleanupConfig) -> Self {
        Self { config, registry }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for the job pruner, stopping");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune();
                            let delay = next - Utc::now();
                            if let Ok(delay) = delay.to_std() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        })
    }

    fn prune(&self) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.config.max_age) else {
            return 0;
        };
        let removed = self.registry.remove_terminal_older_than(cutoff);
        tracing::debug!(removed, "Pruned finished jobs");
        removed
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::job::JobRecord;

    #[tokio::test]
    async fn prunes_on_schedule_until_cancelled() {
        let registry = JobRegistry::new();
        let mut old = JobRecord::mock_record();
        old.mark_cancelled().unwrap();
        old.completed_at = Some(Utc::now() - TimeDelta::minutes(5));
        let id = old.id;
        registry.insert(old);

        let config = CleanupConfig::new(
            cron::Schedule::from_str("* * * * * *").unwrap(),
            TimeDelta::minutes(1),
        );
        let token = CancellationToken::new();
        let handle = CleanupRunner::new(registry.clone(), config).spawn(token.clone());

        tokio::time::timeout(Duration::from_secs(3), async {
            while registry.get(id).is_some() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn prune_keeps_everything_for_unbounded_max_age() {
        let registry = JobRegistry::new();
        let mut old = JobRecord::mock_record();
        old.mark_cancelled().unwrap();
        old.completed_at = Some(Utc::now() - TimeDelta::days(365));
        let id = old.id;
        registry.insert(old);

        let config = CleanupConfig::new(
            cron::Schedule::from_str("0 0 * * * *").unwrap(),
            TimeDelta::MAX,
        );

        assert_eq!(CleanupRunner::new(registry.clone(), config).prune(), 0);
        assert!(registry.get(id).is_some());
    }
}

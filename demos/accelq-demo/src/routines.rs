//! Stand-in image routines which write small PPM files instead of driving a real model.
use std::{
    fs,
    path::{Path, PathBuf},
};

use accelq::prelude::*;
use chrono::Utc;

const PPM_MEDIA_KIND: &str = "image/x-portable-pixmap";
const DEFAULT_SIZE: u64 = 64;
const MAX_SIZE: u64 = 1024;

/// The routines known to both the coordinator and its isolated workers.
pub fn registry(output_dir: &Path) -> RoutineRegistry {
    RoutineRegistry::new()
        .with_routine(TextToImage::new(output_dir))
        .with_routine(ImageEdit::new(output_dir))
}

pub struct TextToImage {
    output_dir: PathBuf,
}

impl TextToImage {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl ComputeRoutine for TextToImage {
    fn job_type(&self) -> &str {
        "text_to_image"
    }

    fn run(&self, args: &Arguments) -> Result<ResultPayload, RoutineError> {
        let prompt = args
            .kwarg("prompt")
            .and_then(|value| value.as_str())
            .filter(|prompt| !prompt.trim().is_empty())
            .ok_or_else(|| RoutineError::new("A prompt is required"))?;
        let width = dimension(args, "width")?;
        let height = dimension(args, "height")?;

        tracing::debug!(
            accelerator = ?args.accelerator_index(),
            width,
            height,
            "Rendering {prompt:?}"
        );
        let image = render(prompt, width, height);
        let name = format!("{}-{}.ppm", slug(prompt), Utc::now().format("%Y%m%d%H%M%S%6f"));
        write_output(&self.output_dir, &name, &image)
    }
}

pub struct ImageEdit {
    output_dir: PathBuf,
}

impl ImageEdit {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl ComputeRoutine for ImageEdit {
    fn job_type(&self) -> &str {
        "image_edit"
    }

    /// Inverts the pixels of the PPM named by the `source` keyword.
    fn run(&self, args: &Arguments) -> Result<ResultPayload, RoutineError> {
        let source = args
            .kwarg("source")
            .and_then(|value| value.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| RoutineError::new("A source image is required"))?;
        let mut image = fs::read(&source).map_err(|err| {
            RoutineError::new(format!("Failed to read {}: {err}", source.display()))
        })?;
        let pixels = pixel_offset(&image)
            .ok_or_else(|| RoutineError::new(format!("{} is not a PPM", source.display())))?;
        image[pixels..].iter_mut().for_each(|byte| *byte = 255 - *byte);

        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        write_output(&self.output_dir, &format!("{stem}-edited.ppm"), &image)
    }
}

fn dimension(args: &Arguments, key: &str) -> Result<u64, RoutineError> {
    match args.kwarg(key) {
        None => Ok(DEFAULT_SIZE),
        Some(value) => value
            .as_u64()
            .filter(|size| (1..=MAX_SIZE).contains(size))
            .ok_or_else(|| RoutineError::new(format!("{key} must be between 1 and {MAX_SIZE}"))),
    }
}

fn slug(prompt: &str) -> String {
    let slug: String = prompt
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
            ' ' | '-' | '_' => Some('-'),
            _ => None,
        })
        .take(32)
        .collect();
    match slug.trim_matches('-') {
        "" => "image".to_owned(),
        slug => slug.to_owned(),
    }
}

/// A binary PPM gradient tinted by a hash of the prompt.
fn render(prompt: &str, width: u64, height: u64) -> Vec<u8> {
    let seed = prompt
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        })
        .to_le_bytes();
    let mut image = format!("P6\n{width} {height}\n255\n").into_bytes();
    for y in 0..height {
        for x in 0..width {
            let shade = ((x + y) * 255 / (width + height)) as u8;
            image.extend_from_slice(&[
                seed[0].wrapping_add(shade),
                seed[1].wrapping_add(shade / 2),
                seed[2],
            ]);
        }
    }
    image
}

/// The offset of the first pixel byte of a binary PPM.
fn pixel_offset(image: &[u8]) -> Option<usize> {
    if !image.starts_with(b"P6") {
        return None;
    }
    let mut fields = 0;
    let mut in_field = false;
    for (index, byte) in image.iter().enumerate() {
        if byte.is_ascii_whitespace() {
            if in_field {
                fields += 1;
                in_field = false;
                if fields == 4 {
                    return Some(index + 1);
                }
            }
        } else {
            in_field = true;
        }
    }
    None
}

fn write_output(
    output_dir: &Path,
    name: &str,
    image: &[u8],
) -> Result<ResultPayload, RoutineError> {
    fs::create_dir_all(output_dir).map_err(|err| {
        RoutineError::new(format!("Failed to create {}: {err}", output_dir.display()))
    })?;
    let path = output_dir.join(name);
    fs::write(&path, image)
        .map_err(|err| RoutineError::new(format!("Failed to write {}: {err}", path.display())))?;
    Ok(ResultPayload::new(path.to_string_lossy(), PPM_MEDIA_KIND, name))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_to_image_writes_a_ppm() {
        let dir = tempfile::tempdir().unwrap();
        let routine = TextToImage::new(dir.path());
        let args = Arguments::new()
            .with_kwarg("prompt", "A lighthouse, at dusk!")
            .with_kwarg("width", 4)
            .with_kwarg("height", 2);

        let payload = routine.run(&args).unwrap();

        assert_eq!(payload.media_kind, PPM_MEDIA_KIND);
        assert!(payload.display_name.starts_with("a-lighthouse-at-dusk-"));
        let image = fs::read(&payload.result_location).unwrap();
        let offset = pixel_offset(&image).unwrap();
        assert_eq!(&image[..offset], b"P6\n4 2\n255\n");
        assert_eq!(image.len() - offset, 4 * 2 * 3);
    }

    #[test]
    fn text_to_image_rejects_bad_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let routine = TextToImage::new(dir.path());

        assert_eq!(
            routine.run(&Arguments::new()),
            Err(RoutineError::new("A prompt is required"))
        );
        let args = Arguments::new()
            .with_kwarg("prompt", "a cat")
            .with_kwarg("width", 0);
        assert_eq!(
            routine.run(&args),
            Err(RoutineError::new("width must be between 1 and 1024"))
        );
    }

    #[test]
    fn image_edit_inverts_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("cat.ppm");
        fs::write(&source, b"P6\n1 1\n255\n\x00\x10\xff").unwrap();
        let routine = ImageEdit::new(dir.path().join("out"));

        let payload = routine
            .run(&Arguments::new().with_kwarg("source", source.to_string_lossy().into_owned()))
            .unwrap();

        assert_eq!(payload.display_name, "cat-edited.ppm");
        let image = fs::read(&payload.result_location).unwrap();
        assert_eq!(image, b"P6\n1 1\n255\n\xff\xef\x00");
    }

    #[test]
    fn image_edit_requires_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let routine = ImageEdit::new(dir.path());

        assert_eq!(
            routine.run(&Arguments::new()),
            Err(RoutineError::new("A source image is required"))
        );
        let err = routine
            .run(&Arguments::new().with_kwarg("source", "/nonexistent/cat.ppm"))
            .unwrap_err();
        assert!(err.message().starts_with("Failed to read /nonexistent/cat.ppm"));
    }

    #[test]
    fn slug_falls_back_for_symbols() {
        assert_eq!(slug("!!!"), "image");
        assert_eq!(slug("  Neon_City 2049 "), "neon-city-2049");
    }
}

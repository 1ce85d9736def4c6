//! C1: content-addressed binary storage for PDFs/XML/images, with
//! optional S3-compatible object-store backing and a local scratch
//! directory as the always-available fallback.

use std::{
    borrow::Cow,
    io::Cursor,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use image::{codecs::jpeg::JpegEncoder, ImageDecoder, ImageReader};
use thiserror::Error;
use tracing::{instrument, warn};

/// Longest edge an optimized image is downscaled to, matching the source
/// system's OCR-tuned 2500px threshold (raised from a smaller default so
/// small text stays legible to the vision model/OCR pass).
const MAX_IMAGE_DIMENSION: u32 = 2500;
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to write artifact to scratch directory: {0}")]
    Io(#[from] std::io::Error),
}

/// `save_binary`'s caller-provided hints.
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    pub force_pdf: bool,
    pub owner_email: String,
    pub date: chrono::NaiveDate,
}

#[derive(Clone, Debug)]
pub struct SavedArtifact {
    pub local_path: PathBuf,
    pub remote_key: Option<String>,
}

/// Holds the local scratch directory (with automatic temp-dir fallback) and
/// an optional handle to an S3-compatible object store.
pub struct ArtifactStore {
    scratch_dir: PathBuf,
    /// Set once if a write to `scratch_dir` fails; subsequent calls go
    /// straight to `std::env::temp_dir()` without re-attempting or
    /// re-logging the fallback.
    fell_back: AtomicBool,
    object_store: Option<Box<dyn ObjectStore>>,
}

/// The narrow surface this module needs from an S3-compatible client.
/// A concrete implementation (e.g. backed by an `aws-sdk-s3`-style client)
/// is supplied by the binary; this crate stays storage-backend-agnostic.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<()>;
}

impl ArtifactStore {
    pub fn new(scratch_dir: PathBuf, object_store: Option<Box<dyn ObjectStore>>) -> Self {
        Self {
            scratch_dir,
            fell_back: AtomicBool::new(false),
            object_store,
        }
    }

    fn effective_dir(&self) -> PathBuf {
        if self.fell_back.load(Ordering::Relaxed) {
            std::env::temp_dir()
        } else {
            self.scratch_dir.clone()
        }
    }

    /// Sanitizes a filename: strips path-traversal components, collapses
    /// whitespace, caps at 100 chars, and coerces the extension when
    /// `force_pdf` is set.
    pub fn sanitize_filename(raw: &str, force_pdf: bool) -> String {
        let base = raw
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(raw)
            .replace("..", "");
        let collapsed = base.split_whitespace().collect::<Vec<_>>().join("_");
        let mut name = if collapsed.is_empty() {
            "file".to_string()
        } else {
            collapsed
        };
        name.truncate(100);

        if force_pdf && !name.to_lowercase().ends_with(".pdf") {
            if let Some(dot) = name.rfind('.') {
                name.truncate(dot);
            }
            name.push_str(".pdf");
        }
        name
    }

    /// Builds the unique `<ts>_<random8>_<base>.<ext>` filename.
    fn unique_name(sanitized: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let random8: String = {
            use ring::rand::{SecureRandom, SystemRandom};
            let rng = SystemRandom::new();
            let mut buf = [0u8; 4];
            rng.fill(&mut buf).expect("system RNG failure");
            cuenly_common::hex::encode(&buf)
        };
        format!("{ts}_{random8}_{sanitized}")
    }

    #[instrument(skip(self, content))]
    pub async fn save_binary(
        &self,
        content: &[u8],
        filename: &str,
        opts: &SaveOptions,
    ) -> Result<SavedArtifact, Error> {
        let sanitized = Self::sanitize_filename(filename, opts.force_pdf);
        let content: Cow<[u8]> = if !opts.force_pdf && is_image_filename(&sanitized) {
            Cow::Owned(optimize_image(content))
        } else {
            Cow::Borrowed(content)
        };
        let unique = Self::unique_name(&sanitized);

        let local_path = match self.write_local(&unique, &content).await {
            Ok(path) => path,
            Err(e) if !self.fell_back.swap(true, Ordering::Relaxed) => {
                warn!(
                    error = %e,
                    "scratch dir write failed, falling back to system temp dir"
                );
                self.write_local(&unique, &content).await?
            }
            Err(e) => return Err(e),
        };

        let remote_key = if let Some(store) = &self.object_store {
            let key = Self::remote_key(&opts.owner_email, &opts.date, &unique);
            let content_type = content_type_for(&unique);
            match store.put(&key, content_type, &content).await {
                Ok(()) => Some(key),
                Err(e) => {
                    warn!(error = %e, "object store upload failed (non-fatal)");
                    None
                }
            }
        } else {
            None
        };

        Ok(SavedArtifact {
            local_path,
            remote_key,
        })
    }

    async fn write_local(
        &self,
        unique_name: &str,
        content: &[u8],
    ) -> Result<PathBuf, Error> {
        let dir = self.effective_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(unique_name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// `<YYYY>/<sanitized_owner>/<MM>/<HHMM>_<filename>`
    fn remote_key(owner_email: &str, date: &chrono::NaiveDate, filename: &str) -> String {
        use chrono::Datelike;
        let sanitized_owner = owner_email.replace(['@', '.'], "_");
        let now = chrono::Utc::now();
        format!(
            "{year:04}/{owner}/{month:02}/{hhmm}_{filename}",
            year = date.year(),
            owner = sanitized_owner,
            month = date.month(),
            hhmm = now.format("%H%M"),
        )
    }

    /// Removes scratch files older than `older_than` that are regular
    /// files (directories are left alone). Returns the count removed.
    #[instrument(skip(self))]
    pub async fn cleanup_temp(&self, older_than: Duration) -> Result<usize, Error> {
        let dir = self.effective_dir();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        let now = SystemTime::now();
        while let Some(entry) = read_dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok());
            if age.is_some_and(|age| age > older_than) {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Derives a download filename from a URL, using `default_ext` if the
    /// URL path has no extension.
    pub fn filename_from_url(url: &str, default_ext: &str) -> String {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let last_segment = path.rsplit('/').next().unwrap_or("download");
        if last_segment.contains('.') {
            last_segment.to_string()
        } else {
            format!("{last_segment}.{default_ext}")
        }
    }
}

fn content_type_for(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".xml") {
        "application/xml"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".png") {
        "image/png"
    } else {
        "application/octet-stream"
    }
}

fn is_image_filename(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png")
}

/// Corrects orientation, converts to RGB, downscales to
/// [`MAX_IMAGE_DIMENSION`] on the longest edge, and re-encodes as JPEG at
/// [`JPEG_QUALITY`]. Any failure along the way (corrupt image, unsupported
/// format) falls back to storing the original bytes unmodified — this is
/// an optimization, not a correctness requirement.
fn optimize_image(content: &[u8]) -> Vec<u8> {
    match try_optimize_image(content) {
        Ok(optimized) => optimized,
        Err(e) => {
            warn!(error = %e, "image optimization failed, storing original bytes");
            content.to_vec()
        }
    }
}

fn try_optimize_image(content: &[u8]) -> anyhow::Result<Vec<u8>> {
    let reader = ImageReader::new(Cursor::new(content)).with_guessed_format()?;
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation().unwrap_or(image::metadata::Orientation::NoTransforms);

    let mut img = image::DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    let img = image::DynamicImage::ImageRgb8(img.into_rgb8());

    let img = if img.width().max(img.height()) > MAX_IMAGE_DIMENSION {
        img.resize(MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&img)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_strips_traversal_and_collapses_whitespace() {
        let sanitized =
            ArtifactStore::sanitize_filename("../../etc/passwd  weird name.pdf", false);
        assert!(!sanitized.contains(".."));
        assert!(!sanitized.contains("  "));
    }

    #[test]
    fn sanitize_coerces_extension_when_force_pdf() {
        let sanitized = ArtifactStore::sanitize_filename("invoice.jpg", true);
        assert!(sanitized.ends_with(".pdf"));
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "a".repeat(500);
        let sanitized = ArtifactStore::sanitize_filename(&long, false);
        assert!(sanitized.len() <= 100);
    }

    #[test]
    fn filename_from_url_falls_back_to_default_ext() {
        assert_eq!(
            ArtifactStore::filename_from_url("https://x.com/descargar?id=1", "pdf"),
            "descargar.pdf"
        );
        assert_eq!(
            ArtifactStore::filename_from_url("https://x.com/foo/bar.xml", "pdf"),
            "bar.xml"
        );
    }

    #[test]
    fn optimize_image_falls_back_to_original_on_garbage_input() {
        let garbage = b"not an image";
        assert_eq!(optimize_image(garbage), garbage);
    }

    #[test]
    fn optimize_image_reencodes_oversized_png_as_downscaled_jpeg() {
        let big = image::DynamicImage::new_rgb8(3000, 100);
        let mut png_bytes = Vec::new();
        big.write_to(&mut Cursor::new(&mut png_bytes), image::ImageFormat::Png)
            .unwrap();

        let optimized = optimize_image(&png_bytes);
        let decoded = image::load_from_memory(&optimized).unwrap();
        assert!(decoded.width().max(decoded.height()) <= MAX_IMAGE_DIMENSION);
        assert_eq!(
            image::guess_format(&optimized).unwrap(),
            image::ImageFormat::Jpeg
        );
    }

    #[tokio::test]
    async fn save_and_cleanup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), None);
        let opts = SaveOptions {
            force_pdf: false,
            owner_email: "owner@example.com".to_string(),
            date: chrono::Utc::now().date_naive(),
        };
        let saved = store
            .save_binary(b"hello", "invoice.pdf", &opts)
            .await
            .unwrap();
        assert!(saved.local_path.exists());
        assert!(saved.remote_key.is_none());

        // Not yet old enough to be cleaned up.
        let removed = store.cleanup_temp(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = store.cleanup_temp(Duration::from_secs(0)).await.unwrap();
        assert_eq!(removed, 1);
    }
}

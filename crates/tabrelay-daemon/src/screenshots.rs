//! Ephemeral screenshot artifacts.
//!
//! Screenshot payloads arrive from the extension as base64. The store
//! decodes them (rejecting anything that would exceed the configured size
//! cap before the bytes are materialized), writes them under a random
//! filename, and schedules deletion after the TTL. Nothing here survives a
//! restart and nothing is served after expiry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tabrelay_core::protocol::ImageFormat;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors from artifact materialization.
#[derive(Debug, Error)]
pub enum ScreenshotError {
    /// The decoded payload would exceed the configured size cap.
    #[error("screenshot exceeds maximum size")]
    TooLarge,

    /// The payload is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The artifact could not be written.
    #[error("failed to write artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// A materialized artifact.
#[derive(Debug, Clone)]
pub struct SavedArtifact {
    /// Random filename (with extension) under the store directory.
    pub name: String,
    /// Decoded size in bytes.
    pub size: usize,
    /// When the artifact will be deleted.
    pub expires_at: DateTime<Utc>,
}

/// Disk-backed store for TTL-bounded screenshot files.
#[derive(Debug)]
pub struct ScreenshotStore {
    dir: PathBuf,
    ttl: Duration,
    max_bytes: usize,
}

impl ScreenshotStore {
    /// Creates a store rooted at `dir`. The directory must already exist.
    #[must_use]
    pub fn new(dir: PathBuf, ttl: Duration, max_bytes: usize) -> Self {
        Self {
            dir,
            ttl,
            max_bytes,
        }
    }

    /// The directory artifacts are served from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decodes a base64 payload and persists it under a random name,
    /// scheduling deletion after the TTL.
    ///
    /// Accepts both raw base64 and data URLs (`data:image/png;base64,...`).
    ///
    /// # Errors
    ///
    /// - [`ScreenshotError::TooLarge`] when the decoded size would exceed the
    ///   cap (checked against the base64 length before decoding, and against
    ///   the real size after)
    /// - [`ScreenshotError::Decode`] for malformed base64
    /// - [`ScreenshotError::Io`] when the write fails
    pub async fn save(
        &self,
        payload: &str,
        format: ImageFormat,
    ) -> Result<SavedArtifact, ScreenshotError> {
        let payload = strip_data_url(payload).trim();

        // Base64 inflates by 4/3; reject before allocating the decoded form.
        if payload.len() / 4 * 3 > self.max_bytes {
            return Err(ScreenshotError::TooLarge);
        }

        let bytes = BASE64.decode(payload)?;
        if bytes.len() > self.max_bytes {
            return Err(ScreenshotError::TooLarge);
        }

        let name = format!("{}.{}", Uuid::new_v4(), format.extension());
        let path = self.dir.join(&name);
        tokio::fs::write(&path, &bytes).await?;

        let ttl = self.ttl;
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(err) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %err, "artifact already gone at expiry");
            }
        });

        debug!(name = %name, size = bytes.len(), "screenshot materialized");
        Ok(SavedArtifact {
            name,
            size: bytes.len(),
            expires_at,
        })
    }
}

/// Strips a `data:<mime>;base64,` prefix, if present.
fn strip_data_url(payload: &str) -> &str {
    if payload.starts_with("data:") {
        payload
            .split_once(',')
            .map_or(payload, |(_, rest)| rest)
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_bytes: usize, ttl: Duration) -> (tempfile::TempDir, ScreenshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ScreenshotStore::new(dir.path().to_path_buf(), ttl, max_bytes);
        (dir, store)
    }

    #[tokio::test]
    async fn saves_and_names_artifacts() {
        let (dir, store) = store(1024, Duration::from_secs(60));
        let payload = BASE64.encode(b"fake png bytes");

        let saved = store.save(&payload, ImageFormat::Png).await.unwrap();
        assert!(saved.name.ends_with(".png"));
        assert_eq!(saved.size, b"fake png bytes".len());

        let on_disk = std::fs::read(dir.path().join(&saved.name)).unwrap();
        assert_eq!(on_disk, b"fake png bytes");
    }

    #[tokio::test]
    async fn strips_data_url_prefix() {
        let (dir, store) = store(1024, Duration::from_secs(60));
        let payload = format!("data:image/jpeg;base64,{}", BASE64.encode(b"jpeg"));

        let saved = store.save(&payload, ImageFormat::Jpeg).await.unwrap();
        assert!(saved.name.ends_with(".jpeg"));
        assert_eq!(std::fs::read(dir.path().join(&saved.name)).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn rejects_oversize_before_decoding() {
        let (_dir, store) = store(8, Duration::from_secs(60));
        let payload = BASE64.encode([0u8; 64]);
        assert!(matches!(
            store.save(&payload, ImageFormat::Png).await,
            Err(ScreenshotError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn rejects_malformed_base64() {
        let (_dir, store) = store(1024, Duration::from_secs(60));
        assert!(matches!(
            store.save("not//valid//base64!!!", ImageFormat::Png).await,
            Err(ScreenshotError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn artifacts_expire_after_ttl() {
        let (dir, store) = store(1024, Duration::from_millis(50));
        let payload = BASE64.encode(b"short-lived");

        let saved = store.save(&payload, ImageFormat::Png).await.unwrap();
        let path = dir.path().join(&saved.name);
        assert!(path.exists());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!path.exists());
    }
}

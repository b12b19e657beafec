//! Attachment file store
//!
//! Writes attachment bytes under a single flat base directory with
//! collision-free generated names. All filesystem work runs in
//! `spawn_blocking` so the I/O runtime is never stalled by disk writes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Result of storing one attachment
#[derive(Debug, Clone)]
pub struct SavedFile {
    pub stored_filename: String,
    pub file_path: String,
    pub file_size: i64,
}

/// Flat-directory attachment store
///
/// Stored names follow `YYYYMMDDHHMM_<emailUid>_<uuidv4><ext>`; the UUID
/// guarantees uniqueness independent of the original filename and the
/// extension is carried over verbatim.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_dir: PathBuf,
}

impl AttachmentStore {
    /// Create the store, ensuring the base directory exists
    ///
    /// # Errors
    ///
    /// `Storage` when the directory cannot be created.
    pub fn new(base_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|e| {
            AppError::Storage(format!(
                "failed to create attachment directory {}: {e}",
                base_dir.display()
            ))
        })?;
        info!(path = %base_dir.display(), "attachment directory ready");
        Ok(Self { base_dir })
    }

    /// Generate a stored filename for an attachment
    ///
    /// The timestamp prefix comes from the message's received time so files
    /// sort alongside their messages.
    pub fn generate_filename(
        email_uid: &str,
        original_filename: &str,
        date_received: Option<DateTime<Utc>>,
    ) -> String {
        let time_prefix = date_received
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d%H%M")
            .to_string();
        let ext = Path::new(original_filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        format!("{time_prefix}_{email_uid}_{}{ext}", Uuid::new_v4())
    }

    /// Write attachment bytes to disk
    ///
    /// # Errors
    ///
    /// `Storage` on any filesystem failure.
    pub async fn save(
        &self,
        email_uid: &str,
        original_filename: &str,
        content: Vec<u8>,
        date_received: Option<DateTime<Utc>>,
    ) -> AppResult<SavedFile> {
        let stored_filename = Self::generate_filename(email_uid, original_filename, date_received);
        let file_path = self.base_dir.join(&stored_filename);
        let file_size = content.len() as i64;

        let write_path = file_path.clone();
        task::spawn_blocking(move || std::fs::write(&write_path, content))
            .await
            .map_err(|e| AppError::Storage(format!("attachment write task failed: {e}")))?
            .map_err(|e| {
                AppError::Storage(format!("failed to write {}: {e}", file_path.display()))
            })?;

        debug!(stored = %stored_filename, bytes = file_size, "attachment saved");
        Ok(SavedFile {
            stored_filename,
            file_path: file_path.to_string_lossy().into_owned(),
            file_size,
        })
    }

    /// Read stored attachment bytes; `None` when the file no longer exists
    pub async fn read(&self, file_path: &str) -> AppResult<Option<Vec<u8>>> {
        let path = PathBuf::from(file_path);
        task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            std::fs::read(&path)
                .map(Some)
                .map_err(|e| AppError::Storage(format!("failed to read {}: {e}", path.display())))
        })
        .await
        .map_err(|e| AppError::Storage(format!("attachment read task failed: {e}")))?
    }

    /// Delete a stored attachment; returns whether a file was removed
    pub async fn delete(&self, file_path: &str) -> AppResult<bool> {
        let path = PathBuf::from(file_path);
        task::spawn_blocking(move || {
            if !path.exists() {
                warn!(path = %path.display(), "attachment file already gone");
                return Ok(false);
            }
            std::fs::remove_file(&path)
                .map(|()| true)
                .map_err(|e| AppError::Storage(format!("failed to delete {}: {e}", path.display())))
        })
        .await
        .map_err(|e| AppError::Storage(format!("attachment delete task failed: {e}")))?
    }

    /// Remove files older than `days`; returns the number deleted
    ///
    /// Per-file failures are logged and skipped so one stubborn file does not
    /// abort the sweep.
    pub async fn cleanup_older_than(&self, days: u64) -> AppResult<u64> {
        let base_dir = self.base_dir.clone();
        let cutoff = std::time::SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(days * 24 * 3600))
            .ok_or_else(|| AppError::Storage("cleanup cutoff out of range".to_owned()))?;

        task::spawn_blocking(move || {
            let mut deleted = 0_u64;
            let entries = std::fs::read_dir(&base_dir).map_err(|e| {
                AppError::Storage(format!("failed to list {}: {e}", base_dir.display()))
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                let Ok(modified) = meta.modified() else { continue };
                if modified < cutoff {
                    match std::fs::remove_file(&path) {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete old file"),
                    }
                }
            }
            info!(deleted, "attachment cleanup finished");
            Ok(deleted)
        })
        .await
        .map_err(|e| AppError::Storage(format!("cleanup task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::AttachmentStore;

    fn temp_store(tag: &str) -> AttachmentStore {
        let dir = std::env::temp_dir().join(format!("mail-ingest-store-{tag}-{}", uuid::Uuid::new_v4()));
        AttachmentStore::new(dir).expect("store creation must succeed")
    }

    #[test]
    fn generated_name_carries_timestamp_uid_and_extension() {
        let received = Utc.with_ymd_and_hms(2025, 3, 9, 14, 5, 0).unwrap();
        let name = AttachmentStore::generate_filename("42", "报价.PDF", Some(received));
        assert!(name.starts_with("202503091405_42_"));
        assert!(name.ends_with(".PDF"));
    }

    #[test]
    fn generated_name_without_extension_has_no_trailing_dot() {
        let name = AttachmentStore::generate_filename("7", "README", None);
        assert!(!name.ends_with('.'));
        assert!(name.contains("_7_"));
    }

    #[test]
    fn generated_names_are_unique_for_identical_inputs() {
        let a = AttachmentStore::generate_filename("1", "a.txt", None);
        let b = AttachmentStore::generate_filename("1", "a.txt", None);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn save_read_delete_round_trip() {
        let store = temp_store("roundtrip");
        let saved = store
            .save("9", "invoice.pdf", b"pdf bytes".to_vec(), None)
            .await
            .expect("save must succeed");
        assert_eq!(saved.file_size, 9);

        let read_back = store
            .read(&saved.file_path)
            .await
            .expect("read must succeed")
            .expect("file must exist");
        assert_eq!(read_back, b"pdf bytes");

        assert!(store.delete(&saved.file_path).await.expect("delete must succeed"));
        assert!(store.read(&saved.file_path).await.expect("read must succeed").is_none());
        assert!(!store.delete(&saved.file_path).await.expect("second delete must succeed"));
    }

    #[tokio::test]
    async fn cleanup_spares_recent_files() {
        let store = temp_store("cleanup");
        store
            .save("3", "fresh.txt", b"fresh".to_vec(), None)
            .await
            .expect("save must succeed");
        let deleted = store.cleanup_older_than(30).await.expect("cleanup must succeed");
        assert_eq!(deleted, 0);
    }
}

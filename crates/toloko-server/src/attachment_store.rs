use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use toloko_shared::constants::{ALLOWED_ATTACHMENT_EXTENSIONS, ALLOWED_ATTACHMENT_TYPES};
use toloko_shared::MessageId;

use crate::error::ServerError;

/// Verify that a relative path stays within the base directory.
fn ensure_within(base: &Path, relative: &Path) -> Result<PathBuf, ServerError> {
    let mut resolved = base.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ServerError::BadRequest(
                    "Path traversal detected".to_string(),
                ));
            }
        }
    }
    if !resolved.starts_with(base) || resolved == base {
        return Err(ServerError::BadRequest("Invalid attachment path".to_string()));
    }
    Ok(resolved)
}

/// A file written by [`AttachmentStore::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Location relative to the store's base directory.
    pub relative_path: PathBuf,
    pub mime_type: String,
    pub size: u64,
}

/// Attachment files on local disk, grouped by message.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
    max_size: usize,
}

impl AttachmentStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Validate and write an uploaded file under `<message_id>/`.
    pub async fn store(
        &self,
        message: MessageId,
        file_name: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Result<StoredFile, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty file".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::PayloadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let mime_type = validate_content_type(content_type)?;
        let extension = validate_file_name(file_name)?;

        let relative_path =
            PathBuf::from(message.to_string()).join(format!("{}.{}", Uuid::new_v4(), extension));
        let path = ensure_within(&self.base_path, &relative_path)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| {
                ServerError::Storage(format!("Failed to create message directory: {e}"))
            })?;
        }
        fs::write(&path, data).await.map_err(|e| {
            ServerError::Storage(format!("Failed to write {}: {}", relative_path.display(), e))
        })?;

        debug!(path = %relative_path.display(), size = data.len(), "Stored attachment");

        Ok(StoredFile {
            relative_path,
            mime_type,
            size: data.len() as u64,
        })
    }

    pub async fn read(&self, relative: &Path) -> Result<Vec<u8>, ServerError> {
        let path = ensure_within(&self.base_path, relative)?;

        if !path.exists() {
            return Err(ServerError::NotFound("Attachment file"));
        }

        fs::read(&path).await.map_err(|e| {
            ServerError::Storage(format!("Failed to read {}: {}", relative.display(), e))
        })
    }

    /// Delete a stored file. A file that is already gone is not an error.
    pub async fn remove(&self, relative: &Path) -> Result<(), ServerError> {
        let path = ensure_within(&self.base_path, relative)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %relative.display(), "Deleted attachment file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::Storage(format!(
                "Failed to delete {}: {}",
                relative.display(),
                e
            ))),
        }
    }
}

fn validate_content_type(content_type: Option<&str>) -> Result<String, ServerError> {
    let content_type = content_type
        .map(|c| c.split(';').next().unwrap_or(c).trim().to_ascii_lowercase())
        .unwrap_or_default();

    if ALLOWED_ATTACHMENT_TYPES.contains(&content_type.as_str()) {
        Ok(content_type)
    } else {
        Err(ServerError::BadRequest(
            "File type not allowed. Only images are supported".to_string(),
        ))
    }
}

/// Returns the lowercased extension.
fn validate_file_name(file_name: &str) -> Result<String, ServerError> {
    if file_name.contains("..") || file_name.contains('/') || file_name.contains('\\') {
        return Err(ServerError::BadRequest("Invalid file name".to_string()));
    }

    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if ALLOWED_ATTACHMENT_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(ServerError::BadRequest("File extension not allowed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (AttachmentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(dir.path().to_path_buf(), 1024)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_read_remove() {
        let (store, _dir) = test_store().await;

        let stored = store
            .store(MessageId(3), "Photo.PNG", Some("image/png"), b"png-bytes")
            .await
            .unwrap();
        assert!(stored.relative_path.starts_with("3"));
        assert_eq!(stored.relative_path.extension().unwrap(), "png");
        assert_eq!(stored.mime_type, "image/png");
        assert_eq!(stored.size, 9);

        assert_eq!(store.read(&stored.relative_path).await.unwrap(), b"png-bytes");

        store.remove(&stored.relative_path).await.unwrap();
        assert!(matches!(
            store.read(&stored.relative_path).await,
            Err(ServerError::NotFound(_))
        ));
        // Removing twice is fine.
        store.remove(&stored.relative_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_disallowed_files() {
        let (store, _dir) = test_store().await;

        let wrong_type = store
            .store(MessageId(1), "a.png", Some("application/pdf"), b"x")
            .await;
        assert!(matches!(wrong_type, Err(ServerError::BadRequest(_))));

        let wrong_ext = store
            .store(MessageId(1), "a.exe", Some("image/png"), b"x")
            .await;
        assert!(matches!(wrong_ext, Err(ServerError::BadRequest(_))));

        let sneaky = store
            .store(MessageId(1), "../a.png", Some("image/png"), b"x")
            .await;
        assert!(matches!(sneaky, Err(ServerError::BadRequest(_))));

        let empty = store.store(MessageId(1), "a.png", Some("image/png"), b"").await;
        assert!(matches!(empty, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (store, _dir) = test_store().await;
        let big = vec![0u8; 2048];
        let result = store
            .store(MessageId(1), "big.jpg", Some("image/jpeg"), &big)
            .await;
        assert!(matches!(result, Err(ServerError::PayloadTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_traversal_rejected_on_read() {
        let (store, _dir) = test_store().await;
        assert!(store.read(Path::new("../../etc/passwd")).await.is_err());
        assert!(store.read(Path::new("/etc/passwd")).await.is_err());
    }
}

//! On-disk storage for uploaded documents and profile photos.
//!
//! Stored paths are relative to the upload root so the database never holds
//! absolute filesystem locations.

use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::UploadError;

const MAX_FILE_NAME_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub stored_path: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
}

/// Reduce a client-supplied name to a safe basename.
pub fn sanitize_file_name(raw: &str) -> String {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let mut out = String::with_capacity(base.len());
    let mut last_was_sep = false;
    for ch in base.chars() {
        let keep = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_');
        if keep {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_');
    let mut name: String = trimmed.chars().take(MAX_FILE_NAME_LEN).collect();
    if name.is_empty() {
        name = "file".to_string();
    }
    name
}

/// Declared part type when usable, otherwise guessed from the name.
pub fn content_type_for(file_name: &str, declared: Option<&str>) -> String {
    declared
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
        .map(|ct| ct.to_ascii_lowercase())
        .unwrap_or_else(|| {
            mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn save_document(
        &self,
        matter_id: Uuid,
        document_id: Uuid,
        original_name: &str,
        declared_type: Option<&str>,
        bytes: &[u8],
        limit: usize,
    ) -> Result<StoredFile, UploadError> {
        check_size(bytes, limit)?;
        let file_name = sanitize_file_name(original_name);
        let content_type = content_type_for(&file_name, declared_type);
        let relative = format!("documents/{matter_id}/{document_id}-{file_name}");
        self.write(&relative, bytes).await?;
        Ok(StoredFile {
            stored_path: relative,
            file_name,
            content_type,
            size_bytes: bytes.len() as i64,
        })
    }

    /// Photos must be `image/*`.
    pub async fn save_photo(
        &self,
        user_id: Uuid,
        original_name: &str,
        declared_type: Option<&str>,
        bytes: &[u8],
        limit: usize,
    ) -> Result<StoredFile, UploadError> {
        check_size(bytes, limit)?;
        let file_name = sanitize_file_name(original_name);
        let content_type = content_type_for(&file_name, declared_type);
        if !content_type.starts_with("image/") {
            return Err(UploadError::UnsupportedType(content_type));
        }
        let extension = Path::new(&file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default();
        let relative = format!("photos/{user_id}-{}{extension}", Uuid::new_v4());
        self.write(&relative, bytes).await?;
        Ok(StoredFile {
            stored_path: relative,
            file_name,
            content_type,
            size_bytes: bytes.len() as i64,
        })
    }

    pub async fn read(&self, stored_path: &str) -> Result<Vec<u8>, UploadError> {
        let path = self.resolve(stored_path)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| UploadError::Io(format!("{}: {}", stored_path, e)))
    }

    /// Best effort; a missing file is not an error.
    pub async fn remove(&self, stored_path: &str) {
        let path = match self.resolve(stored_path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("refusing to remove upload {}: {}", stored_path, e);
                return;
            }
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("removed upload {}", stored_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove upload {}: {}", stored_path, e),
        }
    }

    fn resolve(&self, stored_path: &str) -> Result<PathBuf, UploadError> {
        let relative = Path::new(stored_path);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || stored_path.is_empty() {
            return Err(UploadError::Io(format!(
                "stored path '{}' escapes the upload root",
                stored_path
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn write(&self, relative: &str, bytes: &[u8]) -> Result<(), UploadError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| UploadError::Io(e.to_string()))?;
        tracing::debug!(bytes = bytes.len(), "stored upload {}", relative);
        Ok(())
    }
}

fn check_size(bytes: &[u8], limit: usize) -> Result<(), UploadError> {
    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }
    if bytes.len() > limit {
        return Err(UploadError::TooLarge { limit });
    }
    Ok(())
}

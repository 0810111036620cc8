use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload is empty")]
    Empty,
    #[error("Upload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stores raw upload bytes and hands back an opaque reference.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn store(
        &self,
        user_id: &str,
        bytes: &[u8],
        original_name: Option<&str>,
    ) -> Result<String, UploadError>;
}

/// Content-addressed files under a local directory.
pub struct LocalUploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl LocalUploadStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }
}

/// `<sha256 hex>[.ext]`, keeping only a short alphanumeric extension.
fn upload_name(bytes: &[u8], original_name: Option<&str>) -> String {
    let digest = Sha256::digest(bytes);
    let ext = original_name
        .and_then(|n| n.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));

    match ext {
        Some(ext) => format!("{:x}.{}", digest, ext),
        None => format!("{:x}", digest),
    }
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    async fn store(
        &self,
        user_id: &str,
        bytes: &[u8],
        original_name: Option<&str>,
    ) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(UploadError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let name = upload_name(bytes, original_name);
        let path = self.dir.join(&name);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, bytes).await?;
        }

        info!(user_id, reference = %name, size = bytes.len(), "Stored upload");
        Ok(name)
    }
}

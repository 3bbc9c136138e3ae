//! Local file secret source.
//!
//! The identifier is a path (absolute, or relative to the configured base
//! directory). Editing the file rotates the secret.

use crate::secrets::{content_version, SecretSource, SourceError};
use async_trait::async_trait;
use std::path::PathBuf;

/// Maximum size of a secret file (1 MB).
const MAX_FILE_BYTES: u64 = 1024 * 1024;

pub struct FileSource {
    base_dir: Option<PathBuf>,
}

impl FileSource {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self { base_dir }
    }

    fn resolve(&self, identifier: &str) -> PathBuf {
        let path = PathBuf::from(identifier.strip_prefix("file://").unwrap_or(identifier));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    async fn read(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(identifier);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(identifier.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(SourceError::Rejected {
                identifier: identifier.to_string(),
                reason: "not a regular file".to_string(),
            });
        }
        if metadata.len() > MAX_FILE_BYTES {
            return Err(SourceError::Failed(format!(
                "'{}' is {} bytes, exceeds limit of {MAX_FILE_BYTES} bytes",
                path.display(),
                metadata.len()
            )));
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

#[async_trait]
impl SecretSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_value(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        self.read(identifier).await
    }

    async fn get_version(&self, identifier: &str) -> Result<String, SourceError> {
        let content = self.read(identifier).await?;
        Ok(content_version(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_relative_to_base() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("db.txt"), b"pw\x00\xff").unwrap();
        let source = FileSource::new(Some(dir.path().to_path_buf()));

        assert_eq!(source.get_value("db.txt").await.unwrap(), b"pw\x00\xff");
        let absolute = dir.path().join("db.txt");
        assert_eq!(
            source
                .get_value(&format!("file://{}", absolute.display()))
                .await
                .unwrap(),
            b"pw\x00\xff"
        );
    }

    #[tokio::test]
    async fn version_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, b"one").unwrap();
        let source = FileSource::new(None);
        let id = path.to_str().unwrap();

        let v1 = source.get_version(id).await.unwrap();
        assert_eq!(v1, source.get_version(id).await.unwrap());
        std::fs::write(&path, b"two").unwrap();
        assert_ne!(v1, source.get_version(id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let source = FileSource::new(None);
        assert!(matches!(
            source.get_value("/definitely/not/here").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_rejected() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(None);
        assert!(matches!(
            source.get_value(dir.path().to_str().unwrap()).await,
            Err(SourceError::Rejected { .. })
        ));
    }
}

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use iam_collector_core::{ResultStore, StorageDestination, StorageError};
use tokio::io::AsyncWriteExt;

/// Writes objects under `<root>/<bucket>/<key>`, refusing to replace existing files.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ResultStore for LocalDirStore {
    async fn put_object(&self, destination: &StorageDestination, key: &str, body: Vec<u8>) -> Result<(), StorageError> {
        let path = self.root.join(&destination.bucket).join(key);
        let fail = |e: std::io::Error| {
            let message = if e.kind() == ErrorKind::AlreadyExists { "object already exists".to_string() } else { e.to_string() };
            StorageError { key: path.display().to_string(), message }
        };
        let parent = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;

        // Written beside the final key and linked into place once complete; dropping the
        // future mid-write removes the temp file and leaves the key absent.
        let tmp = NamedTempFile::new_in(parent).map_err(fail)?;
        let mut file = tokio::fs::File::from_std(tmp.as_file().try_clone().map_err(fail)?);
        file.write_all(&body).await.map_err(fail)?;
        file.sync_all().await.map_err(fail)?;
        drop(file);
        tmp.persist_noclobber(&path).map_err(|e| fail(e.error))?;
        Ok(())
    }
}

use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use crate::fs::safe_write_all;

/// A filesystem backed store of JSON documents
///
/// Writes are atomic but there is no coordination between concurrent
/// writers of the same document.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("path must not have any `..` segments")]
    InvalidPath,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn document_path(&self, collection: &Path, key: &str) -> Result<PathBuf, StoreError> {
        let collection = collection.strip_prefix("/").unwrap_or(collection);
        if collection
            .components()
            .chain(Path::new(key).components())
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::InvalidPath);
        }
        Ok(self.root.join(collection).join(key).with_extension("json"))
    }

    /// Create or replace the document `key` under `collection`
    pub async fn write<P: AsRef<Path>, V: Serialize>(
        &self,
        collection: P,
        key: &str,
        value: &V,
    ) -> Result<(), StoreError> {
        let path = self.document_path(collection.as_ref(), key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let buf = serde_json::to_vec_pretty(value)?;
        trace!("writing {}", path.display());
        safe_write_all(&path, &buf).await?;
        Ok(())
    }

    /// Read the document `key` under `collection`, if it exists
    pub async fn read<P: AsRef<Path>, V: DeserializeOwned>(
        &self,
        collection: P,
        key: &str,
    ) -> Result<Option<V>, StoreError> {
        let path = self.document_path(collection.as_ref(), key)?;
        trace!("reading {}", path.display());

        match fs::read(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete the document `key` under `collection`.
    ///
    /// Deleting a missing document succeeds.
    pub async fn delete<P: AsRef<Path>>(&self, collection: P, key: &str) -> Result<(), StoreError> {
        let path = self.document_path(collection.as_ref(), key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        device_id: String,
        assigned_hub: String,
    }

    fn record() -> Record {
        Record {
            device_id: "dev-1".into(),
            assigned_hub: "hub.example.net".into(),
        }
    }

    #[tokio::test]
    async fn test_write_then_read_document() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("/", "registration", &record()).await.unwrap();
        assert!(dir.path().join("registration.json").exists());

        let read: Option<Record> = store.read("/", "registration").await.unwrap();
        assert_eq!(read, Some(record()));
    }

    #[tokio::test]
    async fn test_read_missing_document_returns_none() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let read: Option<Record> = store.read("/devices", "missing").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        store.write("/a", "doc", &record()).await.unwrap();
        store.delete("/a", "doc").await.unwrap();
        store.delete("/a", "doc").await.unwrap();

        let read: Option<Record> = store.read("/a", "doc").await.unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_rejects_parent_segments() {
        let dir = tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store.write("/../outside", "doc", &record()).await;
        assert!(matches!(res, Err(StoreError::InvalidPath)));

        let res: Result<Option<Record>, _> = store.read("/", "../doc").await;
        assert!(matches!(res, Err(StoreError::InvalidPath)));
    }
}

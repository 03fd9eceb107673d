// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A store that writes into a directory.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use super::{ObjectStore, StoreError};

/// A store that writes objects into a directory, using the object key as a
/// relative path. Handy for running without a bucket.
#[derive(Debug)]
pub struct LocalStore {
    directory: PathBuf,
}

impl LocalStore {
    /// Instantiate a new LocalStore writing into the provided directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        LocalStore {
            directory: directory.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(StoreError::InvalidKey(key.to_owned()));
        }
        Ok(self.directory.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::debug!(message = "writing object", path = ?path);
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use crate::store::{local::LocalStore, ObjectStore, StoreError};

    #[tokio::test]
    async fn test_local_store_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store
            .put("app/home/index/2025-03-20_16:41:24.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        let written = dir.path().join("app/home/index/2025-03-20_16:41:24.json");
        assert_eq!(tokio::fs::read(written).await.unwrap(), b"{}");
    }

    #[tokio::test]
    #[test_case("../escape.json"; "parent")]
    #[test_case("/etc/passwd"; "absolute")]
    #[test_case(""; "empty")]
    async fn test_local_store_rejects_key(key: &str) {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalStore::new(dir.path())
            .put(key, vec![], "text/csv")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)), "{err}");
    }
}

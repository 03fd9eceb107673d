// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Destinations for captured data.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

pub mod local;
#[cfg(feature = "s3-no-defaults")]
pub mod s3;

/// Error writing an object.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Local file system error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The key can't name an object in this store.
    #[error("invalid object key {0:?}")]
    InvalidKey(String),
    /// Error from the storage service or its client.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Abstraction around "put object at key K". One call, one object, no retry.
#[async_trait]
pub trait ObjectStore: fmt::Debug + Send + Sync {
    /// Writes `body` as the whole object at `key`, replacing any existing one.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        (**self).put(key, body, content_type).await
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{ObjectStore, StoreError};

    /// Keeps every put in memory.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        objects: Mutex<Vec<(String, Vec<u8>, String)>>,
        pub(crate) fail: bool,
    }

    impl MemoryStore {
        /// A store where every put fails.
        pub(crate) fn failing() -> Self {
            MemoryStore {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn objects(&self) -> Vec<(String, Vec<u8>, String)> {
            self.objects.lock().unwrap().clone()
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("bucket is on fire")]
    struct OnFire;

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Backend(Box::new(OnFire)));
            }
            self.objects
                .lock()
                .unwrap()
                .push((key.to_owned(), body, content_type.to_owned()));
            Ok(())
        }
    }
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A store for an S3 bucket.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::fmt;

use super::{ObjectStore, StoreError};

/// A store for one S3 bucket.
#[derive(Clone)]
pub struct S3Store {
    s3_client: aws_sdk_s3::Client,
    bucket_name: String,
}

impl S3Store {
    /// Makes a new one.
    pub fn new(s3_client: aws_sdk_s3::Client, bucket_name: impl Into<String>) -> Self {
        S3Store {
            s3_client,
            bucket_name: bucket_name.into(),
        }
    }

    /// The bucket objects are written to.
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        tracing::debug!(message="uploading to s3", bucket_name=?self.bucket_name, object_name=?key);
        self.s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|x| StoreError::Backend(Box::new(aws_sdk_s3::Error::from(x))))?;
        Ok(())
    }
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket_name", &self.bucket_name)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use aws_sdk_s3::operation::put_object::PutObjectOutput;
    use aws_smithy_mocks::{mock, mock_client};

    use super::*;

    #[tokio::test]
    async fn test_put_targets_bucket_and_key() {
        let put = mock!(aws_sdk_s3::Client::put_object)
            .match_requests(|req| {
                req.bucket() == Some("BucketName")
                    && req.key() == Some("app/home/index/2025-03-20_16:41:24.json")
                    && req.content_type() == Some("application/json")
            })
            .then_output(|| PutObjectOutput::builder().build());
        let client = mock_client!(aws_sdk_s3, [&put]);
        let store = S3Store::new(client, "BucketName");
        store
            .put(
                "app/home/index/2025-03-20_16:41:24.json",
                b"{}".to_vec(),
                "application/json",
            )
            .await
            .unwrap();
    }
}

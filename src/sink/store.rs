//! Remote Store
//!
//! `GcsClient` calls wrapped in the configured retry policy. Shared by every
//! file created from one factory.

use crate::sink::client::{BucketMetadata, GcsClient, ObjectMetadata, OCTET_STREAM_CONTENT_TYPE};
use crate::sink::error::{Operation, SinkError};
use crate::sink::path::ObjectPath;
use crate::sink::retry::{RetryExecutor, RetryPolicy};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

const PRECONDITION_FAILED: u16 = 412;

pub struct RemoteStore {
    client: GcsClient,
    retry: RetryExecutor,
}

impl RemoteStore {
    pub fn new(client: GcsClient, policy: RetryPolicy) -> Self {
        RemoteStore {
            client,
            retry: RetryExecutor::new(policy),
        }
    }

    pub fn client(&self) -> &GcsClient {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Upload `body` to `name`; retries resend the same bytes
    pub async fn upload(&self, name: &ObjectPath, body: Bytes) -> Result<ObjectMetadata, SinkError> {
        self.retry
            .run(Operation::Upload, name.as_str(), || {
                self.client
                    .upload(name, OCTET_STREAM_CONTENT_TYPE, body.clone())
            })
            .await
    }

    /// Replace `destination` with the ordered concatenation of `sources`
    pub async fn compose(
        &self,
        destination: &ObjectPath,
        sources: &[ObjectPath],
    ) -> Result<ObjectMetadata, SinkError> {
        self.retry
            .run(Operation::Compose, destination.as_str(), || {
                self.client
                    .compose(destination, sources, OCTET_STREAM_CONTENT_TYPE, None)
            })
            .await
    }

    /// Compose onto a destination that is also a source
    ///
    /// Repeating such a compose would append the new sources twice, so it is
    /// guarded by the destination's generation. When a retry is rejected with
    /// 412 after an attempt whose outcome is unknown, the earlier attempt is
    /// taken as applied if the destination now has `expected_size` bytes.
    pub async fn compose_replacing(
        &self,
        destination: &ObjectPath,
        sources: &[ObjectPath],
        generation: Option<&str>,
        expected_size: u64,
    ) -> Result<ObjectMetadata, SinkError> {
        let outcome_unknown = AtomicBool::new(false);
        let outcome_unknown = &outcome_unknown;

        self.retry
            .run(Operation::Compose, destination.as_str(), || async move {
                let err = match self
                    .client
                    .compose(destination, sources, OCTET_STREAM_CONTENT_TYPE, generation)
                    .await
                {
                    Ok(object) => return Ok(object),
                    Err(err) => err,
                };

                if err.failure().status() == Some(PRECONDITION_FAILED)
                    && outcome_unknown.load(Ordering::Relaxed)
                {
                    let current = self.client.object_metadata(destination).await?;
                    if current.size_bytes() == Some(expected_size) {
                        warn!(
                            object = %destination,
                            generation = current.generation.as_deref().unwrap_or(""),
                            "Compose already applied by an earlier attempt"
                        );
                        return Ok(current);
                    }
                }
                if err.is_retriable() {
                    outcome_unknown.store(true, Ordering::Relaxed);
                }
                Err(err)
            })
            .await
    }

    /// Delete `name`; returns false if it was already gone
    ///
    /// A retried delete may find its own earlier attempt already applied, so
    /// not-found counts as success.
    pub async fn delete_if_exists(&self, name: &ObjectPath) -> Result<bool, SinkError> {
        self.retry
            .run(Operation::Delete, name.as_str(), || async move {
                match self.client.delete(name).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// One bucket metadata request, never retried
    pub async fn verify_bucket(&self) -> Result<BucketMetadata, SinkError> {
        RetryExecutor::new(RetryPolicy::single_attempt())
            .run(Operation::GetBucket, self.client.bucket(), || {
                self.client.bucket_metadata()
            })
            .await
    }
}

//! JSON API Client
//!
//! Thin wrapper over the store's JSON API. Each method performs exactly one
//! HTTP exchange and classifies the outcome:
//!
//! ```text
//! 2xx                  ──► Ok
//! 500, 502, 503, 504   ──► RemoteError::Retriable
//! connect / timeout    ──► RemoteError::Retriable
//! anything else        ──► RemoteError::Fatal
//! ```
//!
//! Retrying is left to [`RetryExecutor`](crate::sink::RetryExecutor).

use crate::sink::config::ConfigError;
use crate::sink::credentials::CredentialProvider;
use crate::sink::error::{Failure, Operation, RemoteError};
use crate::sink::path::ObjectPath;
use crate::sink::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

/// Content type of every object the sink writes
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Content type of compose request bodies
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
/// Public JSON API endpoint
pub const DEFAULT_ENDPOINT: &str = "https://www.googleapis.com";
/// The store composes at most this many sources per request
pub const COMPOSE_SOURCES_MAX: usize = 32;

/// Body of a compose request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeRequest {
    pub destination: ComposeDestination,
    pub source_objects: Vec<SourceObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeDestination {
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceObject {
    pub name: String,
}

impl ComposeRequest {
    pub fn new(sources: &[ObjectPath], content_type: &str) -> Self {
        ComposeRequest {
            destination: ComposeDestination {
                content_type: content_type.to_string(),
            },
            source_objects: sources
                .iter()
                .map(|source| SourceObject {
                    name: source.as_str().to_string(),
                })
                .collect(),
        }
    }
}

/// Object resource returned by upload and compose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub name: String,
    pub bucket: String,
    /// Decimal string, as the API encodes 64-bit integers
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub generation: Option<String>,
}

impl ObjectMetadata {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.parse().ok()
    }
}

/// Bucket resource returned by startup verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadata {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

/// Client for one bucket
pub struct GcsClient {
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialProvider>,
    endpoint: Url,
    bucket: String,
}

impl GcsClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialProvider>,
        endpoint: &str,
        bucket: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ConfigError::Invalid {
            field: "endpoint",
            reason: e.to_string(),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("'{}' is not a base URL", endpoint),
            });
        }
        Ok(GcsClient {
            transport,
            credentials,
            endpoint,
            bucket: bucket.into(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create or replace `name` with `body`
    pub async fn upload(
        &self,
        name: &ObjectPath,
        content_type: &str,
        body: Bytes,
    ) -> Result<ObjectMetadata, RemoteError> {
        let mut url = self.url_for(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name.as_str());

        let request = HttpRequest::new(Method::Post, url)
            .header("Content-Type", content_type)
            .body(body);
        let response = self.exchange(Operation::Upload, name.as_str(), request).await?;
        parse_json(&response)
    }

    /// Replace `destination` with the concatenation of `sources`, in order
    ///
    /// With `if_generation_match`, the store rejects the compose with 412
    /// unless the destination's current generation equals it.
    pub async fn compose(
        &self,
        destination: &ObjectPath,
        sources: &[ObjectPath],
        content_type: &str,
        if_generation_match: Option<&str>,
    ) -> Result<ObjectMetadata, RemoteError> {
        if sources.is_empty() || sources.len() > COMPOSE_SOURCES_MAX {
            return Err(RemoteError::Fatal(Failure::Encode(format!(
                "compose takes 1..={} sources, got {}",
                COMPOSE_SOURCES_MAX,
                sources.len()
            ))));
        }

        let body = serde_json::to_vec(&ComposeRequest::new(sources, content_type))
            .map_err(|e| RemoteError::Fatal(Failure::Encode(e.to_string())))?;
        let mut url = self.url_for(&[
            "storage",
            "v1",
            "b",
            &self.bucket,
            "o",
            destination.as_str(),
            "compose",
        ]);
        if let Some(generation) = if_generation_match {
            url.query_pairs_mut()
                .append_pair("ifGenerationMatch", generation);
        }

        let request = HttpRequest::new(Method::Post, url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .body(Bytes::from(body));
        let response = self
            .exchange(Operation::Compose, destination.as_str(), request)
            .await?;
        parse_json(&response)
    }

    /// Remove `name`; a missing object is reported as a fatal 404
    pub async fn delete(&self, name: &ObjectPath) -> Result<(), RemoteError> {
        let url = self.url_for(&["storage", "v1", "b", &self.bucket, "o", name.as_str()]);
        self.exchange(Operation::Delete, name.as_str(), HttpRequest::new(Method::Delete, url))
            .await?;
        Ok(())
    }

    /// Fetch the current metadata of `name`
    pub async fn object_metadata(&self, name: &ObjectPath) -> Result<ObjectMetadata, RemoteError> {
        let url = self.url_for(&["storage", "v1", "b", &self.bucket, "o", name.as_str()]);
        let response = self
            .exchange(Operation::GetObject, name.as_str(), HttpRequest::new(Method::Get, url))
            .await?;
        parse_json(&response)
    }

    /// Fetch the configured bucket's metadata
    pub async fn bucket_metadata(&self) -> Result<BucketMetadata, RemoteError> {
        let url = self.url_for(&["storage", "v1", "b", &self.bucket]);
        let response = self
            .exchange(Operation::GetBucket, &self.bucket, HttpRequest::new(Method::Get, url))
            .await?;
        parse_json(&response)
    }

    async fn exchange(
        &self,
        operation: Operation,
        object: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, RemoteError> {
        let credential = self.credentials.credential().await.map_err(|e| {
            error!(%operation, object, error = %e, "No credential for request");
            RemoteError::Fatal(Failure::Credential(e.to_string()))
        })?;

        let mut request = request;
        for (name, value) in credential.request_headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(e) if e.is_transient() => {
                warn!(%operation, object, error = %e, "Request produced no response");
                return Err(RemoteError::Retriable(Failure::Transport(e.to_string())));
            }
            Err(e) => {
                error!(%operation, object, error = %e, "Request failed");
                return Err(RemoteError::Fatal(Failure::Transport(e.to_string())));
            }
        };

        if response.is_success() {
            debug!(%operation, object, status = response.status, "Request succeeded");
            return Ok(response);
        }

        let failure = RemoteError::from_status(response.status, response.body_text());
        match response.status {
            404 => debug!(%operation, object, "Object not found"),
            412 => debug!(%operation, object, "Precondition failed"),
            status if failure.is_retriable() => {
                warn!(%operation, object, status, body = %response.body_text(), "Store unavailable")
            }
            status => {
                error!(%operation, object, status, body = %response.body_text(), "Request rejected")
            }
        }
        Err(failure)
    }

    /// Endpoint with `segments` appended, each percent-encoded as one segment
    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .expect("endpoint validated as a base URL")
            .pop_if_empty()
            .extend(segments);
        url
    }
}

fn parse_json<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, RemoteError> {
    serde_json::from_slice(&response.body)
        .map_err(|e| RemoteError::Fatal(Failure::Decode(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::credentials::StaticCredentials;
    use crate::sink::memory::InMemoryGcs;

    fn client(gcs: &Arc<InMemoryGcs>) -> GcsClient {
        GcsClient::new(
            gcs.clone(),
            Arc::new(StaticCredentials::bearer("token")),
            "http://gcs.test",
            "bucket",
        )
        .unwrap()
    }

    fn path(name: &str) -> ObjectPath {
        ObjectPath::new(name).unwrap()
    }

    #[test]
    fn test_object_names_encoded_as_single_segment() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);
        let url = client.url_for(&["storage", "v1", "b", "bucket", "o", "dir/a b+c.rec"]);
        assert_eq!(
            url.as_str(),
            "http://gcs.test/storage/v1/b/bucket/o/dir%2Fa%20b+c.rec"
        );
    }

    #[test]
    fn test_endpoint_path_prefix_kept() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = GcsClient::new(
            gcs,
            Arc::new(StaticCredentials::bearer("token")),
            "http://localhost:4443/emulator/",
            "bucket",
        )
        .unwrap();
        let url = client.url_for(&["storage", "v1", "b", "bucket"]);
        assert_eq!(url.as_str(), "http://localhost:4443/emulator/storage/v1/b/bucket");
    }

    #[test]
    fn test_compose_request_shape() {
        let request = ComposeRequest::new(
            &[path("inflight/f"), path("inflight/f.part")],
            OCTET_STREAM_CONTENT_TYPE,
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "destination": { "contentType": "application/octet-stream" },
                "sourceObjects": [ { "name": "inflight/f" }, { "name": "inflight/f.part" } ]
            })
        );
    }

    #[tokio::test]
    async fn test_upload_compose_delete() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);

        let meta = client
            .upload(&path("w/a"), OCTET_STREAM_CONTENT_TYPE, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(meta.name, "w/a");
        assert_eq!(meta.size_bytes(), Some(3));

        client
            .upload(&path("w/b"), OCTET_STREAM_CONTENT_TYPE, Bytes::from_static(b"def"))
            .await
            .unwrap();
        let meta = client
            .compose(&path("p/c"), &[path("w/a"), path("w/b")], OCTET_STREAM_CONTENT_TYPE, None)
            .await
            .unwrap();
        assert_eq!(meta.size_bytes(), Some(6));
        assert_eq!(gcs.object("bucket", "p/c").unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(client.object_metadata(&path("p/c")).await.unwrap(), meta);

        client.delete(&path("w/a")).await.unwrap();
        assert!(gcs.object("bucket", "w/a").is_none());

        let missing = client.delete(&path("w/a")).await.unwrap_err();
        assert!(missing.is_not_found());
        assert!(!missing.is_retriable());
    }

    #[tokio::test]
    async fn test_every_request_is_authorized() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);
        client
            .upload(&path("w/a"), OCTET_STREAM_CONTENT_TYPE, Bytes::new())
            .await
            .unwrap();
        client.bucket_metadata().await.unwrap();
        client.delete(&path("w/a")).await.unwrap();

        let requests = gcs.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests
            .iter()
            .all(|r| r.authorization.as_deref() == Some("Bearer token")));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);

        gcs.fail_next(Operation::Upload, 503, 1);
        let err = client
            .upload(&path("w/a"), OCTET_STREAM_CONTENT_TYPE, Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(gcs.object("bucket", "w/a").is_none());

        gcs.fail_next(Operation::Upload, 403, 1);
        let err = client
            .upload(&path("w/a"), OCTET_STREAM_CONTENT_TYPE, Bytes::new())
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(err.failure().status(), Some(403));
    }

    #[tokio::test]
    async fn test_compose_generation_precondition() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);
        let meta = client
            .upload(&path("w/a"), OCTET_STREAM_CONTENT_TYPE, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let generation = meta.generation.clone().unwrap();

        let composed = client
            .compose(&path("w/a"), &[path("w/a")], OCTET_STREAM_CONTENT_TYPE, Some(&generation))
            .await
            .unwrap();
        assert_ne!(composed.generation, meta.generation);

        let stale = client
            .compose(&path("w/a"), &[path("w/a")], OCTET_STREAM_CONTENT_TYPE, Some(&generation))
            .await
            .unwrap_err();
        assert_eq!(stale.failure().status(), Some(412));
        assert!(!stale.is_retriable());
    }

    #[tokio::test]
    async fn test_compose_source_limit() {
        let gcs = Arc::new(InMemoryGcs::with_bucket("bucket"));
        let client = client(&gcs);
        let err = client
            .compose(&path("p/c"), &[], OCTET_STREAM_CONTENT_TYPE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Fatal(Failure::Encode(_))));
        assert!(gcs.requests().is_empty());
    }

    #[tokio::test]
    async fn test_missing_bucket() {
        let gcs = Arc::new(InMemoryGcs::new());
        let err = client(&gcs).bucket_metadata().await.unwrap_err();
        assert!(err.is_not_found());
    }
}

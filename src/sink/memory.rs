//! In-Memory Store Emulation
//!
//! An [`HttpTransport`] that answers the four JSON API endpoints the sink
//! uses from an in-process object map. Used by unit tests, integration tests
//! and the DST harness.
//!
//! Faults come from two sources:
//! - scripted: `fail_next` / `lose_next_response`, consumed in order per operation
//! - random: [`FaultConfig`] probabilities rolled on a seeded ChaCha RNG,
//!   applied to upload, compose and delete
//!
//! A *lost response* applies the operation and then reports a timeout,
//! which is what makes retried calls observe their own earlier effect.

use crate::sink::client::{BucketMetadata, ComposeRequest, ObjectMetadata};
use crate::sink::error::Operation;
use crate::sink::transport::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use url::Url;

/// Random fault probabilities per data request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultConfig {
    /// 503 before the operation is applied
    pub retriable_prob: f64,
    /// Operation applied, response replaced by a timeout
    pub lost_response_prob: f64,
    /// 403 before the operation is applied
    pub fatal_prob: f64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig::no_faults()
    }
}

impl FaultConfig {
    pub fn no_faults() -> Self {
        FaultConfig {
            retriable_prob: 0.0,
            lost_response_prob: 0.0,
            fatal_prob: 0.0,
        }
    }

    /// Transient faults only
    pub fn moderate() -> Self {
        FaultConfig {
            retriable_prob: 0.05,
            lost_response_prob: 0.02,
            fatal_prob: 0.0,
        }
    }

    /// Frequent transient faults plus occasional fatal ones
    pub fn chaos() -> Self {
        FaultConfig {
            retriable_prob: 0.2,
            lost_response_prob: 0.1,
            fatal_prob: 0.01,
        }
    }
}

/// Request counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsStats {
    pub requests: u64,
    /// Operations actually applied to the object map
    pub uploads: u64,
    pub composes: u64,
    pub deletes: u64,
    pub bucket_reads: u64,
    pub unauthorized: u64,
    pub not_found: u64,
    pub injected_retriable: u64,
    pub injected_fatal: u64,
    pub lost_responses: u64,
}

/// A request as the emulator saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub operation: Option<Operation>,
    /// Decoded object name (upload name, compose destination, delete target)
    pub object: Option<String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum ScriptedFault {
    Status(u16),
    LoseResponse,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    generation: u64,
}

#[derive(Debug)]
enum Route {
    Upload { bucket: String, object: Option<String> },
    Compose {
        bucket: String,
        object: String,
        if_generation_match: Option<String>,
    },
    Delete { bucket: String, object: String },
    GetObject { bucket: String, object: String },
    GetBucket { bucket: String },
    Unknown,
}

impl Route {
    fn operation(&self) -> Option<Operation> {
        match self {
            Route::Upload { .. } => Some(Operation::Upload),
            Route::Compose { .. } => Some(Operation::Compose),
            Route::Delete { .. } => Some(Operation::Delete),
            Route::GetObject { .. } => Some(Operation::GetObject),
            Route::GetBucket { .. } => Some(Operation::GetBucket),
            Route::Unknown => None,
        }
    }

    fn object(&self) -> Option<String> {
        match self {
            Route::Upload { object, .. } => object.clone(),
            Route::Compose { object, .. }
            | Route::Delete { object, .. }
            | Route::GetObject { object, .. } => Some(object.clone()),
            Route::GetBucket { .. } | Route::Unknown => None,
        }
    }
}

struct GcsState {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), StoredObject>,
    required_token: Option<String>,
    scripted: HashMap<Operation, VecDeque<ScriptedFault>>,
    faults: FaultConfig,
    rng: ChaCha8Rng,
    next_generation: u64,
    stats: GcsStats,
    requests: Vec<RecordedRequest>,
}

/// In-process emulation of the store's JSON API
pub struct InMemoryGcs {
    state: Mutex<GcsState>,
}

impl Default for InMemoryGcs {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGcs {
    /// An emulator with no buckets and no faults
    pub fn new() -> Self {
        InMemoryGcs {
            state: Mutex::new(GcsState {
                buckets: BTreeSet::new(),
                objects: BTreeMap::new(),
                required_token: None,
                scripted: HashMap::new(),
                faults: FaultConfig::no_faults(),
                rng: ChaCha8Rng::seed_from_u64(0),
                next_generation: 1,
                stats: GcsStats::default(),
                requests: Vec::new(),
            }),
        }
    }

    pub fn with_bucket(bucket: &str) -> Self {
        let gcs = Self::new();
        gcs.create_bucket(bucket);
        gcs
    }

    /// Emulator whose data requests fail at random, reproducibly for `seed`
    pub fn with_faults(bucket: &str, faults: FaultConfig, seed: u64) -> Self {
        let gcs = Self::with_bucket(bucket);
        {
            let mut state = gcs.state.lock();
            state.faults = faults;
            state.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        gcs
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().buckets.insert(bucket.to_string());
    }

    /// Reject requests without `Authorization: Bearer <token>` with 401
    pub fn require_token(&self, token: &str) {
        self.state.lock().required_token = Some(token.to_string());
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.state.lock().faults = faults;
    }

    /// Answer the next `times` requests for `operation` with `status`, unapplied
    pub fn fail_next(&self, operation: Operation, status: u16, times: usize) {
        let mut state = self.state.lock();
        let queue = state.scripted.entry(operation).or_default();
        queue.extend(std::iter::repeat(ScriptedFault::Status(status)).take(times));
    }

    /// Apply the next `times` requests for `operation`, then report a timeout
    pub fn lose_next_response(&self, operation: Operation, times: usize) {
        let mut state = self.state.lock();
        let queue = state.scripted.entry(operation).or_default();
        queue.extend(std::iter::repeat(ScriptedFault::LoseResponse).take(times));
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|object| object.data.clone())
    }

    /// Metadata as an object GET would report it
    pub fn object_metadata(&self, bucket: &str, name: &str) -> Option<ObjectMetadata> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|object| ObjectMetadata {
                name: name.to_string(),
                bucket: bucket.to_string(),
                size: object.data.len().to_string(),
                content_type: Some(object.content_type.clone()),
                generation: Some(object.generation.to_string()),
            })
    }

    /// Object names in `bucket`, sorted
    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Store an object directly, bypassing faults and accounting
    pub fn put_object(&self, bucket: &str, name: &str, data: Bytes) {
        let mut state = self.state.lock();
        let generation = state.bump_generation();
        state.objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                data,
                content_type: crate::sink::client::OCTET_STREAM_CONTENT_TYPE.to_string(),
                generation,
            },
        );
    }

    pub fn stats(&self) -> GcsStats {
        self.state.lock().stats.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let route = route(request.method, &request.url);
        let mut state = self.state.lock();
        state.stats.requests += 1;
        state.requests.push(RecordedRequest {
            method: request.method,
            operation: route.operation(),
            object: route.object(),
            authorization: request.header_value("authorization").map(str::to_string),
            content_type: request.header_value("content-type").map(str::to_string),
            headers: request.headers.clone(),
            body: request.body.clone().unwrap_or_default(),
        });

        let expected = state
            .required_token
            .as_ref()
            .map(|token| format!("Bearer {}", token));
        if let Some(expected) = expected {
            if request.header_value("authorization") != Some(expected.as_str()) {
                state.stats.unauthorized += 1;
                return Ok(error_response(401, "Invalid Credentials"));
            }
        }

        let Some(operation) = route.operation() else {
            return Ok(error_response(400, "Unsupported request"));
        };

        let scripted = state
            .scripted
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        let mut lose_response = false;
        match scripted {
            Some(ScriptedFault::Status(status)) => {
                return Ok(error_response(status, "Injected failure"));
            }
            Some(ScriptedFault::LoseResponse) => lose_response = true,
            None if operation != Operation::GetBucket => {
                let faults = state.faults;
                let roll: f64 = state.rng.gen();
                if roll < faults.fatal_prob {
                    state.stats.injected_fatal += 1;
                    return Ok(error_response(403, "Injected fatal failure"));
                } else if roll < faults.fatal_prob + faults.retriable_prob {
                    state.stats.injected_retriable += 1;
                    return Ok(error_response(503, "Backend Error"));
                } else if roll < faults.fatal_prob + faults.retriable_prob + faults.lost_response_prob
                {
                    lose_response = true;
                }
            }
            None => {}
        }

        let response = state.apply(route, request.body.unwrap_or_default());
        if response.status == 404 {
            state.stats.not_found += 1;
        }
        if lose_response {
            state.stats.lost_responses += 1;
            return Err(TransportError::Timeout("response lost".to_string()));
        }
        Ok(response)
    }
}

impl GcsState {
    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn apply(&mut self, route: Route, body: Bytes) -> HttpResponse {
        match route {
            Route::Upload { bucket, object } => {
                let Some(object) = object else {
                    return error_response(400, "Missing object name or uploadType=media");
                };
                if !self.buckets.contains(&bucket) {
                    return error_response(404, "The specified bucket does not exist.");
                }
                self.stats.uploads += 1;
                self.store(bucket, object, body, crate::sink::client::OCTET_STREAM_CONTENT_TYPE)
            }
            Route::Compose {
                bucket,
                object,
                if_generation_match,
            } => {
                if !self.buckets.contains(&bucket) {
                    return error_response(404, "The specified bucket does not exist.");
                }
                if let Some(expected) = if_generation_match {
                    let current = self
                        .objects
                        .get(&(bucket.clone(), object.clone()))
                        .map_or(0, |stored| stored.generation);
                    if expected != current.to_string() {
                        return error_response(412, "At least one of the pre-conditions you specified did not hold.");
                    }
                }
                let request: ComposeRequest = match serde_json::from_slice(&body) {
                    Ok(request) => request,
                    Err(e) => return error_response(400, &format!("Invalid compose request: {}", e)),
                };
                if request.source_objects.is_empty() {
                    return error_response(400, "At least one source object is required.");
                }

                let mut data = BytesMut::new();
                for source in &request.source_objects {
                    match self.objects.get(&(bucket.clone(), source.name.clone())) {
                        Some(stored) => data.extend_from_slice(&stored.data),
                        None => {
                            return error_response(404, &format!("No such object: {}/{}", bucket, source.name))
                        }
                    }
                }
                self.stats.composes += 1;
                let content_type = request.destination.content_type;
                self.store(bucket, object, data.freeze(), &content_type)
            }
            Route::Delete { bucket, object } => {
                if self.objects.remove(&(bucket.clone(), object.clone())).is_none() {
                    return error_response(404, &format!("No such object: {}/{}", bucket, object));
                }
                self.stats.deletes += 1;
                HttpResponse::new(200, Bytes::new())
            }
            Route::GetObject { bucket, object } => {
                let Some(stored) = self.objects.get(&(bucket.clone(), object.clone())) else {
                    return error_response(404, &format!("No such object: {}/{}", bucket, object));
                };
                json_response(&ObjectMetadata {
                    size: stored.data.len().to_string(),
                    content_type: Some(stored.content_type.clone()),
                    generation: Some(stored.generation.to_string()),
                    name: object,
                    bucket,
                })
            }
            Route::GetBucket { bucket } => {
                if !self.buckets.contains(&bucket) {
                    return error_response(404, "The specified bucket does not exist.");
                }
                self.stats.bucket_reads += 1;
                json_response(&BucketMetadata {
                    name: bucket,
                    location: Some("EMULATED".to_string()),
                    storage_class: Some("STANDARD".to_string()),
                })
            }
            Route::Unknown => error_response(400, "Unsupported request"),
        }
    }

    fn store(&mut self, bucket: String, object: String, data: Bytes, content_type: &str) -> HttpResponse {
        let generation = self.bump_generation();
        let metadata = ObjectMetadata {
            name: object.clone(),
            bucket: bucket.clone(),
            size: data.len().to_string(),
            content_type: Some(content_type.to_string()),
            generation: Some(generation.to_string()),
        };
        self.objects.insert(
            (bucket, object),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                generation,
            },
        );
        json_response(&metadata)
    }
}

impl HttpTransport for InMemoryGcs {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move { self.handle(request) })
    }
}

fn route(method: Method, url: &Url) -> Route {
    let segments: Vec<String> = url
        .path_segments()
        .map(|segments| {
            segments
                .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let Some(start) = segments
        .windows(2)
        .position(|pair| pair[0] == "storage" && pair[1] == "v1")
    else {
        return Route::Unknown;
    };
    let is_upload = start > 0 && segments[start - 1] == "upload";
    let rest: Vec<&str> = segments[start + 2..].iter().map(String::as_str).collect();

    match (method, is_upload, rest.as_slice()) {
        (Method::Post, true, ["b", bucket, "o"]) => {
            let mut name = None;
            let mut media = false;
            for (key, value) in url.query_pairs() {
                match key.as_ref() {
                    "name" => name = Some(value.into_owned()),
                    "uploadType" => media = value == "media",
                    _ => {}
                }
            }
            Route::Upload {
                bucket: bucket.to_string(),
                object: name.filter(|_| media),
            }
        }
        (Method::Post, false, ["b", bucket, "o", object, "compose"]) => Route::Compose {
            bucket: bucket.to_string(),
            object: object.to_string(),
            if_generation_match: url
                .query_pairs()
                .find(|(key, _)| key == "ifGenerationMatch")
                .map(|(_, value)| value.into_owned()),
        },
        (Method::Delete, false, ["b", bucket, "o", object]) => Route::Delete {
            bucket: bucket.to_string(),
            object: object.to_string(),
        },
        (Method::Get, false, ["b", bucket, "o", object]) => Route::GetObject {
            bucket: bucket.to_string(),
            object: object.to_string(),
        },
        (Method::Get, false, ["b", bucket]) => Route::GetBucket {
            bucket: bucket.to_string(),
        },
        _ => Route::Unknown,
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => HttpResponse::new(200, body),
        Err(e) => error_response(500, &e.to_string()),
    }
}

fn error_response(status: u16, message: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "code": status, "message": message } });
    HttpResponse::new(status, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_routes() {
        assert!(matches!(
            route(Method::Post, &url("http://h/upload/storage/v1/b/bkt/o?uploadType=media&name=a%2Fb")),
            Route::Upload { ref bucket, object: Some(ref o) } if bucket == "bkt" && o == "a/b"
        ));
        assert!(matches!(
            route(Method::Post, &url("http://h/upload/storage/v1/b/bkt/o?uploadType=multipart&name=a")),
            Route::Upload { object: None, .. }
        ));
        assert!(matches!(
            route(Method::Post, &url("http://h/storage/v1/b/bkt/o/dir%2Ff/compose")),
            Route::Compose { ref object, .. } if object == "dir/f"
        ));
        assert!(matches!(
            route(Method::Delete, &url("http://h/prefix/storage/v1/b/bkt/o/dir%2Ff")),
            Route::Delete { ref object, .. } if object == "dir/f"
        ));
        assert!(matches!(
            route(Method::Get, &url("http://h/storage/v1/b/bkt")),
            Route::GetBucket { ref bucket } if bucket == "bkt"
        ));
        assert!(matches!(route(Method::Get, &url("http://h/other")), Route::Unknown));
    }

    #[tokio::test]
    async fn test_scripted_faults_consumed_in_order() {
        let gcs = InMemoryGcs::with_bucket("bkt");
        gcs.fail_next(Operation::Delete, 503, 1);
        gcs.lose_next_response(Operation::Delete, 1);
        gcs.put_object("bkt", "a", Bytes::from_static(b"x"));

        let delete = || HttpRequest::new(Method::Delete, url("http://h/storage/v1/b/bkt/o/a"));

        let metadata = gcs.object_metadata("bkt", "a").unwrap();
        assert_eq!(metadata.size_bytes(), Some(1));
        assert_eq!(metadata.content_type.as_deref(), Some("application/octet-stream"));

        assert_eq!(gcs.execute(delete()).await.unwrap().status, 503);
        assert!(gcs.object("bkt", "a").is_some());

        assert!(gcs.execute(delete()).await.is_err());
        assert!(gcs.object("bkt", "a").is_none());

        assert_eq!(gcs.execute(delete()).await.unwrap().status, 404);
        let stats = gcs.stats();
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.lost_responses, 1);
    }

    #[tokio::test]
    async fn test_token_required() {
        let gcs = InMemoryGcs::with_bucket("bkt");
        gcs.require_token("secret");
        let get = HttpRequest::new(Method::Get, url("http://h/storage/v1/b/bkt"));

        assert_eq!(gcs.execute(get.clone()).await.unwrap().status, 401);
        let authorized = get.header("Authorization", "Bearer secret");
        assert_eq!(gcs.execute(authorized).await.unwrap().status, 200);
        assert_eq!(gcs.stats().unauthorized, 1);
    }

    #[tokio::test]
    async fn test_random_faults_reproducible() {
        async fn run(seed: u64) -> GcsStats {
            let gcs = InMemoryGcs::with_faults("bkt", FaultConfig::chaos(), seed);
            for i in 0..200 {
                let request = HttpRequest::new(
                    Method::Post,
                    url(&format!("http://h/upload/storage/v1/b/bkt/o?uploadType=media&name=o{}", i)),
                )
                .body(Bytes::from_static(b"data"));
                let _ = gcs.execute(request).await;
            }
            gcs.stats()
        }

        let first = run(99).await;
        assert_eq!(first, run(99).await);
        assert!(first.injected_retriable > 0);
        assert!(first.lost_responses > 0);
    }
}

//! Object Store Append Sink
//!
//! Accumulates records and publishes them as a single immutable object in a
//! remote object store that only offers upload, compose and delete. There is
//! no append primitive, so appends are emulated with server-side composition.
//!
//! ## Architecture
//!
//! ```text
//! append ──► RecordBuffer (bounded, N records)
//!                │ sync / close_and_publish
//!                ▼
//!          RecordEncoder ──► RetargetingWriter ──► upload body (one per part)
//!                                                     │
//!                                     upload <working_dir>/<name>.part
//!                                                     │
//!                compose [<working_dir>/<name>, <working_dir>/<name>.part]
//!                    ──► <working_dir>/<name>        (sync)
//!                    ──► <publish_dir>/<name>        (close_and_publish)
//! ```
//!
//! ## Key Properties
//!
//! - **Never half-published**: only the final compose writes the publish path
//! - **Idempotent retries**: every call targets a fixed object name and
//!   resends identical bytes
//! - **One encoder per file**: header, block counter and running checksum
//!   survive across independent upload bodies

pub mod buffer;
pub mod client;
pub mod config;
pub mod credentials;
pub mod dst;
pub mod encoder;
pub mod error;
pub mod factory;
pub mod file;
pub mod memory;
pub mod path;
pub mod retarget;
pub mod retry;
pub mod store;
pub mod transport;

pub use buffer::RecordBuffer;
pub use client::{
    BucketMetadata, ComposeRequest, GcsClient, ObjectMetadata, SourceObject, DEFAULT_ENDPOINT,
    JSON_CONTENT_TYPE, OCTET_STREAM_CONTENT_TYPE,
};
pub use config::{ConfigError, RetryConfig, SinkConfig};
pub use credentials::{
    Credential, CredentialError, CredentialProvider, MetadataServerCredentials, StaticCredentials,
};
pub use dst::{
    run_dst_batch, summarize_batch, SinkDSTConfig, SinkDSTHarness, SinkDSTResult, SinkOperation,
};
pub use encoder::{DecodeError, DecodedStream, RecordEncoder, RecordReader, StreamHeader, SyncMarker};
pub use error::{is_retriable_status, Failure, Operation, RemoteError, SinkError};
pub use factory::{FileManager, SinkFactory};
pub use file::{FileState, FileStats, PublishOutcome, SinkFile};
pub use memory::{FaultConfig, GcsStats, InMemoryGcs, RecordedRequest};
pub use path::{FilePaths, ObjectPath, PART_SUFFIX};
pub use retarget::RetargetingWriter;
pub use retry::{RetryExecutor, RetryPolicy};
pub use store::RemoteStore;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, TransportError};

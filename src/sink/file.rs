//! Sink File
//!
//! One logical file being written to the store. Records are buffered in
//! memory and pushed out by `sync` as a part object that is composed onto the
//! end of the inflight object:
//!
//! ```text
//!            append*            sync                    close_and_publish
//! ┌──────┐ ─────────► ┌──────┐ ─────► ┌──────┐ ──────────────────────────► ┌───────────┐
//! │ open │            │ Open │        │ Open │                             │ Published │
//! └──────┘            └──────┘        └──────┘ ──┐                         └───────────┘
//!                                        │        │ remote failure          ┌───────────┐
//!                                        │        └───────────────────────► │  Failed   │
//!                                        │ discard                          └─────┬─────┘
//!                                        ▼                                        │ discard
//!                                  ┌───────────┐ ◄───────────────────────────────┘
//!                                  │ Discarded │
//!                                  └───────────┘
//! ```
//!
//! Only `close_and_publish` ever writes the publish path, and it does so with
//! a single compose. Until that compose succeeds the file's data lives only
//! under the working directory.
//!
//! All mutating operations take `&mut self`: one operation at a time per file.

use crate::sink::buffer::RecordBuffer;
use crate::sink::client::ObjectMetadata;
use crate::sink::encoder::{RecordEncoder, SyncMarker, HEADER_LEN};
use crate::sink::error::SinkError;
use crate::sink::path::FilePaths;
use crate::sink::retarget::RetargetingWriter;
use crate::sink::store::RemoteStore;
use bytes::buf::Writer;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upload body under construction
type BodyWriter = Writer<BytesMut>;

/// Lifecycle state of a sink file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    /// Accepting appends and syncs
    Open,
    /// Publish path written and transient objects cleaned up
    Published,
    /// Abandoned; transient objects deleted where possible
    Discarded,
    /// A sync or publish failed; only `discard` is allowed
    Failed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileState::Open => "open",
            FileState::Published => "published",
            FileState::Discarded => "discarded",
            FileState::Failed => "failed",
        })
    }
}

/// Counters for one file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    /// Successful syncs (not counting the publish)
    pub syncs: u64,
    pub parts_uploaded: u64,
    /// Records composed into the inflight or publish object
    pub records_synced: u64,
    /// Header and part bytes uploaded (each body counted once)
    pub bytes_uploaded: u64,
}

/// Result of a successful `close_and_publish`
#[derive(Debug)]
pub struct PublishOutcome {
    /// The published object
    pub object: ObjectMetadata,
    /// Transient objects that could not be deleted
    pub cleanup_failures: Vec<SinkError>,
}

impl PublishOutcome {
    pub fn is_clean(&self) -> bool {
        self.cleanup_failures.is_empty()
    }
}

pub struct SinkFile {
    name: String,
    paths: FilePaths,
    state: FileState,
    buffer: RecordBuffer,
    encoder: RecordEncoder<RetargetingWriter<BodyWriter>>,
    /// A part upload has been attempted; the object may exist
    part_written: bool,
    /// A publish compose was issued; its outcome may be unknown
    publish_attempted: bool,
    /// Generation and size of the inflight object as last reported
    inflight_generation: Option<String>,
    inflight_size: u64,
    stats: FileStats,
    store: Arc<RemoteStore>,
}

impl SinkFile {
    /// Create the file by uploading the stream header as the inflight object
    pub(crate) async fn open(
        store: Arc<RemoteStore>,
        name: &str,
        paths: FilePaths,
        capacity: usize,
        sync_marker: SyncMarker,
    ) -> Result<Self, SinkError> {
        let mut writer = RetargetingWriter::new();
        writer.attach(BytesMut::with_capacity(HEADER_LEN).writer())?;
        let mut encoder = RecordEncoder::new(writer, sync_marker)?;
        let header = detach_body(&mut encoder)?;
        let header_len = header.len() as u64;

        let inflight = match store.upload(&paths.inflight, header).await {
            Ok(object) => object,
            Err(e) => {
                error!(file = name, inflight = %paths.inflight, error = %e, "Failed to create inflight object");
                // A lost response may have left the header behind.
                if let Err(cleanup) = store.delete_if_exists(&paths.inflight).await {
                    warn!(file = name, inflight = %paths.inflight, error = %cleanup, "Could not remove inflight object");
                }
                return Err(e);
            }
        };

        warn_if_unguarded(name, &inflight);
        info!(file = name, inflight = %paths.inflight, capacity, "Opened sink file");
        Ok(SinkFile {
            name: name.to_string(),
            paths,
            state: FileState::Open,
            buffer: RecordBuffer::new(capacity),
            encoder,
            part_written: false,
            publish_attempted: false,
            inflight_size: inflight.size_bytes().unwrap_or(header_len),
            inflight_generation: inflight.generation,
            stats: FileStats {
                bytes_uploaded: header_len,
                ..FileStats::default()
            },
            store,
        })
    }

    /// Buffer a record; no I/O
    pub fn append(&mut self, record: impl Into<Bytes>) -> Result<(), SinkError> {
        self.ensure_open("append")?;
        let record = record.into();
        if u32::try_from(record.len()).is_err() {
            return Err(SinkError::Encoding(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record of {} bytes exceeds the 4 GiB record limit", record.len()),
            )));
        }
        self.buffer.push(record)
    }

    /// Push buffered records to the store and fold them into the inflight object
    ///
    /// With an empty buffer the inflight object is composed onto itself.
    pub async fn sync(&mut self) -> Result<(), SinkError> {
        self.ensure_open("sync")?;
        match self.write_buffer_and_compose(false).await {
            Ok(object) => {
                self.stats.syncs += 1;
                debug!(
                    file = %self.name,
                    inflight = %self.paths.inflight,
                    size = %object.size,
                    records_synced = self.stats.records_synced,
                    "Synced"
                );
                Ok(())
            }
            Err(e) => {
                self.state = FileState::Failed;
                error!(file = %self.name, error = %e, "Sync failed");
                Err(e)
            }
        }
    }

    /// Final sync into the publish path, then delete the transient objects
    ///
    /// Cleanup failures are reported in the outcome; the file is published
    /// regardless.
    pub async fn close_and_publish(&mut self) -> Result<PublishOutcome, SinkError> {
        self.ensure_open("close_and_publish")?;
        self.publish_attempted = true;
        let publish = self.paths.publish.clone();

        let object = match self.write_buffer_and_compose(true).await {
            Ok(object) => object,
            Err(e) => {
                self.state = FileState::Failed;
                error!(file = %self.name, publish = %publish, error = %e, "Publish failed");
                return Err(e);
            }
        };
        self.state = FileState::Published;

        let mut transient = Vec::with_capacity(2);
        if self.part_written {
            transient.push(self.paths.part.clone());
        }
        transient.push(self.paths.inflight.clone());

        let mut cleanup_failures = Vec::new();
        for object_path in &transient {
            if let Err(e) = self.store.delete_if_exists(object_path).await {
                error!(file = %self.name, object = %object_path, error = %e, "Cleanup after publish failed");
                cleanup_failures.push(e);
            }
        }

        info!(
            file = %self.name,
            publish = %publish,
            size = %object.size,
            records = self.stats.records_synced,
            leftover = cleanup_failures.len(),
            "Published"
        );
        Ok(PublishOutcome {
            object,
            cleanup_failures,
        })
    }

    /// Abandon the file, deleting whatever transient objects exist
    ///
    /// Deletion failures are logged, not returned; the count of objects that
    /// could not be removed is.
    pub async fn discard(&mut self) -> Result<usize, SinkError> {
        match self.state {
            FileState::Open | FileState::Failed => {}
            state => {
                return Err(SinkError::InvalidState {
                    operation: "discard",
                    state,
                })
            }
        }

        let mut targets = Vec::with_capacity(3);
        if self.part_written {
            targets.push(self.paths.part.clone());
        }
        targets.push(self.paths.inflight.clone());
        if self.publish_attempted {
            // A publish compose may have landed even though it reported failure.
            targets.push(self.paths.publish.clone());
        }

        let mut leftover = 0;
        for object_path in &targets {
            if let Err(e) = self.store.delete_if_exists(object_path).await {
                warn!(file = %self.name, object = %object_path, error = %e, "Could not delete during discard");
                leftover += 1;
            }
        }

        self.buffer.clear();
        self.state = FileState::Discarded;
        info!(file = %self.name, leftover, "Discarded");
        Ok(leftover)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &FilePaths {
        &self.paths
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn stats(&self) -> FileStats {
        self.stats
    }

    /// Records buffered since the last sync
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// The next `append` would fail; call `sync` first
    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    pub fn part_written(&self) -> bool {
        self.part_written
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), SinkError> {
        if self.state == FileState::Open {
            Ok(())
        } else {
            Err(SinkError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Upload pending records as the part (if any), then compose
    /// `[inflight, part]` into the publish path or back into the inflight path
    async fn write_buffer_and_compose(&mut self, publish: bool) -> Result<ObjectMetadata, SinkError> {
        let mut expected_size = self.inflight_size;
        let mut records = 0;
        let sources = if self.buffer.is_empty() {
            vec![self.paths.inflight.clone()]
        } else {
            let body = self.encode_buffer()?;
            let body_len = body.len() as u64;
            // A lost response can leave the part behind even if the upload fails.
            self.part_written = true;
            self.store.upload(&self.paths.part, body).await?;

            self.stats.parts_uploaded += 1;
            self.stats.bytes_uploaded += body_len;
            records = self.buffer.len() as u64;
            self.buffer.clear();
            expected_size += body_len;
            vec![self.paths.inflight.clone(), self.paths.part.clone()]
        };

        if publish {
            let object = self.store.compose(&self.paths.publish, &sources).await?;
            self.stats.records_synced += records;
            return Ok(object);
        }

        let object = self
            .store
            .compose_replacing(
                &self.paths.inflight,
                &sources,
                self.inflight_generation.as_deref(),
                expected_size,
            )
            .await?;
        self.stats.records_synced += records;
        warn_if_unguarded(&self.name, &object);
        self.inflight_generation = object.generation.clone();
        self.inflight_size = object.size_bytes().unwrap_or(expected_size);
        Ok(object)
    }

    /// Encode the buffer into a fresh body, exactly once per part
    fn encode_buffer(&mut self) -> Result<Bytes, SinkError> {
        let capacity = self.buffer.pending_bytes() + 4 * self.buffer.len() + 64;
        self.encoder
            .get_mut()
            .attach(BytesMut::with_capacity(capacity).writer())?;
        let encoded = self
            .encoder
            .append(self.buffer.records())
            .and_then(|_| self.encoder.flush());
        let body = detach_body(&mut self.encoder);
        encoded?;
        Ok(body?)
    }
}

impl Drop for SinkFile {
    fn drop(&mut self) {
        if matches!(self.state, FileState::Open | FileState::Failed) {
            warn!(
                file = %self.name,
                state = %self.state,
                inflight = %self.paths.inflight,
                "Sink file dropped without publish or discard; transient objects remain"
            );
        }
    }
}

impl fmt::Debug for SinkFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkFile")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("part_written", &self.part_written)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Without a generation the next inflight compose cannot carry a precondition
fn warn_if_unguarded(file: &str, object: &ObjectMetadata) {
    if object.generation.is_none() {
        warn!(
            file,
            object = %object.name,
            "Store returned no generation; next compose is not guarded against replay"
        );
    }
}

fn detach_body(
    encoder: &mut RecordEncoder<RetargetingWriter<BodyWriter>>,
) -> io::Result<Bytes> {
    let writer = encoder.get_mut().detach()?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no upload body attached")
    })?;
    Ok(writer.into_inner().freeze())
}

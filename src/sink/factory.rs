//! Sink Factory
//!
//! Startup verification and file construction. A process builds one
//! `SinkFactory`, calls `verify_file_system_configuration` before accepting
//! any record, then creates files through it (or through a cloned
//! `FileManager` handed to worker tasks).

use crate::sink::client::{BucketMetadata, GcsClient};
use crate::sink::config::SinkConfig;
use crate::sink::credentials::CredentialProvider;
use crate::sink::encoder::SyncMarker;
use crate::sink::error::SinkError;
use crate::sink::file::SinkFile;
use crate::sink::path::{validate_directory, FilePaths};
use crate::sink::retry::RetryPolicy;
use crate::sink::store::RemoteStore;
use crate::sink::transport::{HttpTransport, ReqwestTransport};
use std::sync::Arc;
use tracing::{error, info};

pub struct SinkFactory {
    config: Arc<SinkConfig>,
    credentials: Arc<dyn CredentialProvider>,
    store: Arc<RemoteStore>,
}

impl SinkFactory {
    /// Validate `config` and wire the client, retry policy and store together
    pub fn new(
        config: SinkConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SinkError> {
        config.validate()?;
        let client = GcsClient::new(
            transport,
            credentials.clone(),
            &config.endpoint,
            config.bucket.clone(),
        )?;
        let store = RemoteStore::new(client, RetryPolicy::from(&config.retry));
        Ok(SinkFactory {
            config: Arc::new(config),
            credentials,
            store: Arc::new(store),
        })
    }

    /// Factory talking to the real store over HTTPS
    pub fn with_reqwest(
        config: SinkConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SinkError> {
        let transport = ReqwestTransport::new(config.request_timeout).map_err(|e| {
            SinkError::Config(crate::sink::config::ConfigError::Invalid {
                field: "request_timeout",
                reason: e.to_string(),
            })
        })?;
        Self::new(config, Arc::new(transport), credentials)
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Check credentials, directory names and bucket reachability
    ///
    /// Makes a single bucket request with no retries. Any failure means the
    /// process should not start.
    pub async fn verify_file_system_configuration(&self) -> Result<BucketMetadata, SinkError> {
        if let Err(e) = self.credentials.credential().await {
            error!(error = %e, "Credential check failed");
            return Err(e.into());
        }

        for (field, directory) in [
            ("working_dir", &self.config.working_dir),
            ("publish_dir", &self.config.publish_dir),
        ] {
            validate_directory(directory)
                .map_err(|reason| SinkError::InvalidName(format!("{}: {}", field, reason)))?;
        }

        let bucket = self.store.verify_bucket().await?;
        info!(
            bucket = %bucket.name,
            location = bucket.location.as_deref().unwrap_or("unknown"),
            working_dir = %self.config.working_dir,
            publish_dir = %self.config.publish_dir,
            "Verified object store configuration"
        );
        Ok(bucket)
    }

    /// A cloneable handle for creating files
    pub fn create(&self) -> FileManager {
        FileManager {
            config: self.config.clone(),
            store: self.store.clone(),
        }
    }

    /// Shorthand for `create().create_file(name)`
    pub async fn create_file(&self, name: &str) -> Result<SinkFile, SinkError> {
        self.create().create_file(name).await
    }
}

/// Creates sink files sharing one store and configuration
#[derive(Clone)]
pub struct FileManager {
    config: Arc<SinkConfig>,
    store: Arc<RemoteStore>,
}

impl FileManager {
    /// Create `name` by uploading its header to the working directory
    pub async fn create_file(&self, name: &str) -> Result<SinkFile, SinkError> {
        let paths = FilePaths::new(&self.config.working_dir, &self.config.publish_dir, name)?;
        let sync_marker = SyncMarker::random(&mut rand::thread_rng());
        SinkFile::open(
            self.store.clone(),
            name,
            paths,
            self.config.sync_file_after_records,
            sync_marker,
        )
        .await
    }

    /// Records each file buffers between syncs
    pub fn records_per_sync(&self) -> usize {
        self.config.sync_file_after_records
    }
}

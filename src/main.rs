//! gcs-sink
//!
//! Reads newline-delimited records from stdin and publishes them as a single
//! object. Records are synced to the working directory every
//! `sync_file_after_records` lines; the publish happens at end of input.
//! Interrupting the process (Ctrl-C) discards the file instead.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | GCS_SINK_CONFIG | gcs-sink.toml | TOML configuration file |
//! | GCS_SINK_FILE_NAME | records-<unix millis>.rec | Object name under both directories |
//! | GCS_SINK_ACCESS_TOKEN | - | Static bearer token; metadata server when unset |
//! | GCS_SINK_LOG_FORMAT | text | text or json |
//! | GCS_SINK_LOG_LEVEL | info | Filter directive (RUST_LOG overrides) |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use gcs_sink::observability::{init_tracing, LogConfig};
use gcs_sink::sink::{
    CredentialProvider, MetadataServerCredentials, ReqwestTransport, SinkConfig, SinkFactory,
    SinkFile, StaticCredentials,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_CONFIG_PATH: &str = "gcs-sink.toml";

/// How the input loop ended
enum InputEnd {
    Eof,
    Interrupted,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing(&LogConfig::from_env())?;

    let config_path =
        std::env::var("GCS_SINK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = SinkConfig::load(&config_path)?;
    let credentials = credentials_from_env(&config)?;

    let factory = SinkFactory::with_reqwest(config, credentials)?;
    factory.verify_file_system_configuration().await?;

    let name = std::env::var("GCS_SINK_FILE_NAME").unwrap_or_else(|_| default_file_name());
    let mut file = factory.create_file(&name).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = copy_records(&mut file, &mut lines, tokio::signal::ctrl_c()).await;

    match outcome {
        Ok(InputEnd::Eof) => {
            let published = file.close_and_publish().await?;
            for failure in &published.cleanup_failures {
                warn!(error = %failure, "Transient object left behind");
            }
            println!("{}", published.object.name);
            Ok(())
        }
        Ok(InputEnd::Interrupted) => {
            info!(file = %name, "Interrupted; discarding");
            file.discard().await?;
            Ok(())
        }
        Err(e) => {
            error!(file = %name, error = %e, "Input failed; discarding");
            if let Err(discard) = file.discard().await {
                error!(file = %name, error = %discard, "Discard failed");
            }
            Err(e)
        }
    }
}

/// Append every input line, syncing whenever the buffer is full
async fn copy_records<R, S>(
    file: &mut SinkFile,
    lines: &mut Lines<R>,
    shutdown: S,
) -> Result<InputEnd, BoxError>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(InputEnd::Interrupted),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(InputEnd::Eof);
                };
                if file.is_full() {
                    file.sync().await?;
                }
                file.append(line)?;
            }
        }
    }
}

fn credentials_from_env(config: &SinkConfig) -> Result<Arc<dyn CredentialProvider>, BoxError> {
    if let Ok(token) = std::env::var("GCS_SINK_ACCESS_TOKEN") {
        return Ok(Arc::new(StaticCredentials::bearer(token)));
    }
    let transport = ReqwestTransport::new(config.request_timeout)?;
    Ok(Arc::new(MetadataServerCredentials::new(Arc::new(transport))?))
}

fn default_file_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("records-{}.rec", millis)
}

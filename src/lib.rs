pub mod observability;
pub mod sink;

pub use observability::{init_tracing, LogConfig, LogFormat};
pub use sink::{
    FileManager, FileState, PublishOutcome, SinkConfig, SinkError, SinkFactory, SinkFile,
};

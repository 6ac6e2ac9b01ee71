// Logs module - forwarding of child stdout/stderr to a log sink

mod writer;

use crate::error::Result;
use async_trait::async_trait;

pub use writer::FileLogSink;

/// Which child stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Identifies the instance that produced a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOrigin {
    pub spec_name: String,
    pub instance_id: String,
    pub instance_index: usize,
}

/// External collaborator receiving child output line by line.
///
/// Storage and rotation policy belong to the implementation.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_line(&self, origin: &LogOrigin, stream: LogStream, line: &str) -> Result<()>;
}

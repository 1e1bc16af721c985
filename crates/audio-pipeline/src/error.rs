//! Error type shared by every stage and the scheduler.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Broad classification used by callers to decide between skipping and aborting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested input does not exist.
    SourceAbsent,
    /// Allocation, device or I/O failure.
    Resource,
    /// Malformed or unsupported media data.
    Decode,
    /// Invalid configuration or unknown stage name.
    Config,
    /// A stage broke the control-flow contract.
    Protocol,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source not found: {}", path.display())]
    SourceAbsent { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("out of memory: {context}")]
    Resource { context: String },

    #[error("output device: {0}")]
    Device(String),

    #[error("{stage}: {detail}")]
    Decode { stage: &'static str, detail: String },

    #[error("{stage}: unsupported {detail}")]
    Unsupported { stage: &'static str, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no such stage: {category}.{name}")]
    UnknownStage { category: String, name: String },

    #[error("{stage}: {detail}")]
    Protocol { stage: &'static str, detail: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceAbsent { .. } => ErrorKind::SourceAbsent,
            Self::Io { .. } | Self::Resource { .. } | Self::Device(_) => ErrorKind::Resource,
            Self::Decode { .. } | Self::Unsupported { .. } => ErrorKind::Decode,
            Self::Config(_) | Self::UnknownStage { .. } => ErrorKind::Config,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    /// Wrap an I/O error, promoting `NotFound` to [`PipelineError::SourceAbsent`].
    pub fn open(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        if err.kind() == io::ErrorKind::NotFound {
            return Self::SourceAbsent { path };
        }
        Self::Io {
            context: format!("open {}", path.display()),
            source: err,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn decode(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::Decode {
            stage,
            detail: detail.into(),
        }
    }

    pub fn unsupported(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::Unsupported {
            stage,
            detail: detail.into(),
        }
    }

    pub fn protocol(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            stage,
            detail: detail.into(),
        }
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
pub(crate) fn alloc_zeroed(len: usize, what: &str) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PipelineError::Resource {
            context: format!("{what} ({len} bytes)"),
        })?;
    buf.resize(len, 0);
    Ok(buf)
}

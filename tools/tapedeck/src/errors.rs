use std::fmt;
use thiserror::Error;

/// Which side of a comparison a payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSide {
    Recorded,
    Actual,
}

impl fmt::Display for PayloadSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recorded => f.write_str("recorded"),
            Self::Actual => f.write_str("actual"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("io error: {0}")]
    Io(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("entry {index}: {side} payload is not valid JSON: {message}")]
    Verification {
        index: usize,
        side: PayloadSide,
        message: String,
    },
    #[error("entry {index}: {detail}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        detail: String,
        expected: String,
        actual: String,
    },
    #[error("got {actual} entries, want {expected}")]
    EntryCount { expected: usize, actual: usize },
    #[error("no golden file {0} (run with --update to create)")]
    MissingGolden(String),
    #[error("golden file {golden} already belongs to {fixture}")]
    GoldenConflict { golden: String, fixture: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("usage error: {0}")]
    Usage(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl TapeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }

    /// Short machine-readable name used in run log events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Format(_) => "format",
            Self::Verification { .. } => "verification",
            Self::Mismatch { .. } | Self::EntryCount { .. } => "mismatch",
            Self::MissingGolden(_) => "missing_golden",
            Self::GoldenConflict { .. } => "golden_conflict",
            Self::Process(_) => "process",
            Self::Usage(_) => "usage",
            Self::ConfigParse(_) | Self::InvalidConfig(_) => "config",
        }
    }
}

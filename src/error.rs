use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Session-level failures. Any of these aborts the whole fetch session.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP client unavailable: {0}")]
    ClientUnavailable(#[source] reqwest::Error),

    #[error("cannot create target directory {}: {source}", path.display())]
    TargetDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

impl FetchError {
    /// Process exit code for this failure. A missing HTTP client maps to the
    /// conventional "command not found" status.
    pub fn exit_code(&self) -> u8 {
        match self {
            FetchError::ClientUnavailable(_) => 127,
            FetchError::TargetDir { .. } | FetchError::Config(_) => 2,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid model name {0:?}")]
    InvalidName(String),

    #[error("model {0:?} listed more than once")]
    DuplicateName(String),

    #[error("invalid override {0:?}, expected NAME=URL")]
    InvalidOverride(String),

    #[error("max attempts must be at least 1")]
    ZeroAttempts,

    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("server rejected the resume range")]
    RangeNotSatisfiable,

    #[error("server answered the resume from byte {requested} with a different range")]
    RangeMismatch { requested: u64, served: Option<u64> },

    #[error("body: {0}")]
    Body(String),
}

/// Failure of a single download attempt. Recoverable: the attempt loop retries.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("stalled: {bytes} bytes in {}s, below the minimum rate", window.as_secs())]
    Stalled { bytes: u64, window: Duration },

    #[error("downloaded file is empty")]
    EmptyFile,

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

//! Error taxonomy for the pull engine.
//!
//! Mirrors the kinds enumerated in the design: network, validation,
//! integrity, structural, and store-origin failures. The Main Loop
//! captures the first of these at-most-once and discards the rest.

use thiserror::Error;

pub type PullResult<T> = Result<T, PullError>;

#[derive(Error, Debug)]
pub enum PullError {
    #[error("network request to {uri} failed: {source}")]
    Network {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("pull cancelled")]
    Cancelled,

    #[error("invalid checksum: {0:?}")]
    InvalidChecksum(String),

    #[error("invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("invalid ref name: {0:?}")]
    InvalidRefName(String),

    #[error("malformed summary line: {0:?}")]
    MalformedSummaryLine(String),

    #[error("remote object-storage mode {0:?} is not supported; only archived per-object mode can be pulled")]
    UnsupportedRemoteMode(String),

    #[error("malformed commit record: {0}")]
    MalformedCommit(String),

    #[error("malformed dir-tree record: {0}")]
    MalformedDirTree(String),

    #[error("staged object checksum mismatch: expected {expected}, store computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("recursion depth exceeded at {name} (limit {limit})")]
    RecursionExceeded { name: String, limit: u32 },

    #[error("remote {0:?} is not configured (missing `remote \"{0}\"` section in local config)")]
    UnknownRemote(String),

    #[error("local config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl PullError {
    pub fn invalid_checksum(s: impl Into<String>) -> Self {
        Self::InvalidChecksum(s.into())
    }

    pub fn invalid_filename(s: impl Into<String>) -> Self {
        Self::InvalidFilename(s.into())
    }

    pub fn invalid_ref_name(s: impl Into<String>) -> Self {
        Self::InvalidRefName(s.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}

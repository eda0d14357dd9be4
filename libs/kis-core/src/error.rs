use std::path::PathBuf;

/// Category of a record store error. Lets callers tell a dead
/// connection from a rejected statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Invalid configuration. Permanent, fail at startup.
    Config,
    /// Connection or pool error. Transient.
    Connect,
    /// Statement rejected or failed mid-flight.
    Query,
}

impl std::fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreErrorKind::Config => f.write_str("config"),
            StoreErrorKind::Connect => f.write_str("connect"),
            StoreErrorKind::Query => f.write_str("query"),
        }
    }
}

/// Error returned by every [`RecordStore`](crate::store::RecordStore) method.
#[derive(Clone, thiserror::Error)]
#[error("{message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Config, message: msg.into() }
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Connect, message: msg.into() }
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Query, message: msg.into() }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Debug for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("batch is not a JSON array: {0}")]
    NotAnArray(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RotateError {
    #[error("probe {}: {source}", path.display())]
    Probe { path: PathBuf, source: std::io::Error },

    #[error("no free retired name for {} after {probes} probes", base.display())]
    NamesExhausted { base: PathBuf, probes: u32 },

    #[error("rename {} -> {}: {source}", from.display(), to.display())]
    Rename { from: PathBuf, to: PathBuf, source: std::io::Error },

    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),
}

/// Failure of one archival stage. Every later stage for the same file is
/// skipped.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("checksum {}: {source}", path.display())]
    Checksum { path: PathBuf, source: std::io::Error },

    #[error("compress {}: {source}", path.display())]
    Compress { path: PathBuf, source: std::io::Error },

    #[error("upload {key}: {source}")]
    Upload { key: String, source: object_store::Error },

    #[error("read {} for upload: {source}", path.display())]
    ReadForUpload { path: PathBuf, source: std::io::Error },

    #[error("archive worker: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("decode: {0}")]
    Decode(#[from] CodecError),

    #[error("append to active file: {0}")]
    Append(#[source] std::io::Error),

    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("list archives under '{prefix}': {source}")]
    List { prefix: String, source: object_store::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read '{path}': {source}")]
    Read { path: String, source: std::io::Error },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [{section}] {field}: {reason}")]
    Invalid { section: &'static str, field: &'static str, reason: String },
}

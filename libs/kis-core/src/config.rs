use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root of the TOML configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KisConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub file: FileSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    /// Per-request timeout for `/konglogs`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// How long shutdown waits for archival pipelines that were already
    /// running detached.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            timeout_secs: default_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ServerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileSection {
    #[serde(default = "default_file_path")]
    pub path: String,
    #[serde(default = "default_file_name")]
    pub name: String,
    /// Records per active file before rotation.
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval: usize,
    /// Threshold used by explicit flushes (signal, inactivity, shutdown).
    #[serde(default = "default_flush_min_records")]
    pub flush_min_records: usize,
    /// Initial capacity of the batch write buffer.
    #[serde(default = "default_buffer_increment")]
    pub buffer_increment: usize,
    /// JSON field holding the record timestamp in epoch milliseconds.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default = "default_max_name_probes")]
    pub max_name_probes: u32,
}

impl Default for FileSection {
    fn default() -> Self {
        Self {
            path: default_file_path(),
            name: default_file_name(),
            rotate_interval: default_rotate_interval(),
            flush_min_records: default_flush_min_records(),
            buffer_increment: default_buffer_increment(),
            timestamp_field: default_timestamp_field(),
            max_name_probes: default_max_name_probes(),
        }
    }
}

impl FileSection {
    pub fn active_path(&self) -> PathBuf {
        PathBuf::from(&self.path).join(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSection {
    /// Upload rotated files to the object store.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bucket: String,
    /// Key prefix for every archive object.
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// S3-compatible endpoint (MinIO etc).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Use a local directory as the object store instead of S3.
    #[serde(default)]
    pub local_root: Option<String>,
    #[serde(default)]
    pub remove_sent_file: bool,
    /// Seconds without new records before a forced flush (0 disables).
    #[serde(default)]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bucket: String::new(),
            folder: String::new(),
            region: None,
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            allow_http: false,
            local_root: None,
            remove_sent_file: false,
            inactivity_timeout_secs: 0,
            compression_level: default_compression_level(),
        }
    }
}

impl ArchiveSection {
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub connection_string: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Target columns for `(timestamp, fingerprint, raw_payload)`, in that order.
    #[serde(default = "default_column_names")]
    pub column_names: Vec<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Archives processed concurrently by backfill.
    #[serde(default = "default_backfill_parallelism")]
    pub backfill_parallelism: usize,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            enabled: false,
            connection_string: String::new(),
            table: default_table(),
            column_names: default_column_names(),
            max_connections: default_max_connections(),
            backfill_parallelism: default_backfill_parallelism(),
        }
    }
}

impl DatabaseSection {
    pub fn staging_table(&self) -> String {
        format!("{}_backfill", self.table)
    }
}

fn default_address() -> String {
    "0.0.0.0:8080".into()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_body_bytes() -> usize {
    100_000_000
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_file_path() -> String {
    ".".into()
}
fn default_file_name() -> String {
    "kong.log".into()
}
fn default_rotate_interval() -> usize {
    10_000
}
fn default_flush_min_records() -> usize {
    1
}
fn default_buffer_increment() -> usize {
    64 * 1024
}
fn default_timestamp_field() -> String {
    "started_at".into()
}
fn default_max_name_probes() -> u32 {
    1000
}
fn default_compression_level() -> u32 {
    6
}
fn default_table() -> String {
    "kong_logs".into()
}
fn default_column_names() -> Vec<String> {
    vec!["time".into(), "log_entry_hash".into(), "log_entry".into()]
}
fn default_max_connections() -> u32 {
    10
}
fn default_backfill_parallelism() -> usize {
    4
}

impl KisConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: KisConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file.name.is_empty() {
            return Err(invalid("file", "name", "must not be empty"));
        }
        if self.file.rotate_interval == 0 {
            return Err(invalid("file", "rotate_interval", "must be at least 1"));
        }
        if self.file.flush_min_records == 0 {
            return Err(invalid("file", "flush_min_records", "must be at least 1"));
        }
        if self.file.max_name_probes == 0 {
            return Err(invalid("file", "max_name_probes", "must be at least 1"));
        }
        if self.archive.enabled && self.archive.bucket.is_empty() && self.archive.local_root.is_none() {
            return Err(invalid("archive", "bucket", "required when archive is enabled"));
        }
        if self.archive.compression_level > 9 {
            return Err(invalid("archive", "compression_level", "must be 0..=9"));
        }
        if self.database.enabled && self.database.connection_string.is_empty() {
            return Err(invalid("database", "connection_string", "required when database is enabled"));
        }
        if self.database.column_names.len() != 3 {
            return Err(invalid(
                "database",
                "column_names",
                format!("expected 3 columns (timestamp, fingerprint, payload), got {}", self.database.column_names.len()),
            ));
        }
        if self.database.backfill_parallelism == 0 {
            return Err(invalid("database", "backfill_parallelism", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { section, field, reason: reason.into() }
}

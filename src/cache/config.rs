//! Static backend settings.
//!
//! Per-deployment connection parameters for every backend kind, read from the
//! `[backend]` section of `pagecache.toml`. They are not editable at runtime;
//! the persisted cache options only pick which backend is used.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_FILE_NAME_PREFIX: &str = "pagecache";
const DEFAULT_MEMCACHED_HOST: &str = "127.0.0.1";
const DEFAULT_MEMCACHED_PORT: u16 = 11211;
const DEFAULT_MEMCACHED_WEIGHT: u32 = 1;
const DEFAULT_MEMCACHED_TIMEOUT_SECS: u64 = 1;
const DEFAULT_MEMCACHED_RETRY_INTERVAL_SECS: u64 = 15;
const DEFAULT_XCACHE_SLOTS: usize = 1024;
pub(crate) const MAX_HASHED_DIRECTORY_LEVEL: u8 = 8;

/// Connection parameters for all backend kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    pub file: FileBackendSettings,
    pub memcached: MemcachedSettings,
    pub xcache: XcacheSettings,
}

/// How stored files are verified on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadControl {
    #[default]
    Sha256,
    Length,
}

impl ReadControl {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Length => "length",
        }
    }
}

impl fmt::Display for ReadControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadControl {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "length" | "strlen" => Ok(Self::Length),
            other => Err(format!("unknown read control type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBackendSettings {
    /// Sync entries to disk before they become visible.
    pub file_locking: bool,
    pub read_control: bool,
    pub read_control_type: ReadControl,
    /// Depth of hashed sub-directories below the cache directory.
    pub hashed_directory_level: u8,
    pub file_name_prefix: String,
}

impl Default for FileBackendSettings {
    fn default() -> Self {
        Self {
            file_locking: true,
            read_control: true,
            read_control_type: ReadControl::default(),
            hashed_directory_level: 0,
            file_name_prefix: DEFAULT_FILE_NAME_PREFIX.to_string(),
        }
    }
}

impl FileBackendSettings {
    pub fn validate_prefix(prefix: &str) -> Result<(), String> {
        if prefix.is_empty() {
            return Err("must not be empty".to_string());
        }
        if !prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err("may only contain ASCII letters, digits and `_`".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcachedSettings {
    pub servers: Vec<MemcachedServer>,
}

impl Default for MemcachedSettings {
    fn default() -> Self {
        Self {
            servers: vec![MemcachedServer::default()],
        }
    }
}

/// One node of the distributed backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemcachedServer {
    pub host: String,
    pub port: u16,
    pub persistent: bool,
    /// Relative share of keys routed to this node.
    pub weight: u32,
    /// Connect and I/O timeout.
    pub timeout: Duration,
    /// How long a failed node is skipped before it is tried again.
    pub retry_interval: Duration,
    pub enabled: bool,
}

impl Default for MemcachedServer {
    fn default() -> Self {
        Self {
            host: DEFAULT_MEMCACHED_HOST.to_string(),
            port: DEFAULT_MEMCACHED_PORT,
            persistent: true,
            weight: DEFAULT_MEMCACHED_WEIGHT,
            timeout: Duration::from_secs(DEFAULT_MEMCACHED_TIMEOUT_SECS),
            retry_interval: Duration::from_secs(DEFAULT_MEMCACHED_RETRY_INTERVAL_SECS),
            enabled: true,
        }
    }
}

impl MemcachedServer {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XcacheSettings {
    /// Administrative credentials required for a full clean.
    pub user: Option<String>,
    pub password: Option<String>,
    pub slots: NonZeroUsize,
}

impl Default for XcacheSettings {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            slots: NonZeroUsize::new(DEFAULT_XCACHE_SLOTS).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

//! Storage backends for rendered pages.
//!
//! The backend set is closed: a persisted backend name resolves to a
//! [`BackendKind`], which together with the deployment's static settings
//! yields a [`BackendConfig`] variant that is validated on its own before a
//! client is built.

mod accelerator;
mod distributed;
mod file;
mod memory;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::config::{
    BackendSettings, FileBackendSettings, MAX_HASHED_DIRECTORY_LEVEL, MemcachedServer,
    XcacheSettings,
};
use super::error::CacheError;
use super::keys::Fingerprint;

pub use accelerator::AcceleratorBackend;
pub use distributed::DistributedBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Invoked with `(host, port)` whenever a distributed node is found unreachable.
pub type NodeFailureCallback = Arc<dyn Fn(&str, u16) + Send + Sync>;

/// Persisted backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "file")]
    File,
    #[serde(rename = "apc")]
    InMemoryShared,
    #[serde(rename = "memcached")]
    DistributedKv,
    #[serde(rename = "xcache")]
    OpaqueAccelerator,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [
        Self::File,
        Self::InMemoryShared,
        Self::DistributedKv,
        Self::OpaqueAccelerator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::InMemoryShared => "apc",
            Self::DistributedKv => "memcached",
            Self::OpaqueAccelerator => "xcache",
        }
    }

    /// Only the file backend stores pages in the cache directory.
    pub fn uses_directory(self) -> bool {
        matches!(self, Self::File)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "apc" | "memory" | "in-memory" | "in_memory" => Ok(Self::InMemoryShared),
            "memcached" | "distributed" => Ok(Self::DistributedKv),
            "xcache" | "opaque" | "accelerator" => Ok(Self::OpaqueAccelerator),
            other => Err(format!(
                "`{other}` is not a cache backend (expected file, apc, memcached or xcache)"
            )),
        }
    }
}

/// A backend kind paired with the parameters it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    File {
        directory: PathBuf,
        options: FileBackendSettings,
    },
    InMemoryShared,
    DistributedKv {
        servers: Vec<MemcachedServer>,
    },
    OpaqueAccelerator(XcacheSettings),
}

impl BackendConfig {
    pub fn resolve(kind: BackendKind, directory: &Path, settings: &BackendSettings) -> Self {
        match kind {
            BackendKind::File => Self::File {
                directory: directory.to_path_buf(),
                options: settings.file.clone(),
            },
            BackendKind::InMemoryShared => Self::InMemoryShared,
            BackendKind::DistributedKv => Self::DistributedKv {
                servers: settings.memcached.servers.clone(),
            },
            BackendKind::OpaqueAccelerator => Self::OpaqueAccelerator(settings.xcache.clone()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::File { .. } => BackendKind::File,
            Self::InMemoryShared => BackendKind::InMemoryShared,
            Self::DistributedKv { .. } => BackendKind::DistributedKv,
            Self::OpaqueAccelerator(_) => BackendKind::OpaqueAccelerator,
        }
    }

    /// Checks the parameters of this variant without touching any other.
    pub async fn validate(&self) -> Result<(), CacheError> {
        let name = self.kind().as_str();
        match self {
            Self::File { directory, options } => {
                if !super::options::directory_exists(directory).await {
                    return Err(CacheError::directory_missing(directory));
                }
                if !super::options::directory_is_readable_writable(directory).await {
                    return Err(CacheError::directory_not_writable(directory));
                }
                FileBackendSettings::validate_prefix(&options.file_name_prefix).map_err(|reason| {
                    CacheError::backend_init(name, format!("file_name_prefix {reason}"))
                })?;
                if options.hashed_directory_level > MAX_HASHED_DIRECTORY_LEVEL {
                    return Err(CacheError::backend_init(
                        name,
                        format!("hashed_directory_level must be at most {MAX_HASHED_DIRECTORY_LEVEL}"),
                    ));
                }
                Ok(())
            }
            Self::InMemoryShared | Self::OpaqueAccelerator(_) => Ok(()),
            Self::DistributedKv { servers } => {
                if !servers.iter().any(|server| server.enabled) {
                    return Err(CacheError::backend_init(name, "no enabled server is configured"));
                }
                for server in servers {
                    if server.host.trim().is_empty() {
                        return Err(CacheError::backend_init(name, "server host must not be empty"));
                    }
                    if server.port == 0 {
                        return Err(CacheError::backend_init(
                            name,
                            format!("server {} has port 0", server.host),
                        ));
                    }
                    if server.weight == 0 {
                        return Err(CacheError::backend_init(
                            name,
                            format!("server {} has weight 0", server.address()),
                        ));
                    }
                    if server.timeout.is_zero() {
                        return Err(CacheError::backend_init(
                            name,
                            format!("server {} has a zero timeout", server.address()),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Validates `config` and builds its client.
pub async fn connect(
    config: BackendConfig,
    on_failure: Option<NodeFailureCallback>,
) -> Result<Arc<dyn PageBackend>, CacheError> {
    config.validate().await?;

    let backend: Arc<dyn PageBackend> = match config {
        BackendConfig::File { directory, options } => Arc::new(FileBackend::new(directory, options)),
        BackendConfig::InMemoryShared => Arc::new(MemoryBackend::new()),
        BackendConfig::DistributedKv { servers } => {
            Arc::new(DistributedBackend::new(servers, on_failure))
        }
        BackendConfig::OpaqueAccelerator(settings) => Arc::new(AcceleratorBackend::new(settings)),
    };

    Ok(backend)
}

/// What an invalidation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    All,
    ExpiredOnly,
}

impl InvalidationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::ExpiredOnly => "expired",
        }
    }
}

/// A captured response: status, declared content type and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPage {
    pub status: u16,
    pub content_type: Option<String>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    pub created_at: i64,
    /// `None` when the entry never expires.
    pub expires_at: Option<i64>,
}

impl StoredPage {
    /// A lifetime of zero stores the page without expiry.
    pub fn new(status: u16, content_type: Option<String>, body: Bytes, lifetime_secs: u64) -> Self {
        let created_at = OffsetDateTime::now_utc().unix_timestamp();
        let expires_at = (lifetime_secs > 0)
            .then(|| created_at.saturating_add(i64::try_from(lifetime_secs).unwrap_or(i64::MAX)));
        Self {
            status,
            content_type,
            body,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A page store keyed by request fingerprint.
#[async_trait]
pub trait PageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Returns the stored page, expired or not; expiry is the caller's call.
    async fn load(&self, key: &Fingerprint) -> Result<Option<StoredPage>, CacheError>;

    async fn save(&self, key: &Fingerprint, page: &StoredPage) -> Result<(), CacheError>;

    /// Removes entries in `scope`, returning how many were removed when known.
    async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError>;
}

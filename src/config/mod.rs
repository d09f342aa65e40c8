//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    CliArgs, Command, MaintenanceArgs, ServeArgs, ServeOverrides, StorageOverrides,
};

use crate::cache::{
    BackendSettings, DEFAULT_ADMIN_PREFIX, DEFAULT_MAX_BODY_BYTES, FileBackendSettings,
    MAX_HASHED_DIRECTORY_LEVEL, MemcachedServer, MemcachedSettings, ReadControl, XcacheSettings,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const ENV_PREFIX: &str = "PAGECACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_OPTIONS_PATH: &str = "data/options.json";
const DEFAULT_CACHE_DIRECTORY: &str = "cache/";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub options: OptionStoreSettings,
    pub cache: CacheSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Location of the key/value store holding the cache options.
#[derive(Debug, Clone)]
pub struct OptionStoreSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Used whenever the saved cache directory is blank.
    pub default_directory: String,
    pub admin_path_prefix: String,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::ClearCache(args))
        | Some(Command::Install(args))
        | Some(Command::Uninstall(args)) => raw.apply_storage_overrides(&args.storage),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    options: RawOptionStoreSettings,
    cache: RawCacheSettings,
    backend: RawBackendSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(prefix) = overrides.admin_path_prefix.as_ref() {
            self.cache.admin_path_prefix = Some(prefix.clone());
        }
        if let Some(limit) = overrides.max_body_bytes {
            self.cache.max_body_bytes = Some(limit);
        }

        self.apply_storage_overrides(&overrides.storage);
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(path) = overrides.options_path.as_ref() {
            self.options.path = Some(path.clone());
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.default_directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            options,
            cache,
            backend,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let options = build_option_store_settings(options)?;
        let cache = build_cache_settings(cache)?;
        let backend = build_backend_settings(backend)?;

        Ok(Self {
            server,
            logging,
            options,
            cache,
            backend,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    Ok(ServerSettings {
        public_addr,
        admin_addr,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_option_store_settings(
    options: RawOptionStoreSettings,
) -> Result<OptionStoreSettings, LoadError> {
    let path = options
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OPTIONS_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("options.path", "path must not be empty"));
    }
    Ok(OptionStoreSettings { path })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_directory = cache
        .default_directory
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CACHE_DIRECTORY.to_string());
    if default_directory.is_empty() {
        return Err(LoadError::invalid(
            "cache.default_directory",
            "path must not be empty",
        ));
    }

    let admin_path_prefix = cache
        .admin_path_prefix
        .unwrap_or_else(|| DEFAULT_ADMIN_PREFIX.to_string());
    if !admin_path_prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "cache.admin_path_prefix",
            "must start with `/`",
        ));
    }

    let max_body_bytes = cache
        .max_body_bytes
        .map(|value| {
            usize::try_from(value).map_err(|_| {
                LoadError::invalid(
                    "cache.max_body_bytes",
                    "value exceeds supported range for usize",
                )
            })
        })
        .transpose()?
        .unwrap_or(DEFAULT_MAX_BODY_BYTES);
    let max_body_bytes = NonZeroUsize::new(max_body_bytes).ok_or_else(|| {
        LoadError::invalid("cache.max_body_bytes", "must be greater than zero")
    })?;

    Ok(CacheSettings {
        default_directory,
        admin_path_prefix,
        max_body_bytes,
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    Ok(BackendSettings {
        file: build_file_backend_settings(backend.file)?,
        memcached: build_memcached_settings(backend.memcached)?,
        xcache: build_xcache_settings(backend.xcache)?,
    })
}

fn build_file_backend_settings(
    file: RawFileBackendSettings,
) -> Result<FileBackendSettings, LoadError> {
    let defaults = FileBackendSettings::default();

    let read_control_type = match file.read_control_type {
        Some(value) => ReadControl::from_str(&value)
            .map_err(|reason| LoadError::invalid("backend.file.read_control_type", reason))?,
        None => defaults.read_control_type,
    };

    let hashed_directory_level = file
        .hashed_directory_level
        .unwrap_or(u64::from(defaults.hashed_directory_level));
    let hashed_directory_level = u8::try_from(hashed_directory_level)
        .ok()
        .filter(|level| *level <= MAX_HASHED_DIRECTORY_LEVEL)
        .ok_or_else(|| {
            LoadError::invalid(
                "backend.file.hashed_directory_level",
                format!("must be between 0 and {MAX_HASHED_DIRECTORY_LEVEL}"),
            )
        })?;

    let file_name_prefix = file.file_name_prefix.unwrap_or(defaults.file_name_prefix);
    FileBackendSettings::validate_prefix(&file_name_prefix)
        .map_err(|reason| LoadError::invalid("backend.file.file_name_prefix", reason))?;

    Ok(FileBackendSettings {
        file_locking: file.file_locking.unwrap_or(defaults.file_locking),
        read_control: file.read_control.unwrap_or(defaults.read_control),
        read_control_type,
        hashed_directory_level,
        file_name_prefix,
    })
}

fn build_memcached_settings(
    memcached: RawMemcachedSettings,
) -> Result<MemcachedSettings, LoadError> {
    let Some(servers) = memcached.servers else {
        return Ok(MemcachedSettings::default());
    };
    if servers.is_empty() {
        return Err(LoadError::invalid(
            "backend.memcached.servers",
            "at least one server is required",
        ));
    }

    let servers = servers
        .into_iter()
        .map(build_memcached_server)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MemcachedSettings { servers })
}

fn build_memcached_server(server: RawMemcachedServer) -> Result<MemcachedServer, LoadError> {
    let defaults = MemcachedServer::default();

    let host = server.host.map(|host| host.trim().to_string()).unwrap_or(defaults.host);
    if host.is_empty() {
        return Err(LoadError::invalid(
            "backend.memcached.servers.host",
            "host must not be empty",
        ));
    }

    let port = server.port.unwrap_or(defaults.port);
    if port == 0 {
        return Err(LoadError::invalid(
            "backend.memcached.servers.port",
            "port must be greater than zero",
        ));
    }

    let weight = server.weight.unwrap_or(defaults.weight);
    if weight == 0 {
        return Err(LoadError::invalid(
            "backend.memcached.servers.weight",
            "must be greater than zero",
        ));
    }

    let timeout = match server.timeout_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "backend.memcached.servers.timeout_seconds",
                "must be greater than zero",
            ));
        }
        Some(seconds) => Duration::from_secs(seconds),
        None => defaults.timeout,
    };

    let retry_interval = server
        .retry_interval_seconds
        .map(Duration::from_secs)
        .unwrap_or(defaults.retry_interval);

    Ok(MemcachedServer {
        host,
        port,
        persistent: server.persistent.unwrap_or(defaults.persistent),
        weight,
        timeout,
        retry_interval,
        enabled: server.status.unwrap_or(defaults.enabled),
    })
}

fn build_xcache_settings(xcache: RawXcacheSettings) -> Result<XcacheSettings, LoadError> {
    let defaults = XcacheSettings::default();

    let slots = match xcache.slots {
        Some(value) => usize::try_from(value)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| LoadError::invalid("backend.xcache.slots", "must be greater than zero"))?,
        None => defaults.slots,
    };

    Ok(XcacheSettings {
        user: non_blank(xcache.user),
        password: non_blank(xcache.password),
        slots,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOptionStoreSettings {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_directory: Option<String>,
    admin_path_prefix: Option<String>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    file: RawFileBackendSettings,
    memcached: RawMemcachedSettings,
    xcache: RawXcacheSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFileBackendSettings {
    file_locking: Option<bool>,
    read_control: Option<bool>,
    read_control_type: Option<String>,
    hashed_directory_level: Option<u64>,
    file_name_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMemcachedSettings {
    servers: Option<Vec<RawMemcachedServer>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMemcachedServer {
    host: Option<String>,
    port: Option<u16>,
    persistent: Option<bool>,
    weight: Option<u32>,
    timeout_seconds: Option<u64>,
    retry_interval_seconds: Option<u64>,
    status: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawXcacheSettings {
    user: Option<String>,
    password: Option<String>,
    slots: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(name = "pagecache", version, about = "Full-page cache for content sites")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public site and the admin listener with the page cache in front.
    Serve(Box<ServeArgs>),
    /// Remove every cached page.
    #[command(name = "clear-cache")]
    ClearCache(MaintenanceArgs),
    /// Save the default cache options.
    Install(MaintenanceArgs),
    /// Clear the cache and delete the saved cache options.
    Uninstall(MaintenanceArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MaintenanceArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,
}

/// Where cache options and cached pages live.
#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the cache option store file.
    #[arg(long = "options-path", value_name = "PATH")]
    pub options_path: Option<PathBuf>,

    /// Override the default cache directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the path prefix treated as the admin interface.
    #[arg(long = "cache-admin-path-prefix", value_name = "PREFIX")]
    pub admin_path_prefix: Option<String>,

    /// Override the largest response body that is captured.
    #[arg(long = "cache-max-body-bytes", value_name = "BYTES")]
    pub max_body_bytes: Option<u64>,
}

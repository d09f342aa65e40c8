use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by the page cache.
///
/// Initialization and cleaning errors are collected on the engine rather than
/// returned to the page pipeline; a request never fails because the cache did.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache options could not be decoded: {message}")]
    Configuration { message: String },
    #[error("the following cache directory must exist: {}", path.display())]
    DirectoryMissing { path: PathBuf },
    #[error("the following cache directory must be readable and writable: {}", path.display())]
    DirectoryNotWritable { path: PathBuf },
    #[error("cache backend `{backend}` is misconfigured: {reason}")]
    BackendInit {
        backend: &'static str,
        reason: String,
    },
    #[error("cache backend `{backend}` failed during `{op}`: {message}")]
    Backend {
        backend: &'static str,
        op: &'static str,
        message: String,
    },
    #[error("cache node {host}:{port} is unreachable")]
    NodeFailure { host: String, port: u16 },
    #[error("`{field}` {reason}")]
    Validation { field: String, reason: String },
    #[error("option store failure: {message}")]
    OptionStore { message: String },
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn directory_missing(path: &Path) -> Self {
        Self::DirectoryMissing {
            path: path.to_path_buf(),
        }
    }

    pub fn directory_not_writable(path: &Path) -> Self {
        Self::DirectoryNotWritable {
            path: path.to_path_buf(),
        }
    }

    pub fn backend_init(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::BackendInit {
            backend,
            reason: reason.into(),
        }
    }

    pub fn backend(backend: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            op,
            message: message.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn option_store(message: impl Into<String>) -> Self {
        Self::OptionStore {
            message: message.into(),
        }
    }

    /// True for errors that leave the engine without a usable backend.
    pub fn is_init_error(&self) -> bool {
        matches!(
            self,
            Self::DirectoryMissing { .. } | Self::DirectoryNotWritable { .. } | Self::BackendInit { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_messages_name_the_path() {
        let err = CacheError::directory_missing(Path::new("/srv/cache/"));
        assert_eq!(
            err.to_string(),
            "the following cache directory must exist: /srv/cache/"
        );
        assert!(err.is_init_error());
    }

    #[test]
    fn runtime_errors_are_not_init_errors() {
        let err = CacheError::backend("file", "save", "disk full");
        assert!(!err.is_init_error());
        assert!(!CacheError::configuration("bad json").is_init_error());
    }
}

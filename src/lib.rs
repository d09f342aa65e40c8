//! Full-page HTTP response cache for content sites.
//!
//! The [`cache`] module is the reusable part: rule-based eligibility,
//! pluggable backends, record-driven invalidation and an axum middleware.
//! [`config`] and [`infra`] wire it into the `pagecache` binary.

pub mod cache;
pub mod config;
pub mod infra;

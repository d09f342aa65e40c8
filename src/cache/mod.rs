//! Full-page response cache.
//!
//! - [`rules`]: ordered pattern policies deciding which paths are cacheable
//! - [`options`]: the persisted, admin-editable cache options
//! - [`backend`]: file, in-memory, memcached and accelerator stores
//! - [`PageCacher`]: options + rules + backend, with collected errors
//! - [`PageCacheHandle`]: the shared engine, replaced on forced reload
//! - [`InvalidationCoordinator`]: blacklist proposals and flushes on record changes
//! - [`CacheAdmin`]: clear cache, update configuration, uninstall
//! - [`page_cache_layer`]: the axum middleware serving and capturing pages

mod admin;
pub mod backend;
mod config;
mod coordinator;
mod engine;
mod error;
mod events;
mod handle;
mod keys;
pub(crate) mod lock;
mod middleware;
pub mod options;
pub mod rules;

pub use admin::{AdminError, CacheAdmin};
pub use backend::{BackendConfig, BackendKind, InvalidationScope, PageBackend, StoredPage};
pub(crate) use config::MAX_HASHED_DIRECTORY_LEVEL;
pub use config::{
    BackendSettings, FileBackendSettings, MemcachedServer, MemcachedSettings, ReadControl,
    XcacheSettings,
};
pub use coordinator::{
    BlacklistContributor, ContributorError, InvalidationCoordinator, InvalidationOutcome,
};
pub use engine::{CacheEnvironment, ForcedCaching, PageCacher, PageFrontend};
pub use error::CacheError;
pub use events::{RecordAction, RecordChange, RecordRef, UnknownRecordAction};
pub use handle::PageCacheHandle;
pub use keys::{
    BypassReason, Fingerprint, RequestIdentity, SessionVars, check_eligibility, has_uploads,
};
pub use middleware::{
    AdminInterface, CacheOutcome, DEBUG_HEADER, DEFAULT_ADMIN_PREFIX, DEFAULT_MAX_BODY_BYTES,
    PageCacheState, page_cache_layer,
};
pub use options::{CacheOptions, FileOptionStore, MemoryOptionStore, OptionStore};
pub use rules::{PatternPolicy, RuleMap, RuleSet, WhitelistContributor};

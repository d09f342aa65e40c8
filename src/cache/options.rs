//! Persisted cache options.
//!
//! The options live as one versioned JSON record under [`OPTIONS_KEY`] in the
//! host's key/value [`OptionStore`]:
//!
//! ```json
//! { "version": 1, "options": { "cache_lifetime": 7200, ... } }
//! ```
//!
//! A missing key yields the defaults. A record that does not decode, or that
//! carries another version, also yields the defaults and is logged.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::BackendKind;
use super::error::CacheError;
use super::rules::{PatternPolicy, RuleMap, compile_pattern};

/// Well-known option store key holding the cache options record.
pub const OPTIONS_KEY: &str = "page_caching_page_cacher";
const OPTIONS_VERSION: u32 = 1;
const DEFAULT_CACHE_LIFETIME_SECS: u64 = 7200;
/// Bookkeeping file that does not count as cache content.
pub const CONTROL_FILE: &str = ".htaccess";

/// Form keys accepted by [`CacheOptions::set_option`].
pub mod keys {
    pub const ENABLE_DEBUGGING: &str = "enable_debugging";
    pub const CACHE_LIFETIME: &str = "cache_lifetime";
    pub const AUTO_CLEAR: &str = "automatically_clear_cache_after_record_change";
    pub const ADMIN_BLACKLIST_TEXT: &str = "admin_blacklist_text";
    pub const CACHE_DIR_PATH: &str = "cache_dir_path";
    pub const BACKEND_NAME: &str = "backend_name";
}

/// Cache-wide options, edited from the admin form and by record-change handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub enable_debugging: bool,
    pub cache_lifetime: u64,
    pub automatically_clear_cache_after_record_change: bool,
    pub admin_blacklist: RuleMap,
    /// Rules proposed by record-change contributors. Reset whenever the
    /// store is wiped or found empty.
    pub plugins_blacklist: RuleMap,
    pub cache_dir_path: String,
    pub backend_name: BackendKind,
    #[serde(skip)]
    default_directory: String,
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    options: &'a CacheOptions,
}

#[derive(Deserialize)]
struct Persisted {
    version: u32,
    options: CacheOptions,
}

impl CacheOptions {
    /// Defaults with `default_directory` as the cache directory.
    pub fn defaults(default_directory: impl Into<String>) -> Self {
        let default_directory = default_directory.into();
        Self {
            enable_debugging: false,
            cache_lifetime: DEFAULT_CACHE_LIFETIME_SECS,
            automatically_clear_cache_after_record_change: true,
            admin_blacklist: RuleMap::new(),
            plugins_blacklist: RuleMap::new(),
            cache_dir_path: default_directory.clone(),
            backend_name: BackendKind::default(),
            default_directory,
        }
    }

    pub fn encode(&self) -> Result<String, CacheError> {
        serde_json::to_string(&PersistedRef {
            version: OPTIONS_VERSION,
            options: self,
        })
        .map_err(|err| CacheError::configuration(err.to_string()))
    }

    pub fn decode(raw: &str, default_directory: impl Into<String>) -> Result<Self, CacheError> {
        let persisted: Persisted =
            serde_json::from_str(raw).map_err(|err| CacheError::configuration(err.to_string()))?;
        if persisted.version != OPTIONS_VERSION {
            return Err(CacheError::configuration(format!(
                "unsupported options version {}",
                persisted.version
            )));
        }
        let mut options = persisted.options;
        options.default_directory = default_directory.into();
        Ok(options)
    }

    /// Reads the record from `store`, falling back to defaults.
    pub async fn load(store: &dyn OptionStore, default_directory: &str) -> Self {
        let raw = match store.get(OPTIONS_KEY).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "Failed to read cache options; using defaults");
                None
            }
        };

        let Some(raw) = raw else {
            debug!("No cache options stored; using defaults");
            return Self::defaults(default_directory);
        };

        Self::decode(&raw, default_directory).unwrap_or_else(|err| {
            warn!(error = %err, "Discarding malformed cache options; using defaults");
            Self::defaults(default_directory)
        })
    }

    pub async fn save(&self, store: &dyn OptionStore) -> Result<(), CacheError> {
        store.set(OPTIONS_KEY, &self.encode()?).await
    }

    pub async fn delete(store: &dyn OptionStore) -> Result<(), CacheError> {
        store.delete(OPTIONS_KEY).await
    }

    /// Applies every pair in order, stopping at the first invalid value.
    pub fn set_options<'a, I>(&mut self, pairs: I) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        pairs
            .into_iter()
            .try_for_each(|(key, value)| self.set_option(key, value))
    }

    /// Applies one admin form value. Unknown keys are ignored.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        match key {
            keys::ENABLE_DEBUGGING => self.enable_debugging = parse_flag(key, value)?,
            keys::AUTO_CLEAR => {
                self.automatically_clear_cache_after_record_change = parse_flag(key, value)?
            }
            keys::CACHE_LIFETIME => {
                self.cache_lifetime = value.trim().parse().map_err(|_| {
                    CacheError::validation(key, "must be a whole number of seconds")
                })?
            }
            keys::BACKEND_NAME => {
                self.backend_name = value
                    .parse()
                    .map_err(|reason: String| CacheError::validation(key, reason))?
            }
            keys::CACHE_DIR_PATH => self.set_cache_directory_path(value),
            keys::ADMIN_BLACKLIST_TEXT => self.set_admin_blacklist_text(value)?,
            _ => debug!(key, "Ignoring unknown cache option"),
        }
        Ok(())
    }

    /// Replaces the admin blacklist with one entry per non-blank line.
    ///
    /// Lines are trimmed and given exactly one leading `/`.
    pub fn set_admin_blacklist_text(&mut self, text: &str) -> Result<(), CacheError> {
        let mut blacklist = RuleMap::new();
        for (index, line) in text.split('\n').enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let pattern = format!("/{}", line.trim_start_matches('/'));
            compile_pattern(&pattern).map_err(|err| {
                CacheError::validation(
                    keys::ADMIN_BLACKLIST_TEXT,
                    format!("line {} is not a valid pattern: {err}", index + 1),
                )
            })?;
            blacklist.insert(PatternPolicy::forbid(pattern));
        }
        self.admin_blacklist = blacklist;
        Ok(())
    }

    /// Admin blacklist patterns, one per line.
    pub fn admin_blacklist_text(&self) -> String {
        self.admin_blacklist
            .patterns()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stores `/<path>/`, or the default directory when `path` is blank.
    pub fn set_cache_directory_path(&mut self, path: &str) {
        let trimmed = path.trim().trim_matches('/');
        self.cache_dir_path = if trimmed.trim().is_empty() {
            self.default_directory.clone()
        } else {
            format!("/{trimmed}/")
        };
    }

    /// The configured directory, or the default one when blank.
    pub fn cache_directory_path(&self) -> PathBuf {
        if self.cache_dir_path.trim().is_empty() {
            PathBuf::from(&self.default_directory)
        } else {
            PathBuf::from(&self.cache_dir_path)
        }
    }

    pub fn default_directory(&self) -> &str {
        &self.default_directory
    }

    /// Returns true when the blacklist changed.
    pub fn merge_plugins_blacklist(&mut self, additions: &RuleMap) -> bool {
        self.plugins_blacklist.merge(additions)
    }

    /// Returns true when there was anything to clear.
    pub fn reset_plugins_blacklist(&mut self) -> bool {
        let had_entries = !self.plugins_blacklist.is_empty();
        self.plugins_blacklist.clear();
        had_entries
    }
}

/// Checkbox semantics: an empty value is unchecked.
fn parse_flag(key: &str, value: &str) -> Result<bool, CacheError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "" | "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(CacheError::validation(key, "must be a boolean")),
    }
}

pub async fn directory_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

pub async fn directory_is_readable_writable(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() && !metadata.permissions().readonly() => {
            fs::read_dir(path).await.is_ok()
        }
        _ => false,
    }
}

/// True when the directory holds nothing but the control file, and also
/// whenever it is not both readable and writable.
pub async fn directory_is_empty(path: &Path) -> bool {
    if !directory_is_readable_writable(path).await {
        return true;
    }
    let Ok(mut entries) = fs::read_dir(path).await else {
        return true;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name() != CONTROL_FILE {
            return false;
        }
    }
    true
}

/// The host's generic key/value option store.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryOptionStore {
    values: DashMap<String, String>,
}

impl MemoryOptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OptionStore for MemoryOptionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.values.get(key).map(|value| value.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Option store backed by a JSON object in one file.
#[derive(Debug)]
pub struct FileOptionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileOptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, CacheError> {
        match fs::read(&self.path).await {
            Ok(raw) if raw.is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| {
                CacheError::option_store(format!("{} is not valid: {err}", self.path.display()))
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(CacheError::option_store(format!(
                "failed to read {}: {err}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, values: &BTreeMap<String, String>) -> Result<(), CacheError> {
        let contents = serde_json::to_vec_pretty(values)
            .map_err(|err| CacheError::option_store(err.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CacheError::option_store(err.to_string()))?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "options.json".to_string());
        let temp = self
            .path
            .with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&contents).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &self.path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::option_store(format!(
                "failed to write {}: {err}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl OptionStore for FileOptionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.read_all().await?;
        if values.remove(key).is_some() {
            self.write_all(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const DEFAULT_DIR: &str = "/srv/pagecache/cache/";

    #[test]
    fn defaults_match_documented_values() {
        let options = CacheOptions::defaults(DEFAULT_DIR);
        assert!(!options.enable_debugging);
        assert_eq!(options.cache_lifetime, 7200);
        assert!(options.automatically_clear_cache_after_record_change);
        assert!(options.admin_blacklist.is_empty());
        assert!(options.plugins_blacklist.is_empty());
        assert_eq!(options.cache_dir_path, DEFAULT_DIR);
        assert_eq!(options.backend_name, BackendKind::File);
    }

    #[tokio::test]
    async fn save_then_load_is_lossless() {
        let store = MemoryOptionStore::new();
        let mut options = CacheOptions::defaults(DEFAULT_DIR);
        options
            .set_options([
                (keys::CACHE_LIFETIME, "3600"),
                (keys::BACKEND_NAME, "memcached"),
                (keys::ENABLE_DEBUGGING, "1"),
                (keys::AUTO_CLEAR, "0"),
                (keys::CACHE_DIR_PATH, "/var/cache/pages"),
                (keys::ADMIN_BLACKLIST_TEXT, "/items/browse\n/search"),
            ])
            .expect("valid options");
        options.merge_plugins_blacklist(&[PatternPolicy::forbid("/items/show/42")].into_iter().collect());

        options.save(&store).await.expect("save");
        let loaded = CacheOptions::load(&store, DEFAULT_DIR).await;
        assert_eq!(loaded, options);
    }

    #[tokio::test]
    async fn missing_or_malformed_record_yields_defaults() {
        let store = MemoryOptionStore::new();
        assert_eq!(
            CacheOptions::load(&store, DEFAULT_DIR).await,
            CacheOptions::defaults(DEFAULT_DIR)
        );

        store.set(OPTIONS_KEY, "a:7:{s:16:\"enable_debugging\";b:0;}").await.expect("set");
        assert_eq!(
            CacheOptions::load(&store, DEFAULT_DIR).await,
            CacheOptions::defaults(DEFAULT_DIR)
        );

        let mut future = serde_json::to_value(CacheOptions::defaults(DEFAULT_DIR)).expect("value");
        future["cache_lifetime"] = serde_json::json!(10);
        let record = serde_json::json!({ "version": 2, "options": future }).to_string();
        assert!(matches!(
            CacheOptions::decode(&record, DEFAULT_DIR),
            Err(CacheError::Configuration { .. })
        ));
    }

    #[test]
    fn blacklist_text_is_normalized() {
        let mut options = CacheOptions::defaults(DEFAULT_DIR);
        options
            .set_option(
                keys::ADMIN_BLACKLIST_TEXT,
                "  items/browse  \r\n\n///search\n   \n/exhibits$",
            )
            .expect("valid text");

        let patterns: Vec<_> = options.admin_blacklist.patterns().collect();
        assert_eq!(patterns, ["/items/browse", "/search", "/exhibits$"]);
        assert!(options.admin_blacklist.iter().all(|policy| !policy.cacheable));
        assert_eq!(options.admin_blacklist_text(), "/items/browse\n/search\n/exhibits$");
    }

    #[test]
    fn blacklist_text_round_trips() {
        let mut options = CacheOptions::defaults(DEFAULT_DIR);
        options
            .set_admin_blacklist_text("/a\n/b/c")
            .expect("valid text");
        let text = options.admin_blacklist_text();

        let mut again = CacheOptions::defaults(DEFAULT_DIR);
        again.set_admin_blacklist_text(&text).expect("valid text");
        assert_eq!(again.admin_blacklist, options.admin_blacklist);
    }

    #[test]
    fn invalid_values_are_rejected_without_partial_change() {
        let mut options = CacheOptions::defaults(DEFAULT_DIR);
        options
            .set_admin_blacklist_text("/search")
            .expect("valid text");

        let err = options
            .set_option(keys::ADMIN_BLACKLIST_TEXT, "/ok\n/items/(show")
            .expect_err("invalid regex");
        assert!(matches!(err, CacheError::Validation { ref field, .. } if field == keys::ADMIN_BLACKLIST_TEXT));
        assert_eq!(options.admin_blacklist_text(), "/search");

        assert!(options.set_option(keys::CACHE_LIFETIME, "-5").is_err());
        assert!(options.set_option(keys::CACHE_LIFETIME, "soon").is_err());
        assert!(options.set_option(keys::BACKEND_NAME, "redis").is_err());
        assert!(options.set_option(keys::ENABLE_DEBUGGING, "maybe").is_err());
        assert_eq!(options.cache_lifetime, 7200);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut options = CacheOptions::defaults(DEFAULT_DIR);
        options.set_option("install_plugin", "1").expect("ignored");
        assert_eq!(options, CacheOptions::defaults(DEFAULT_DIR));
    }

    #[test]
    fn directory_path_is_normalized() {
        let mut options = CacheOptions::defaults(DEFAULT_DIR);

        options.set_cache_directory_path("  /var/cache/pages/ ");
        assert_eq!(options.cache_dir_path, "/var/cache/pages/");

        options.set_cache_directory_path("tmp/pages");
        assert_eq!(options.cache_dir_path, "/tmp/pages/");

        options.set_cache_directory_path("  / ");
        assert_eq!(options.cache_dir_path, DEFAULT_DIR);

        options.cache_dir_path = "   ".to_string();
        assert_eq!(options.cache_directory_path(), PathBuf::from(DEFAULT_DIR));
    }

    #[tokio::test]
    async fn directory_introspection() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("missing");

        assert!(directory_exists(dir.path()).await);
        assert!(!directory_exists(&missing).await);
        assert!(directory_is_readable_writable(dir.path()).await);
        assert!(!directory_is_readable_writable(&missing).await);

        assert!(directory_is_empty(&missing).await);
        assert!(directory_is_empty(dir.path()).await);
        fs::write(dir.path().join(CONTROL_FILE), "Deny from all").await.expect("write");
        assert!(directory_is_empty(dir.path()).await);
        fs::write(dir.path().join("pagecache---abc"), "x").await.expect("write");
        assert!(!directory_is_empty(dir.path()).await);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("state").join("options.json");

        let store = FileOptionStore::new(&path);
        assert_eq!(store.get(OPTIONS_KEY).await.expect("get"), None);
        store.set(OPTIONS_KEY, "{\"version\":1}").await.expect("set");
        store.set("other", "kept").await.expect("set");

        let reopened = FileOptionStore::new(&path);
        assert_eq!(
            reopened.get(OPTIONS_KEY).await.expect("get").as_deref(),
            Some("{\"version\":1}")
        );

        reopened.delete(OPTIONS_KEY).await.expect("delete");
        assert_eq!(store.get(OPTIONS_KEY).await.expect("get"), None);
        assert_eq!(store.get("other").await.expect("get").as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn corrupt_option_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("options.json");
        fs::write(&path, "not json").await.expect("write");

        let store = FileOptionStore::new(&path);
        assert!(matches!(
            store.get(OPTIONS_KEY).await,
            Err(CacheError::OptionStore { .. })
        ));
    }
}

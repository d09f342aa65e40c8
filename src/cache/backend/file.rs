//! Filesystem page store.
//!
//! Layout below the cache directory:
//!
//! ```text
//! <dir>/<prefix>--a/<prefix>--ab/<prefix>---<fingerprint>
//! ```
//!
//! with one hashed level per `hashed_directory_level`. Each entry file starts
//! with a control line (`sha256:<hex>`, `length:<n>` or empty) followed by the
//! encoded page. Entries are written to a temporary file and renamed into
//! place, so readers only ever see complete entries.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BackendKind, InvalidationScope, PageBackend, StoredPage};
use crate::cache::config::{FileBackendSettings, ReadControl};
use crate::cache::error::CacheError;
use crate::cache::keys::Fingerprint;

const NAME: &str = "file";

pub struct FileBackend {
    directory: PathBuf,
    options: FileBackendSettings,
}

impl FileBackend {
    pub fn new(directory: PathBuf, options: FileBackendSettings) -> Self {
        Self { directory, options }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_prefix(&self) -> String {
        format!("{}---", self.options.file_name_prefix)
    }

    fn hashed_prefix(&self) -> String {
        format!("{}--", self.options.file_name_prefix)
    }

    fn temp_prefix(&self) -> String {
        format!(".{}-", self.options.file_name_prefix)
    }

    fn entry_dir(&self, key: &Fingerprint) -> PathBuf {
        let hex = key.as_str();
        let mut dir = self.directory.clone();
        for level in 0..usize::from(self.options.hashed_directory_level) {
            let Some(segment) = hex.get(..=level) else {
                break;
            };
            dir.push(format!("{}{segment}", self.hashed_prefix()));
        }
        dir
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        self.entry_dir(key)
            .join(format!("{}{}", self.entry_prefix(), key.as_str()))
    }

    fn control_line(&self, payload: &[u8]) -> String {
        if !self.options.read_control {
            return String::new();
        }
        match self.options.read_control_type {
            ReadControl::Sha256 => format!("sha256:{}", hex::encode(Sha256::digest(payload))),
            ReadControl::Length => format!("length:{}", payload.len()),
        }
    }

    /// Splits an entry file and verifies its control line.
    fn verify<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        let newline = raw.iter().position(|byte| *byte == b'\n')?;
        let (control, payload) = (&raw[..newline], &raw[newline + 1..]);
        if !self.options.read_control {
            return Some(payload);
        }
        let expected = self.control_line(payload);
        (control == expected.as_bytes()).then_some(payload)
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or(self.directory.as_path());
        fs::create_dir_all(dir).await?;

        let temp = dir.join(format!("{}{}.tmp", self.temp_prefix(), Uuid::new_v4().simple()));
        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(contents).await?;
            if self.options.file_locking {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&temp, path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        result
    }

    async fn remove_entry(&self, path: &Path) -> Result<bool, CacheError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CacheError::backend(NAME, "remove", err.to_string())),
        }
    }

    async fn should_remove(&self, path: &Path, scope: InvalidationScope) -> bool {
        match scope {
            InvalidationScope::All => true,
            InvalidationScope::ExpiredOnly => match fs::read(path).await {
                Ok(raw) => match self.verify(&raw).map(StoredPage::decode) {
                    Some(Ok(page)) => page.is_expired(),
                    _ => true,
                },
                Err(_) => false,
            },
        }
    }

    /// Walks `dir`, removing matching entries and hashed directories left empty.
    async fn clean_dir(&self, root: &Path, scope: InvalidationScope) -> Result<usize, CacheError> {
        let entry_prefix = self.entry_prefix();
        let hashed_prefix = self.hashed_prefix();
        let temp_prefix = self.temp_prefix();
        let mut removed = 0;

        // Depth-first, children before their parent directory.
        let mut pending = vec![(root.to_path_buf(), false)];
        while let Some((dir, visited)) = pending.pop() {
            if visited {
                if dir != root && fs::remove_dir(&dir).await.is_ok() {
                    debug!(path = %dir.display(), "Removed empty hashed cache directory");
                }
                continue;
            }
            pending.push((dir.clone(), true));

            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| CacheError::backend(NAME, "clean", err.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| CacheError::backend(NAME, "clean", err.to_string()))?
            {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let path = entry.path();
                let is_dir = entry.file_type().await.map(|ty| ty.is_dir()).unwrap_or(false);

                if is_dir {
                    if name.starts_with(hashed_prefix.as_str()) && !name.starts_with(entry_prefix.as_str()) {
                        pending.push((path, false));
                    }
                } else if name.starts_with(entry_prefix.as_str()) {
                    if self.should_remove(&path, scope).await && self.remove_entry(&path).await? {
                        removed += 1;
                    }
                } else if scope == InvalidationScope::All && name.starts_with(temp_prefix.as_str()) {
                    self.remove_entry(&path).await?;
                }
            }
        }

        Ok(removed)
    }
}

#[async_trait]
impl PageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn load(&self, key: &Fingerprint) -> Result<Option<StoredPage>, CacheError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CacheError::backend(NAME, "load", err.to_string())),
        };

        match self.verify(&raw).map(StoredPage::decode) {
            Some(Ok(page)) => Ok(Some(page)),
            Some(Err(err)) => {
                warn!(path = %path.display(), error = %err, "Dropping undecodable cache entry");
                self.remove_entry(&path).await?;
                Ok(None)
            }
            None => {
                warn!(
                    path = %path.display(),
                    read_control = %self.options.read_control_type,
                    "Dropping cache entry that failed read control"
                );
                self.remove_entry(&path).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, key: &Fingerprint, page: &StoredPage) -> Result<(), CacheError> {
        let payload = page
            .encode()
            .map_err(|err| CacheError::backend(NAME, "save", err.to_string()))?;

        let control = self.control_line(&payload);
        let mut contents = Vec::with_capacity(control.len() + 1 + payload.len());
        contents.extend_from_slice(control.as_bytes());
        contents.push(b'\n');
        contents.extend_from_slice(&payload);

        self.write_atomic(&self.entry_path(key), &contents)
            .await
            .map_err(|err| CacheError::backend(NAME, "save", err.to_string()))
    }

    async fn clean(&self, scope: InvalidationScope) -> Result<usize, CacheError> {
        self.clean_dir(&self.directory, scope).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::RequestIdentity;

    fn backend(dir: &Path, configure: impl FnOnce(&mut FileBackendSettings)) -> FileBackend {
        let mut options = FileBackendSettings::default();
        configure(&mut options);
        FileBackend::new(dir.to_path_buf(), options)
    }

    fn page(body: &'static [u8]) -> StoredPage {
        StoredPage::new(200, Some("text/html".to_string()), Bytes::from_static(body), 0)
    }

    fn key(path: &str) -> Fingerprint {
        RequestIdentity::new(path).fingerprint()
    }

    async fn names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.expect("read dir");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn saved_page_loads_back() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |_| {});
        let key = key("/items/show/1");

        backend.save(&key, &page(b"<p>item</p>")).await.expect("save");
        let loaded = backend.load(&key).await.expect("load").expect("hit");
        assert_eq!(loaded.body, Bytes::from_static(b"<p>item</p>"));
        assert_eq!(loaded.content_type.as_deref(), Some("text/html"));

        let files = names(dir.path()).await;
        assert_eq!(files, vec![format!("pagecache---{}", key.as_str())]);
    }

    #[tokio::test]
    async fn hashed_directories_follow_level() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |options| options.hashed_directory_level = 2);
        let key = key("/");
        let hex = key.as_str();

        backend.save(&key, &page(b"home")).await.expect("save");
        let expected = dir
            .path()
            .join(format!("pagecache--{}", &hex[..1]))
            .join(format!("pagecache--{}", &hex[..2]))
            .join(format!("pagecache---{hex}"));
        assert!(fs::metadata(&expected).await.is_ok());
    }

    #[tokio::test]
    async fn tampered_entry_is_dropped() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |_| {});
        let key = key("/collections");
        backend.save(&key, &page(b"collections")).await.expect("save");

        let path = backend.entry_path(&key);
        let mut raw = fs::read(&path).await.expect("read");
        if let Some(last) = raw.last_mut() {
            *last = b' ';
        }
        fs::write(&path, raw).await.expect("write");

        assert!(backend.load(&key).await.expect("load").is_none());
        assert!(fs::metadata(&path).await.is_err());
    }

    #[tokio::test]
    async fn length_control_detects_truncation() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |options| {
            options.read_control_type = ReadControl::Length;
        });
        let key = key("/items");
        backend.save(&key, &page(b"items")).await.expect("save");

        let path = backend.entry_path(&key);
        let raw = fs::read(&path).await.expect("read");
        fs::write(&path, &raw[..raw.len() - 3]).await.expect("write");

        assert!(backend.load(&key).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn full_clean_keeps_control_and_foreign_files() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |options| options.hashed_directory_level = 1);
        fs::write(dir.path().join(".htaccess"), "Deny from all").await.expect("write");
        fs::write(dir.path().join("notes.txt"), "keep").await.expect("write");

        for path in ["/", "/items", "/collections"] {
            backend.save(&key(path), &page(b"x")).await.expect("save");
        }

        let removed = backend.clean(InvalidationScope::All).await.expect("clean");
        assert_eq!(removed, 3);
        assert_eq!(names(dir.path()).await, vec![".htaccess", "notes.txt"]);
    }

    #[tokio::test]
    async fn expired_clean_removes_only_stale_entries() {
        let dir = TempDir::new().expect("tempdir");
        let backend = backend(dir.path(), |_| {});
        let live = key("/items");
        let stale = key("/collections");

        backend.save(&live, &page(b"live")).await.expect("save");
        let mut old = page(b"old");
        old.expires_at = Some(old.created_at - 1);
        backend.save(&stale, &old).await.expect("save");

        assert_eq!(backend.clean(InvalidationScope::ExpiredOnly).await.expect("clean"), 1);
        assert!(backend.load(&live).await.expect("load").is_some());
        assert!(backend.load(&stale).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_complete_entry() {
        let dir = TempDir::new().expect("tempdir");
        let backend = std::sync::Arc::new(backend(dir.path(), |_| {}));
        let key = key("/items/browse");

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                let key = key.clone();
                tokio::spawn(async move { backend.save(&key, &page(b"same output")).await })
            })
            .collect();
        for writer in writers {
            writer.await.expect("join").expect("save");
        }

        let loaded = backend.load(&key).await.expect("load").expect("hit");
        assert_eq!(loaded.body, Bytes::from_static(b"same output"));
        assert_eq!(names(dir.path()).await.len(), 1);
    }
}

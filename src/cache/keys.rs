//! Request fingerprints and cache eligibility.
//!
//! A fingerprint covers the path, GET parameters, form body, upload presence
//! and session variables. Cookies never contribute; they are present on
//! nearly every request and would only fragment the cache.

use std::collections::BTreeMap;
use std::fmt;

use axum::http::{HeaderMap, Method, header};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Derived cache key for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable numeric view of the digest, used for node selection.
    pub fn bucket(&self) -> u64 {
        self.0
            .get(..16)
            .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session variables of the current visitor.
///
/// The host authentication layer inserts this as a request extension so
/// distinct logged-in identities never share an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionVars(pub BTreeMap<String, String>);

impl SessionVars {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }
}

/// Cache-relevant components of a request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestIdentity {
    path: String,
    get: Vec<(String, String)>,
    post: Vec<(String, String)>,
    files: bool,
    session: BTreeMap<String, String>,
}

impl RequestIdentity {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Parameter order does not matter: `?a=1&b=2` and `?b=2&a=1` share a key.
    pub fn with_query(mut self, query: Option<&str>) -> Self {
        self.get = parse_pairs(query.unwrap_or_default().as_bytes());
        self
    }

    pub fn with_form(mut self, body: &[u8]) -> Self {
        self.post = parse_pairs(body);
        self
    }

    pub fn with_files(mut self, files: bool) -> Self {
        self.files = files;
        self
    }

    pub fn with_session(mut self, session: Option<&SessionVars>) -> Self {
        self.session = session.map(|vars| vars.0.clone()).unwrap_or_default();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fingerprint(&self) -> Fingerprint {
        // Serializing a plain struct of owned strings cannot fail.
        let encoded = serde_json::to_vec(self).unwrap_or_else(|_| self.path.clone().into_bytes());
        Fingerprint(hex::encode(Sha256::digest(&encoded)))
    }
}

fn parse_pairs(input: &[u8]) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(input)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();
    pairs
}

/// Why a request was passed straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Anything but GET, which covers every request carrying POST data.
    Method,
    Upload,
    Admin,
    NotWhitelisted,
    Unavailable,
    /// Response body of unknown length or over the buffering limit.
    Size,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Upload => "upload",
            Self::Admin => "admin",
            Self::NotWhitelisted => "rule",
            Self::Unavailable => "unavailable",
            Self::Size => "size",
        }
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when the request carries uploaded files.
pub fn has_uploads(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("multipart/form-data")
        })
}

/// Request-level gates applied before any rule is consulted.
///
/// Cookies are deliberately not inspected here.
pub fn check_eligibility(method: &Method, headers: &HeaderMap, admin: bool) -> Result<(), BypassReason> {
    if admin {
        return Err(BypassReason::Admin);
    }
    if method != Method::GET {
        return Err(BypassReason::Method);
    }
    if has_uploads(headers) {
        return Err(BypassReason::Upload);
    }
    Ok(())
}

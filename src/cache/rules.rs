//! Whitelist and blacklist rules.
//!
//! Rules are regular expressions searched (unanchored) in the request path.
//! The effective list is built by inserting the whitelist, then the admin
//! blacklist, then the blacklist contributed by other components. Inserting
//! a pattern that is already present overwrites it in place, so a blacklist
//! entry with the same literal pattern as a whitelist entry replaces it.
//! When several patterns match a path, the last one in the list decides.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Caching policy attached to one pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternPolicy {
    pub pattern: String,
    pub cacheable: bool,
}

impl PatternPolicy {
    /// Whitelist entry.
    pub fn allow(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            cacheable: true,
        }
    }

    /// Blacklist entry.
    pub fn forbid(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            cacheable: false,
        }
    }
}

/// Ordered pattern → policy mapping keyed by the literal pattern string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleMap {
    entries: Vec<PatternPolicy>,
}

impl RuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by pattern. Returns true when the map changed.
    ///
    /// An overwritten entry keeps its original position.
    pub fn insert(&mut self, policy: PatternPolicy) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.pattern == policy.pattern)
        {
            Some(existing) if *existing == policy => false,
            Some(existing) => {
                *existing = policy;
                true
            }
            None => {
                self.entries.push(policy);
                true
            }
        }
    }

    /// Insert every entry of `other` in order. Returns true when anything changed.
    pub fn merge(&mut self, other: &RuleMap) -> bool {
        other
            .iter()
            .fold(false, |changed, policy| self.insert(policy.clone()) || changed)
    }

    pub fn get(&self, pattern: &str) -> Option<&PatternPolicy> {
        self.entries.iter().find(|policy| policy.pattern == pattern)
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.get(pattern).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternPolicy> {
        self.entries.iter()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|policy| policy.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<PatternPolicy> for RuleMap {
    fn from_iter<I: IntoIterator<Item = PatternPolicy>>(iter: I) -> Self {
        let mut map = Self::new();
        for policy in iter {
            map.insert(policy);
        }
        map
    }
}

/// Lets other components extend the built-in whitelist when rule sets are built.
pub trait WhitelistContributor: Send + Sync {
    fn extend_whitelist(&self, whitelist: &mut RuleMap);
}

/// Home page, item pages and collection pages.
pub fn default_whitelist() -> RuleMap {
    [
        "/$",
        "/items$",
        "/items/show",
        "/items/browse",
        "/items/tags",
        "/items/index",
        "/collections$",
        "/collections/show/",
        "/collections/browse/",
    ]
    .into_iter()
    .map(PatternPolicy::allow)
    .collect()
}

/// Default whitelist with every contributor applied in registration order.
pub fn build_whitelist(contributors: &[Arc<dyn WhitelistContributor>]) -> RuleMap {
    let mut whitelist = default_whitelist();
    for contributor in contributors {
        contributor.extend_whitelist(&mut whitelist);
    }
    whitelist
}

/// Compiles one pattern the way rule sets do.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(pattern)
}

#[derive(Debug)]
struct CompiledRule {
    policy: PatternPolicy,
    regex: Regex,
}

/// Compiled, ordered rule list used to decide whether a path may be cached.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Merge whitelist, admin blacklist and contributed blacklist, then compile.
    ///
    /// Patterns that are not valid regular expressions never match; they are
    /// logged and left out.
    pub fn build(whitelist: &RuleMap, admin_blacklist: &RuleMap, plugins_blacklist: &RuleMap) -> Self {
        let mut merged = whitelist.clone();
        merged.merge(admin_blacklist);
        merged.merge(plugins_blacklist);

        let rules = merged
            .iter()
            .filter_map(|policy| match compile_pattern(&policy.pattern) {
                Ok(regex) => Some(CompiledRule {
                    policy: policy.clone(),
                    regex,
                }),
                Err(err) => {
                    warn!(
                        pattern = %policy.pattern,
                        error = %err,
                        "Skipping cache rule with invalid pattern"
                    );
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// The last rule whose pattern matches `path`, if any.
    pub fn decide(&self, path: &str) -> Option<&PatternPolicy> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.regex.is_match(path))
            .map(|rule| &rule.policy)
    }

    /// Paths without a matching rule are not cached.
    pub fn is_cacheable(&self, path: &str) -> bool {
        self.decide(path).is_some_and(|policy| policy.cacheable)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist(patterns: &[&str]) -> RuleMap {
        patterns.iter().copied().map(PatternPolicy::forbid).collect()
    }

    #[test]
    fn whitelisted_paths_are_cacheable() {
        let rules = RuleSet::build(&default_whitelist(), &RuleMap::new(), &RuleMap::new());

        for path in [
            "/",
            "/items",
            "/items/show/42",
            "/items/browse",
            "/items/browse/",
            "/items/tags",
            "/items/index",
            "/collections",
            "/collections/show/3",
            "/collections/browse/",
        ] {
            assert!(rules.is_cacheable(path), "{path} should be cacheable");
        }
    }

    #[test]
    fn unmatched_paths_are_not_cacheable() {
        let rules = RuleSet::build(&default_whitelist(), &RuleMap::new(), &RuleMap::new());

        assert!(rules.decide("/search").is_none());
        assert!(!rules.is_cacheable("/search"));
        assert!(!rules.is_cacheable("/exhibits/show/1"));
    }

    #[test]
    fn blacklist_with_same_key_overrides_whitelist() {
        let rules = RuleSet::build(
            &default_whitelist(),
            &blacklist(&["/items/browse"]),
            &RuleMap::new(),
        );

        assert!(!rules.is_cacheable("/items/browse"));
        assert!(rules.is_cacheable("/items/show/1"));
        assert_eq!(rules.len(), default_whitelist().len());
    }

    #[test]
    fn last_matching_rule_wins() {
        let whitelist: RuleMap = [PatternPolicy::allow("/items"), PatternPolicy::allow("/items/show")]
            .into_iter()
            .collect();
        let admin = blacklist(&["/items"]);
        let rules = RuleSet::build(&whitelist, &admin, &RuleMap::new());

        // `/items` was overwritten in place, so `/items/show` still comes later.
        assert!(rules.is_cacheable("/items/show/7"));
        assert!(!rules.is_cacheable("/items/browse"));

        let plugins = blacklist(&["/items/show/7"]);
        let rules = RuleSet::build(&whitelist, &admin, &plugins);
        assert!(!rules.is_cacheable("/items/show/7"));
        assert!(rules.is_cacheable("/items/show/8"));
    }

    #[test]
    fn plugins_blacklist_overrides_admin_entry_with_same_key() {
        let admin = blacklist(&["/search"]);
        let plugins: RuleMap = [PatternPolicy::allow("/search")].into_iter().collect();
        let rules = RuleSet::build(&default_whitelist(), &admin, &plugins);

        assert!(rules.is_cacheable("/search"));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let rules = RuleSet::build(&default_whitelist(), &blacklist(&["/items/(show"]), &RuleMap::new());

        assert_eq!(rules.len(), default_whitelist().len());
        assert!(rules.is_cacheable("/items/show/1"));
    }

    #[test]
    fn merge_reports_changes_and_is_idempotent() {
        let additions = blacklist(&["/items/show/42", "/collections/show/3"]);

        let mut once = RuleMap::new();
        assert!(once.merge(&additions));

        let mut twice = once.clone();
        assert!(!twice.merge(&additions));
        assert_eq!(once, twice);
    }

    #[test]
    fn insert_overwrites_in_place() {
        let mut map: RuleMap = [PatternPolicy::allow("/a"), PatternPolicy::allow("/b")]
            .into_iter()
            .collect();

        assert!(map.insert(PatternPolicy::forbid("/a")));
        let patterns: Vec<_> = map.patterns().collect();
        assert_eq!(patterns, ["/a", "/b"]);
        assert_eq!(map.get("/a"), Some(&PatternPolicy::forbid("/a")));
    }

    #[test]
    fn contributors_extend_whitelist() {
        struct Exhibits;

        impl WhitelistContributor for Exhibits {
            fn extend_whitelist(&self, whitelist: &mut RuleMap) {
                whitelist.insert(PatternPolicy::allow("/exhibits/show"));
            }
        }

        let contributors: Vec<Arc<dyn WhitelistContributor>> = vec![Arc::new(Exhibits)];
        let whitelist = build_whitelist(&contributors);
        let rules = RuleSet::build(&whitelist, &RuleMap::new(), &RuleMap::new());

        assert!(rules.is_cacheable("/exhibits/show/intro"));
        assert!(whitelist.contains("/$"));
    }

    #[test]
    fn rule_map_serializes_as_ordered_list() {
        let map = blacklist(&["/search", "/items/browse"]);
        let json = serde_json::to_string(&map).expect("serialize");
        assert_eq!(
            json,
            r#"[{"pattern":"/search","cacheable":false},{"pattern":"/items/browse","cacheable":false}]"#
        );
        let decoded: RuleMap = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, map);
    }
}

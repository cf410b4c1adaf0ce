//! Local artifacts purged when a session ends.

use crate::storage::TabStorage;

/// Placeholder substituted with the signed-out user's id.
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// Keys dropped on every sign-out. Templates containing `{user_id}` match
/// that key for any user.
pub const DEFAULT_CLEAR_KEYS: &[&str] = &[
    "run_result",
    "selectedProblems",
    "dbConnectionData",
    "generation_progress",
    "subscription_status_{user_id}",
    "cached_avatar_{user_id}",
    "cached_apps_{user_id}",
];

/// A clear-key, either exact or a `{user_id}` template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyPattern {
    Exact(String),
    PerUser { prefix: String, suffix: String },
}

impl KeyPattern {
    fn parse(template: &str) -> Self {
        match template.split_once(USER_ID_PLACEHOLDER) {
            Some((prefix, suffix)) => Self::PerUser {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            },
            None => Self::Exact(template.to_string()),
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => key == exact,
            Self::PerUser { prefix, suffix } => {
                key.len() > prefix.len() + suffix.len()
                    && key.starts_with(prefix.as_str())
                    && key.ends_with(suffix.as_str())
            }
        }
    }
}

/// Purges the clear-on-sign-out keys from tab storage.
#[derive(Clone)]
pub struct LocalCleanup {
    storage: TabStorage,
    patterns: Vec<KeyPattern>,
}

impl LocalCleanup {
    pub fn new(storage: TabStorage, extra_keys: &[String]) -> Self {
        let patterns = DEFAULT_CLEAR_KEYS
            .iter()
            .copied()
            .chain(extra_keys.iter().map(String::as_str))
            .map(KeyPattern::parse)
            .collect();
        Self { storage, patterns }
    }

    /// Whether `key` is one of the clear-on-sign-out keys.
    pub fn is_clear_key(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(key))
    }

    /// Remove every clear-key currently stored, for any user.
    ///
    /// `user_id` only labels the log line; per-user templates match every
    /// account, so caches left behind by an earlier account go too.
    pub fn purge(&self, user_id: Option<&str>) -> usize {
        let doomed: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|key| self.is_clear_key(key))
            .collect();
        for key in &doomed {
            self.storage.remove(key);
        }
        tracing::debug!(user_id = user_id.unwrap_or("-"), removed = doomed.len(), "Purged local artifacts");
        doomed.len()
    }
}

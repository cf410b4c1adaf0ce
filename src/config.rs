//! Configuration for the session core.
//!
//! Loaded from a TOML file (optional) and overlaid with environment
//! variables, the same way the Supabase integration reads `SUPABASE_URL`
//! and friends. Every timing knob has a default, so an empty file plus
//! the two Supabase variables is a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::auth::AuthError;

/// Default hard timeout for the initial session lookup.
const DEFAULT_INITIAL_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Default delay before the single initial-session retry.
const DEFAULT_INITIAL_SESSION_RETRY_DELAY_MS: u64 = 500;

/// Default timeout for the network sign-out call.
const DEFAULT_SIGN_OUT_TIMEOUT_MS: u64 = 4_000;

/// Default number of live-session checks before a sign-out is committed.
const DEFAULT_SIGN_OUT_VERIFY_ATTEMPTS: u32 = 3;

/// Default spacing between sign-out verification checks.
const DEFAULT_SIGN_OUT_VERIFY_INTERVAL_MS: u64 = 700;

/// Subscription status cache lifetime: 5 minutes.
const DEFAULT_SUBSCRIPTION_CACHE_TTL_SECS: u64 = 300;

/// Quiet window before an ambiguous storage change triggers a provider check.
const DEFAULT_CROSS_TAB_DEBOUNCE_MS: u64 = 150;

/// Default timeout for every outbound HTTP request.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Session core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Supabase project URL (e.g., https://xxxx.supabase.co).
    pub supabase_url: String,
    /// Public anon key sent as `apikey` on every auth request.
    pub anon_key: String,
    /// Storage key the provider persists its session under. When unset it is
    /// derived from the project URL, see [`SessionConfig::resolve_storage_key`].
    pub auth_storage_key: Option<String>,
    /// Base URL of the dashboard API serving the entitlement endpoint.
    pub api_base_url: String,
    /// Where the OAuth flow returns to after the provider redirect.
    pub oauth_redirect_to: Option<String>,
    /// Route callers are sent to after sign-out.
    pub login_path: String,
    /// Additional storage keys purged on sign-out. `{user_id}` is substituted.
    pub extra_clear_keys: Vec<String>,
    pub initial_session_timeout_ms: u64,
    pub initial_session_retry_delay_ms: u64,
    pub sign_out_timeout_ms: u64,
    pub sign_out_verify_attempts: u32,
    pub sign_out_verify_interval_ms: u64,
    pub subscription_cache_ttl_secs: u64,
    pub cross_tab_debounce_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            anon_key: String::new(),
            auth_storage_key: None,
            api_base_url: String::new(),
            oauth_redirect_to: None,
            login_path: "/login".into(),
            extra_clear_keys: Vec::new(),
            initial_session_timeout_ms: DEFAULT_INITIAL_SESSION_TIMEOUT_MS,
            initial_session_retry_delay_ms: DEFAULT_INITIAL_SESSION_RETRY_DELAY_MS,
            sign_out_timeout_ms: DEFAULT_SIGN_OUT_TIMEOUT_MS,
            sign_out_verify_attempts: DEFAULT_SIGN_OUT_VERIFY_ATTEMPTS,
            sign_out_verify_interval_ms: DEFAULT_SIGN_OUT_VERIFY_INTERVAL_MS,
            subscription_cache_ttl_secs: DEFAULT_SUBSCRIPTION_CACHE_TTL_SECS,
            cross_tab_debounce_ms: DEFAULT_CROSS_TAB_DEBOUNCE_MS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    /// Load from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults plus environment are used.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str::<Self>(&raw)
                .map_err(|e| AuthError::Config(format!("{}: {e}", path.display())))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Defaults overlaid with environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(url) = non_empty_env("SUPABASE_URL") {
            self.supabase_url = url;
        }
        if let Some(key) = non_empty_env("SUPABASE_ANON_KEY") {
            self.anon_key = key;
        }
        if let Some(base) = non_empty_env("SESSION_SYNC_API_BASE_URL") {
            self.api_base_url = base;
        }
        if let Some(key) = non_empty_env("SESSION_SYNC_AUTH_STORAGE_KEY") {
            self.auth_storage_key = Some(key);
        }
    }

    /// Reject configurations the provider client cannot work with.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.supabase_url.trim().is_empty() {
            return Err(AuthError::Config("supabase_url is not set".into()));
        }
        if self.anon_key.trim().is_empty() {
            return Err(AuthError::Config("anon_key is not set".into()));
        }
        if self.sign_out_verify_attempts == 0 {
            return Err(AuthError::Config(
                "sign_out_verify_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Storage key holding the provider's persisted session.
    ///
    /// Prefers the explicit `auth_storage_key`; otherwise derives
    /// `sb-{project_ref}-auth-token` from the first DNS label of the project
    /// URL host, which is the key the Supabase client itself uses.
    pub fn resolve_storage_key(&self) -> String {
        if let Some(key) = self.auth_storage_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return key.to_string();
            }
        }
        let host = self
            .supabase_url
            .split("://")
            .nth(1)
            .unwrap_or(&self.supabase_url);
        let host = host.split(['/', ':']).next().unwrap_or_default();
        let project_ref = host.split('.').next().unwrap_or_default();
        if project_ref.is_empty() {
            "sb-auth-token".to_string()
        } else {
            format!("sb-{project_ref}-auth-token")
        }
    }

    pub fn initial_session_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_session_timeout_ms)
    }

    pub fn initial_session_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_session_retry_delay_ms)
    }

    pub fn sign_out_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_out_timeout_ms)
    }

    pub fn sign_out_verify_interval(&self) -> Duration {
        Duration::from_millis(self.sign_out_verify_interval_ms)
    }

    pub fn subscription_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_cache_ttl_secs)
    }

    pub fn cross_tab_debounce(&self) -> Duration {
        Duration::from_millis(self.cross_tab_debounce_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

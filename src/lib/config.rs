use std::{
    collections::HashMap,
    sync::{OnceLock, RwLock},
};

use serde::{Deserialize, Serialize};

/// In-memory object cache discipline for git calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    Off,
    #[default]
    PerSession,
    PerRepoBatch,
}

/// Credential for git servers on a host (and its subdomains).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostToken {
    pub host: String,
    pub token: String,
}

/// Named options controlling the core's behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreOptions {
    #[serde(default)]
    pub cache_mode: CacheMode,
    /// Idle TTL for session caches in milliseconds.
    #[serde(default = "default_cache_max_age_ms")]
    pub cache_max_age_ms: u64,
    /// HTTP prefix applied to bridge probes, or `None` to disable.
    #[serde(default)]
    pub default_cors_proxy: Option<String>,
    /// Runtime event schema assertions. `None` follows the build profile:
    /// enabled in development, disabled in release.
    #[serde(default)]
    pub validate_events: Option<bool>,
    #[serde(default)]
    pub auth_tokens: Vec<HostToken>,
}

fn default_cache_max_age_ms() -> u64 {
    60_000
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::default(),
            cache_max_age_ms: default_cache_max_age_ms(),
            default_cors_proxy: None,
            validate_events: None,
            auth_tokens: Vec::new(),
        }
    }
}

impl CoreOptions {
    pub fn validation_enabled(&self) -> bool {
        self.validate_events.unwrap_or(cfg!(debug_assertions))
    }
}

// Process-wide stores: single writer through the guarded setters below,
// many readers taking snapshots.
static AUTH_TOKENS: OnceLock<RwLock<Vec<HostToken>>> = OnceLock::new();
static PROTOCOL_PREFS: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn auth_tokens() -> &'static RwLock<Vec<HostToken>> {
    AUTH_TOKENS.get_or_init(|| RwLock::new(Vec::new()))
}

fn protocol_prefs() -> &'static RwLock<HashMap<String, String>> {
    PROTOCOL_PREFS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Seeds the process-wide registries from options.
pub fn init_process_state(options: &CoreOptions) {
    *auth_tokens().write().expect("auth token registry poisoned") = options.auth_tokens.clone();
    protocol_prefs()
        .write()
        .expect("protocol preference registry poisoned")
        .clear();
}

/// Clears the process-wide registries.
pub fn teardown_process_state() {
    auth_tokens()
        .write()
        .expect("auth token registry poisoned")
        .clear();
    protocol_prefs()
        .write()
        .expect("protocol preference registry poisoned")
        .clear();
}

pub fn register_auth_token(host: &str, token: &str) {
    let mut tokens = auth_tokens().write().expect("auth token registry poisoned");
    tokens.retain(|t| !(t.host == host && t.token == token));
    tokens.push(HostToken {
        host: host.to_string(),
        token: token.to_string(),
    });
}

/// Tokens whose host matches `host`, suffix-aware: a token registered for
/// `example.com` also applies to `git.example.com`.
pub fn tokens_for_host(host: &str) -> Vec<String> {
    let tokens = auth_tokens().read().expect("auth token registry poisoned");
    tokens
        .iter()
        .filter(|t| host == t.host || host.ends_with(&format!(".{}", t.host)))
        .map(|t| t.token.clone())
        .collect()
}

/// Remembers the last clone URL a push to `repo_key` succeeded over.
pub fn set_protocol_preference(repo_key: &str, url: &str) {
    protocol_prefs()
        .write()
        .expect("protocol preference registry poisoned")
        .insert(repo_key.to_string(), url.to_string());
}

pub fn protocol_preference(repo_key: &str) -> Option<String> {
    protocol_prefs()
        .read()
        .expect("protocol preference registry poisoned")
        .get(repo_key)
        .cloned()
}

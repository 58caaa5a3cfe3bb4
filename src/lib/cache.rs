use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{
    config::CacheMode,
    error::{CoreError, ErrorCode, Result},
};

/// Stale window after which a persistent entry is pruned.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How much of a repository's history is present locally.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DataLevel {
    /// Ref names and head commits only.
    #[default]
    Refs,
    /// Recent history at limited depth.
    Shallow,
    /// All objects.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTip {
    pub name: String,
    pub commit: String,
}

/// Per-repository persistent cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCacheEntry {
    pub repo_id: String,
    /// Unix seconds of the last successful sync.
    pub last_updated: i64,
    pub head_commit: Option<String>,
    pub data_level: DataLevel,
    pub branches: Vec<BranchTip>,
    pub clone_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<u64>,
}

impl RepoCacheEntry {
    pub fn new(repo_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            last_updated: Utc::now().timestamp(),
            head_commit: None,
            data_level: DataLevel::Refs,
            branches: Vec::new(),
            clone_urls: Vec::new(),
            commit_count: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now().timestamp();
    }
}

/// True when the entry is stale or the relay-observed HEAD no longer
/// matches what was cached.
pub fn needs_update(
    entry: &RepoCacheEntry,
    now_unix: i64,
    observed_head: Option<&str>,
    stale_window: Duration,
) -> bool {
    if now_unix - entry.last_updated > stale_window.as_secs() as i64 {
        return true;
    }
    match (observed_head, entry.head_commit.as_deref()) {
        (Some(observed), Some(cached)) => observed != cached,
        (Some(_), None) => true,
        _ => false,
    }
}

fn sanitize_repo_file_name(repo_id: &str) -> String {
    repo_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Key-value store of [`RepoCacheEntry`] records: one JSON document per
/// repository, written atomically via a temp file and rename. Opened
/// lazily on first access.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Store under the operating system's cache directory.
    pub fn at_default_location() -> Result<Self> {
        let dirs = ProjectDirs::from("", "CodeCollaboration", "nostr-git-core").ok_or_else(
            || {
                CoreError::new(
                    ErrorCode::Filesystem,
                    "cannot locate an operating system cache directory",
                )
            },
        )?;
        Ok(Self::new(dirs.cache_dir().join("repos")))
    }

    fn entry_path(&self, repo_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", sanitize_repo_file_name(repo_id)))
    }

    pub fn get(&self, repo_id: &str) -> Result<Option<RepoCacheEntry>> {
        let path = self.entry_path(repo_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let entry: RepoCacheEntry = serde_json::from_str(&raw)?;
        Ok(Some(entry))
    }

    pub fn put(&self, entry: &RepoCacheEntry) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let path = self.entry_path(&entry.repo_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, repo_id: &str) -> Result<()> {
        let path = self.entry_path(repo_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Deletes entries older than `ttl`. Returns how many were pruned.
    pub fn prune_stale(&self, ttl: Duration, now_unix: i64) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut pruned = 0;
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<RepoCacheEntry>(&raw) else {
                // unparseable records are dead weight
                let _ = fs::remove_file(&path);
                pruned += 1;
                continue;
            };
            if now_unix - entry.last_updated > ttl.as_secs() as i64 {
                fs::remove_file(&path)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

/// Opaque per-directory session cache handed to every provider call so
/// object-layer caches survive across reads. Its identity is the
/// generation number: stable across reads, bumped exactly once per
/// mutation.
#[derive(Debug, Default)]
pub struct ObjectCache {
    generation: AtomicU64,
}

impl ObjectCache {
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Called by mutating git operations. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

struct SessionEntry {
    cache: Arc<ObjectCache>,
    last_used: Instant,
}

/// In-memory registry of per-directory [`ObjectCache`] handles, governed
/// by the configured cache mode and idle TTL.
///
/// `Off` hands out a fresh throwaway handle per call. `PerSession` keeps
/// one handle per directory until it sits idle past the TTL.
/// `PerRepoBatch` keeps the handle only for the duration of one batch of
/// operations: calls between batch boundaries share it, and
/// [`SessionCaches::end_batch`] retires it so the next batch starts with
/// a fresh identity.
pub struct SessionCaches {
    mode: CacheMode,
    max_age: Duration,
    entries: Mutex<HashMap<PathBuf, SessionEntry>>,
}

impl SessionCaches {
    pub fn new(mode: CacheMode, max_age: Duration) -> Self {
        Self {
            mode,
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The shared handle for `dir` under the configured discipline.
    pub fn handle(&self, dir: &Path) -> Arc<ObjectCache> {
        if self.mode == CacheMode::Off {
            return Arc::new(ObjectCache::default());
        }
        let mut entries = self.entries.lock().expect("session cache lock poisoned");
        let now = Instant::now();
        if self.mode == CacheMode::PerSession {
            // batch entries are retired explicitly, never by idle age: an
            // open batch must keep its identity to the end
            entries.retain(|_, entry| now.duration_since(entry.last_used) <= self.max_age);
        }
        let entry = entries
            .entry(dir.to_path_buf())
            .or_insert_with(|| SessionEntry {
                cache: Arc::new(ObjectCache::default()),
                last_used: now,
            });
        entry.last_used = now;
        entry.cache.clone()
    }

    /// Marks the end of a batch of operations on `dir`. Under
    /// `PerRepoBatch` the handle is retired so the next batch starts
    /// fresh; the other modes are unaffected.
    pub fn end_batch(&self, dir: &Path) {
        if self.mode == CacheMode::PerRepoBatch {
            self.entries
                .lock()
                .expect("session cache lock poisoned")
                .remove(dir);
        }
    }

    /// Forces a new identity for `dir` after an out-of-band mutation.
    pub fn invalidate(&self, dir: &Path) {
        let entries = self.entries.lock().expect("session cache lock poisoned");
        if let Some(entry) = entries.get(dir) {
            entry.cache.invalidate();
        }
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("session cache lock poisoned")
            .clear();
    }
}

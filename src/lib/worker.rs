use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use chrono::Utc;
use nostr::{Event, signer::NostrSigner};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    bridge::{
        GraspLevel, StatePublishReport, detect_grasp_capability, grasp_clone_url, is_relay_url,
        publish_state_after_push,
    },
    cache::{
        BranchTip, CacheStore, DataLevel, ObjectCache, RepoCacheEntry, SessionCaches,
        needs_update,
    },
    cancel::CancelToken,
    canonical::normalize_repo_key,
    client::{BlobStore, EventIO},
    config::{self, CoreOptions},
    diff::{ChangeKind, parse_unified_diff},
    error::{CoreError, ErrorCategory, ErrorCode, ErrorContext, Result, with_timeout},
    events::{commit_id_from_patch, tags::get_tag_value},
    git::{AuthContext, CommitSignature, GitProvider, host_of_url},
    retry::{Backoff, aggregate_auth_failures, retry_with_backoff},
};

/// Depth used for the initial shallow clone.
const SMART_INIT_DEPTH: u32 = 50;
/// A cache entry younger than this is served without touching the
/// network.
const STALE_WINDOW: Duration = Duration::from_secs(300);
/// libgit2 treats this depth as "unshallow".
const UNSHALLOW_DEPTH: u32 = i32::MAX as u32;
/// Operation-local deadlines for remote interactions. The libgit2 socket
/// timeouts bound each blocking transfer chunk underneath these.
const CLONE_TIMEOUT_MS: u64 = 120_000;
const FETCH_TIMEOUT_MS: u64 = 60_000;
const PUSH_TIMEOUT_MS: u64 = 60_000;

/// Local lifecycle of a repository working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepoPhase {
    #[default]
    Unknown,
    Cloning,
    Refs,
    Shallow,
    Full,
}

impl From<DataLevel> for RepoPhase {
    fn from(level: DataLevel) -> Self {
        match level {
            DataLevel::Refs => RepoPhase::Refs,
            DataLevel::Shallow => RepoPhase::Shallow,
            DataLevel::Full => RepoPhase::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub success: bool,
    pub data_level: DataLevel,
    pub head_commit: Option<String>,
    pub branches: Vec<BranchTip>,
    pub warning: Option<String>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub needs_update: bool,
    pub head_commit: Option<String>,
    pub local_commit: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub commit_id: String,
    pub branch: String,
    pub pushed_to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub remote_url: String,
    pub pushed_refs: Vec<String>,
    pub state: Option<StatePublishReport>,
}

/// Event-layer context a push needs to publish state afterwards.
pub struct BridgeContext<'a> {
    pub io: &'a dyn EventIO,
    pub signer: &'a Arc<dyn NostrSigner>,
    pub identifier: String,
    pub blob_store: Option<&'a dyn BlobStore>,
    pub include_tags: bool,
}

/// Single-threaded cooperative host for git operations.
///
/// Calls on the same repository are serialized through a per-repo queue;
/// different repositories interleave freely. Every operation takes a
/// [`CancelToken`] and suspends only at I/O boundaries, so each RPC is
/// atomic from the caller's view.
pub struct GitWorker {
    provider: Arc<dyn GitProvider>,
    store: CacheStore,
    sessions: SessionCaches,
    options: CoreOptions,
    root_dir: PathBuf,
    backoff: Backoff,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    phases: StdMutex<HashMap<String, RepoPhase>>,
}

impl GitWorker {
    pub fn new(
        provider: Arc<dyn GitProvider>,
        store: CacheStore,
        options: CoreOptions,
        root_dir: PathBuf,
    ) -> Self {
        let sessions = SessionCaches::new(
            options.cache_mode,
            Duration::from_millis(options.cache_max_age_ms),
        );
        config::init_process_state(&options);
        Self {
            provider,
            store,
            sessions,
            options,
            root_dir,
            backoff: Backoff::default(),
            locks: StdMutex::new(HashMap::new()),
            phases: StdMutex::new(HashMap::new()),
        }
    }

    pub fn repo_dir(&self, repo_key: &str) -> Result<PathBuf> {
        let key = normalize_repo_key(repo_key)?;
        let (owner, name) = key.split_once('/').ok_or_else(|| {
            CoreError::invalid_input(format!("'{key}' is not an owner/name repository key"))
        })?;
        Ok(self.root_dir.join(owner).join(name))
    }

    pub fn phase(&self, repo_key: &str) -> RepoPhase {
        self.phases
            .lock()
            .expect("phase registry poisoned")
            .get(repo_key)
            .copied()
            .unwrap_or_default()
    }

    fn set_phase(&self, repo_key: &str, phase: RepoPhase) {
        self.phases
            .lock()
            .expect("phase registry poisoned")
            .insert(repo_key.to_string(), phase);
    }

    fn lock_for(&self, repo_key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .expect("lock registry poisoned")
            .entry(repo_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Fatal failures invalidate the cached data level before surfacing.
    fn surface(&self, repo_key: &str, err: CoreError) -> CoreError {
        if err.category() == ErrorCategory::Fatal {
            self.set_phase(repo_key, RepoPhase::Unknown);
            let _ = self.store.remove(repo_key);
        }
        err
    }

    async fn clone_best_effort(
        &self,
        dir: &Path,
        urls: &[String],
        depth: Option<u32>,
        cache: &ObjectCache,
        cancel: &CancelToken,
    ) -> Result<String> {
        let mut last_err =
            CoreError::invalid_input("no clone urls provided for repository initialization");
        for url in urls {
            cancel.check("clone")?;
            let context = ErrorContext::for_operation("clone").with_remote(url.clone());
            let mut attempt = with_timeout(
                self.provider.clone_repo(dir, url, depth, cache),
                CLONE_TIMEOUT_MS,
                "clone",
                context.clone(),
            )
            .await;
            if let Err(err) = &attempt {
                // some transports reject shallow clones; take the full
                // history rather than failing the repo
                if depth.is_some() {
                    tracing::debug!(url, "shallow clone refused ({err}), retrying full");
                    let _ = std::fs::remove_dir_all(dir);
                    attempt = with_timeout(
                        self.provider.clone_repo(dir, url, None, cache),
                        CLONE_TIMEOUT_MS,
                        "clone",
                        context,
                    )
                    .await;
                }
            }
            match attempt {
                Ok(()) => return Ok(url.clone()),
                Err(err) => {
                    tracing::warn!(url, code = %err.code, "clone failed: {err}");
                    let _ = std::fs::remove_dir_all(dir);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_with_depth_fallback(
        &self,
        dir: &Path,
        remote: &str,
        refspecs: &[String],
        depth: Option<u32>,
        cache: &ObjectCache,
    ) -> Result<()> {
        let context = ErrorContext::for_operation("fetch").with_remote(remote.to_string());
        match with_timeout(
            self.provider.fetch(dir, remote, refspecs, depth, cache),
            FETCH_TIMEOUT_MS,
            "fetch",
            context.clone(),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if depth.is_some() => {
                tracing::debug!(remote, "depth-limited fetch refused ({err}), retrying full");
                with_timeout(
                    self.provider.fetch(dir, remote, refspecs, None, cache),
                    FETCH_TIMEOUT_MS,
                    "fetch",
                    context,
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    fn update_cache_entry(
        &self,
        repo_key: &str,
        data_level: DataLevel,
        head_commit: Option<String>,
        branches: Vec<BranchTip>,
        clone_urls: Vec<String>,
        commit_count: Option<u64>,
    ) -> Result<RepoCacheEntry> {
        let mut entry = self
            .store
            .get(repo_key)?
            .unwrap_or_else(|| RepoCacheEntry::new(repo_key));
        entry.data_level = entry.data_level.max(data_level);
        entry.head_commit = head_commit;
        entry.branches = branches;
        if !clone_urls.is_empty() {
            entry.clone_urls = clone_urls;
        }
        if commit_count.is_some() {
            entry.commit_count = commit_count;
        }
        entry.touch();
        self.store.put(&entry)?;
        self.set_phase(repo_key, entry.data_level.into());
        Ok(entry)
    }

    /// Returns cached refs when fresh; otherwise clones (shallow, depth
    /// 50) or fetches, resolves HEAD, lists branches and updates the
    /// cache. An empty remote is a success with a warning, not an error.
    pub async fn smart_initialize_repo(
        &self,
        repo_key: &str,
        clone_urls: &[String],
        branch: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<InitOutcome> {
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        if let Some(entry) = self.store.get(&key)? {
            if dir.exists() && !needs_update(&entry, Utc::now().timestamp(), None, STALE_WINDOW)
            {
                self.sessions.end_batch(&dir);
                return Ok(InitOutcome {
                    success: true,
                    data_level: entry.data_level,
                    head_commit: entry.head_commit.clone(),
                    branches: entry.branches.clone(),
                    warning: None,
                    from_cache: true,
                });
            }
        }

        cancel.check("smart-initialize")?;
        self.set_phase(&key, RepoPhase::Cloning);
        let result: Result<InitOutcome> = async {
            if !dir.exists() {
                std::fs::create_dir_all(dir.parent().unwrap_or(&dir))?;
                self.clone_best_effort(&dir, clone_urls, Some(SMART_INIT_DEPTH), &cache, cancel)
                    .await?;
            } else {
                self.fetch_with_depth_fallback(
                    &dir,
                    "origin",
                    &["+refs/heads/*:refs/remotes/origin/*".to_string()],
                    Some(SMART_INIT_DEPTH),
                    &cache,
                )
                .await?;
            }
            cancel.check("smart-initialize")?;

            let head_commit = self.provider.head_commit(&dir, &cache).await?;
            let branches = self.provider.list_branches(&dir, &cache).await?;
            if branches.is_empty() {
                self.update_cache_entry(
                    &key,
                    DataLevel::Refs,
                    head_commit.clone(),
                    Vec::new(),
                    clone_urls.to_vec(),
                    None,
                )?;
                return Ok(InitOutcome {
                    success: true,
                    data_level: DataLevel::Refs,
                    head_commit,
                    branches: Vec::new(),
                    warning: Some("no branches".to_string()),
                    from_cache: false,
                });
            }

            if let Some(branch) = branch {
                // a requested branch must exist locally after initialization
                if !branches.iter().any(|b| b.name == branch) {
                    self.fetch_with_depth_fallback(
                        &dir,
                        "origin",
                        &[format!("+refs/heads/{branch}:refs/remotes/origin/{branch}")],
                        Some(SMART_INIT_DEPTH),
                        &cache,
                    )
                    .await?;
                }
            }

            let entry = self.update_cache_entry(
                &key,
                DataLevel::Shallow,
                head_commit.clone(),
                branches.clone(),
                clone_urls.to_vec(),
                None,
            )?;
            Ok(InitOutcome {
                success: true,
                data_level: entry.data_level,
                head_commit,
                branches,
                warning: None,
                from_cache: false,
            })
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }

    /// Guarantees `branch` exists locally, fetching at depth 1 and
    /// checking it out as needed.
    pub async fn ensure_shallow_clone(
        &self,
        repo_key: &str,
        branch: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        let result: Result<()> = async {
            if !dir.exists() {
                let entry = self.store.get(&key)?.ok_or_else(|| {
                    CoreError::invalid_input(format!(
                        "repository {key} has never been initialized and no clone urls are cached"
                    ))
                })?;
                std::fs::create_dir_all(dir.parent().unwrap_or(&dir))?;
                self.clone_best_effort(&dir, &entry.clone_urls, Some(1), &cache, cancel)
                    .await?;
            }
            cancel.check("ensure-shallow")?;
            let branches = self.provider.list_branches(&dir, &cache).await?;
            if !branches.iter().any(|b| b.name == branch) {
                self.fetch_with_depth_fallback(
                    &dir,
                    "origin",
                    &[format!("+refs/heads/{branch}:refs/remotes/origin/{branch}")],
                    Some(1),
                    &cache,
                )
                .await?;
                let tip = self
                    .provider
                    .resolve_ref(&dir, &format!("origin/{branch}"), &cache)
                    .await?;
                self.provider
                    .create_branch(&dir, branch, &tip, &cache)
                    .await?;
            }
            self.provider.checkout(&dir, branch, &cache).await?;
            let head_commit = self.provider.head_commit(&dir, &cache).await?;
            let branches = self.provider.list_branches(&dir, &cache).await?;
            self.update_cache_entry(&key, DataLevel::Shallow, head_commit, branches, vec![], None)?;
            Ok(())
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }

    /// Upgrades the working copy to the full history.
    pub async fn ensure_full_clone(&self, repo_key: &str, cancel: &CancelToken) -> Result<()> {
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        let result: Result<()> = async {
            if !dir.exists() {
                return Err(CoreError::invalid_input(format!(
                    "repository {key} has no working copy to deepen"
                )));
            }
            cancel.check("ensure-full")?;
            self.fetch_with_depth_fallback(
                &dir,
                "origin",
                &["+refs/heads/*:refs/remotes/origin/*".to_string()],
                Some(UNSHALLOW_DEPTH),
                &cache,
            )
            .await?;
            let head_commit = self.provider.head_commit(&dir, &cache).await?;
            let branches = self.provider.list_branches(&dir, &cache).await?;
            let commit_count = match &head_commit {
                Some(head) => Some(self.provider.commit_count(&dir, head, &cache).await?),
                None => None,
            };
            self.update_cache_entry(
                &key,
                DataLevel::Full,
                head_commit,
                branches,
                vec![],
                commit_count,
            )?;
            Ok(())
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }

    /// Fetches from the tracked remote and reports whether the local
    /// branch is behind it.
    pub async fn sync_with_remote(
        &self,
        repo_key: &str,
        branch: &str,
        cancel: &CancelToken,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        let result: Result<SyncReport> = async {
            if !dir.exists() {
                return Err(CoreError::invalid_input(format!(
                    "repository {key} has no working copy to sync"
                )));
            }
            let remotes = self.provider.list_remotes(&dir, &cache).await?;
            let origin = remotes
                .iter()
                .find(|r| r.name == "origin")
                .or_else(|| remotes.first())
                .ok_or_else(|| {
                    CoreError::invalid_input(format!("repository {key} has no remotes"))
                })?
                .clone();
            cancel.check("sync")?;
            self.fetch_with_depth_fallback(
                &dir,
                &origin.name,
                &[format!("+refs/heads/*:refs/remotes/{}/*", origin.name)],
                None,
                &cache,
            )
            .await?;

            let remote_tip = self
                .provider
                .resolve_ref(&dir, &format!("{}/{branch}", origin.name), &cache)
                .await
                .ok();
            let local_tip = self.provider.resolve_ref(&dir, branch, &cache).await.ok();
            let needs_update = match (&remote_tip, &local_tip) {
                (Some(remote), Some(local)) => remote != local,
                (Some(_), None) => true,
                _ => false,
            };
            let branches = self.provider.list_branches(&dir, &cache).await?;
            self.update_cache_entry(
                &key,
                DataLevel::Shallow,
                remote_tip.clone(),
                branches,
                vec![],
                None,
            )?;
            Ok(SyncReport {
                needs_update,
                head_commit: remote_tip,
                local_commit: local_tip,
                duration: started.elapsed(),
            })
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }

    async fn push_with_token_cascade(
        &self,
        dir: &Path,
        url: &str,
        refspecs: &[String],
        cache: &ObjectCache,
        cancel: &CancelToken,
    ) -> Result<()> {
        let host = host_of_url(url).unwrap_or_default();
        let tokens = config::tokens_for_host(&host);
        let mut candidates: Vec<AuthContext> = vec![AuthContext::default()];
        candidates.extend(tokens.into_iter().map(AuthContext::with_token));

        let mut auth_failures: Vec<(String, CoreError)> = Vec::new();
        for (index, auth) in candidates.iter().enumerate() {
            cancel.check("push")?;
            let label = if index == 0 {
                "default credentials".to_string()
            } else {
                format!("token {index} for {host}")
            };
            match with_timeout(
                self.provider.push(dir, url, refspecs, auth, cache),
                PUSH_TIMEOUT_MS,
                "push",
                ErrorContext::for_operation("push").with_remote(url.to_string()),
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.code == ErrorCode::AuthRequired => {
                    tracing::debug!(url, label, "push rejected, cascading to next credential");
                    auth_failures.push((label, err));
                }
                Err(err) => {
                    return Err(err.with_context(
                        ErrorContext::for_operation("push").with_remote(url.to_string()),
                    ));
                }
            }
        }
        Err(aggregate_auth_failures(&host, &auth_failures))
    }

    /// Parses a patch's diff, stages it against the working tree, commits
    /// on a patch branch and pushes it to the matching remote.
    pub async fn apply_patch_and_push(
        &self,
        repo_key: &str,
        patch: &Event,
        author: &CommitSignature,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome> {
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        let result: Result<ApplyOutcome> = async {
            if !dir.exists() {
                return Err(CoreError::invalid_input(format!(
                    "repository {key} has no working copy to apply patches in"
                )));
            }
            if self.options.validation_enabled() {
                crate::events::validate_event(patch)?;
            }
            let files = parse_unified_diff(&patch.content)?;
            let proposed_commit = commit_id_from_patch(patch)?;
            let branch = format!(
                "patches/{}",
                &proposed_commit[..8.min(proposed_commit.len())]
            );

            let base_branch = self
                .provider
                .default_branch(&dir, &cache)
                .await?
                .unwrap_or_else(|| "main".to_string());
            let base_tip = self.provider.resolve_ref(&dir, &base_branch, &cache).await?;
            self.provider
                .create_branch(&dir, &branch, &base_tip, &cache)
                .await?;
            self.provider.checkout(&dir, &branch, &cache).await?;
            cancel.check("apply-patch")?;

            let mut staged_adds: Vec<String> = Vec::new();
            let mut staged_removes: Vec<String> = Vec::new();
            for file in &files {
                if file.is_binary {
                    return Err(CoreError::invalid_input(format!(
                        "patch touches binary file {} which cannot be applied from a diff",
                        file.path()
                    )));
                }
                match file.change {
                    ChangeKind::Add | ChangeKind::Modify => {
                        let path = dir.join(file.path());
                        let base = match std::fs::read_to_string(&path) {
                            Ok(content) => content,
                            Err(_) => String::new(),
                        };
                        let updated = file.apply_to(&base)?;
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&path, updated)?;
                        staged_adds.push(file.path().to_string());
                    }
                    ChangeKind::Delete => {
                        let path = file.old_path.clone().unwrap_or_default();
                        let _ = std::fs::remove_file(dir.join(&path));
                        staged_removes.push(path);
                    }
                    ChangeKind::Rename => {
                        let old = file.old_path.clone().unwrap_or_default();
                        let new = file.path().to_string();
                        let old_abs = dir.join(&old);
                        let base = std::fs::read_to_string(&old_abs).unwrap_or_default();
                        let updated = if file.has_hunks() {
                            file.apply_to(&base)?
                        } else {
                            base
                        };
                        let new_abs = dir.join(&new);
                        if let Some(parent) = new_abs.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&new_abs, updated)?;
                        let _ = std::fs::remove_file(&old_abs);
                        staged_removes.push(old);
                        staged_adds.push(new);
                    }
                }
            }
            if !staged_adds.is_empty() {
                self.provider.stage_add(&dir, &staged_adds, &cache).await?;
            }
            if !staged_removes.is_empty() {
                self.provider
                    .stage_remove(&dir, &staged_removes, &cache)
                    .await?;
            }

            let message = get_tag_value(patch, "description")
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("apply patch {proposed_commit}"));
            let commit_id = self
                .provider
                .commit(&dir, &message, author, &cache)
                .await?;

            let remote_url = match config::protocol_preference(&key) {
                Some(url) => url,
                None => {
                    let remotes = self.provider.list_remotes(&dir, &cache).await?;
                    remotes
                        .iter()
                        .find(|r| r.name == "origin")
                        .or_else(|| remotes.first())
                        .map(|r| r.url.clone())
                        .ok_or_else(|| {
                            CoreError::invalid_input(format!(
                                "repository {key} has no remote to push the patch branch to"
                            ))
                        })?
                }
            };
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            let refspecs = std::slice::from_ref(&refspec);
            let dir_ref: &Path = &dir;
            let url_ref: &str = &remote_url;
            let cache_ref: &ObjectCache = &cache;
            retry_with_backoff("apply-patch-push", &self.backoff, move |_| {
                self.push_with_token_cascade(dir_ref, url_ref, refspecs, cache_ref, cancel)
            })
            .await?;
            config::set_protocol_preference(&key, &remote_url);

            Ok(ApplyOutcome {
                commit_id,
                branch,
                pushed_to: remote_url,
            })
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }

    /// Pushes a branch, preferring the relay-aware path for relay-shaped
    /// URLs, then hands off to the bridge for state publication.
    pub async fn push_to_remote(
        &self,
        repo_key: &str,
        url: &str,
        branch: &str,
        bridge: Option<BridgeContext<'_>>,
        cancel: &CancelToken,
    ) -> Result<PushOutcome> {
        let key = normalize_repo_key(repo_key)?;
        let guard = self.lock_for(&key);
        let _held = guard.lock().await;
        let dir = self.repo_dir(&key)?;
        let cache = self.sessions.handle(&dir);

        let result: Result<PushOutcome> = async {
            if !dir.exists() {
                return Err(CoreError::invalid_input(format!(
                    "repository {key} has no working copy to push from"
                )));
            }

            let target = if is_relay_url(url) {
                let bridge = bridge.as_ref().ok_or_else(|| {
                    CoreError::invalid_input(
                        "pushing to a relay requires an event-layer context (signer and relay IO)",
                    )
                })?;
                let capability =
                    detect_grasp_capability(url, self.options.default_cors_proxy.as_deref())
                        .await?;
                if capability.level == GraspLevel::Unsupported {
                    return Err(CoreError::new(
                        ErrorCode::InvalidRef,
                        format!("relay {url} does not host git repositories"),
                    )
                    .with_hint("pick a GRASP-capable relay or a plain git remote"));
                }
                let author = bridge.signer.get_public_key().await.map_err(|e| {
                    CoreError::new(ErrorCode::Unknown, format!("signer has no pubkey: {e}"))
                })?;
                let origin = capability.http_origins.first().ok_or_else(|| {
                    CoreError::new(
                        ErrorCode::RelayError,
                        format!("relay {url} advertises no git http origin"),
                    )
                })?;
                grasp_clone_url(&origin.url, &author, &bridge.identifier)?
            } else {
                url.to_string()
            };

            cancel.check("push")?;
            let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
            let refspecs = std::slice::from_ref(&refspec);
            let dir_ref: &Path = &dir;
            let target_ref: &str = &target;
            let cache_ref: &ObjectCache = &cache;
            retry_with_backoff("push", &self.backoff, move |_| {
                self.push_with_token_cascade(dir_ref, target_ref, refspecs, cache_ref, cancel)
            })
            .await?;
            config::set_protocol_preference(&key, &target);

            let state = match bridge {
                Some(bridge) => {
                    let pushed_objects = self
                        .provider
                        .log(&dir, branch, Some(SMART_INIT_DEPTH as usize), &cache)
                        .await?;
                    Some(
                        publish_state_after_push(
                            bridge.io,
                            bridge.signer,
                            self.provider.as_ref(),
                            &dir,
                            &bridge.identifier,
                            bridge.include_tags,
                            bridge.blob_store,
                            &pushed_objects,
                            cancel,
                            &cache,
                        )
                        .await?,
                    )
                }
                None => None,
            };

            Ok(PushOutcome {
                remote_url: target,
                pushed_refs: vec![format!("refs/heads/{branch}")],
                state,
            })
        }
        .await;
        self.sessions.end_batch(&dir);
        result.map_err(|err| self.surface(&key, err))
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;
    use serial_test::serial;
    use test_utils::{TEST_KEY_1_KEYS, generate_patch_event_with_diff, git::GitTestRepo};

    use super::*;
    use crate::{client::MockEventIO, client::PublishOutcome as IoOutcome, git::Git2Provider};

    fn temp_root(label: &str) -> PathBuf {
        std::env::current_dir()
            .unwrap()
            .join(format!("tmpworker-{label}-{}", rand::random::<u64>()))
    }

    fn worker(root: &Path) -> GitWorker {
        GitWorker::new(
            Arc::new(Git2Provider::new()),
            CacheStore::new(root.join("cache")),
            CoreOptions::default(),
            root.join("repos"),
        )
    }

    fn bare_seeded_origin(root: &Path) -> (GitTestRepo, PathBuf) {
        std::fs::create_dir_all(root).unwrap();
        let seed = GitTestRepo::default();
        seed.populate().unwrap();
        let bare_dir = root.join("origin.git");
        let bare = git2::Repository::init_bare(&bare_dir).unwrap();
        bare.set_head("refs/heads/main").unwrap();
        drop(bare);
        let mut remote = seed
            .git_repo
            .remote("bare", &bare_dir.to_string_lossy())
            .unwrap();
        remote
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();
        drop(remote);
        (seed, bare_dir)
    }

    #[tokio::test]
    #[serial]
    async fn smart_initialize_on_empty_remote_warns_without_throwing() {
        let root = temp_root("empty");
        std::fs::create_dir_all(&root).unwrap();
        let empty_origin = root.join("empty.git");
        git2::Repository::init_bare(&empty_origin).unwrap();
        let worker = worker(&root);

        let outcome = worker
            .smart_initialize_repo(
                "o/r",
                &[empty_origin.to_string_lossy().to_string()],
                None,
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data_level, DataLevel::Refs);
        assert!(outcome.warning.as_deref().unwrap().contains("no branches"));
        assert!(outcome.branches.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn smart_initialize_clones_then_serves_from_cache() {
        let root = temp_root("init");
        let (_seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let urls = vec![origin.to_string_lossy().to_string()];

        let first = worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();
        assert!(first.success);
        assert!(!first.from_cache);
        assert_eq!(first.data_level, DataLevel::Shallow);
        assert_eq!(first.branches.len(), 1);
        assert_eq!(worker.phase("alice/widget"), RepoPhase::Shallow);

        let second = worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.head_commit, first.head_commit);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn bad_clone_urls_fall_through_to_the_next() {
        let root = temp_root("fallthrough");
        let (_seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let urls = vec![
            root.join("missing.git").to_string_lossy().to_string(),
            origin.to_string_lossy().to_string(),
        ];
        let outcome = worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();
        assert!(outcome.success);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn sync_with_remote_reports_upstream_movement() {
        let root = temp_root("sync");
        let (seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let urls = vec![origin.to_string_lossy().to_string()];
        worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();

        let unchanged = worker
            .sync_with_remote("alice/widget", "main", &CancelToken::new())
            .await
            .unwrap();
        assert!(!unchanged.needs_update);

        std::fs::write(seed.dir.join("t3.md"), "upstream change").unwrap();
        seed.stage_and_commit("add t3.md").unwrap();
        seed.git_repo
            .find_remote("bare")
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();

        let moved = worker
            .sync_with_remote("alice/widget", "main", &CancelToken::new())
            .await
            .unwrap();
        assert!(moved.needs_update);
        assert_ne!(moved.head_commit, moved.local_commit);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn apply_patch_and_push_creates_a_patch_branch_on_the_remote() {
        let root = temp_root("apply");
        let (_seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let urls = vec![origin.to_string_lossy().to_string()];
        worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();

        let commit = "431b84edc0d2fa118d63faa3c2db9c73d630a5ae";
        let diff = "diff --git a/hello.txt b/hello.txt\nnew file mode 100644\nindex 0000000..1111111\n--- /dev/null\n+++ b/hello.txt\n@@ -0,0 +1,1 @@\n+hello from a patch\n";
        let patch = generate_patch_event_with_diff(commit, &[], diff);
        let outcome = worker
            .apply_patch_and_push(
                "alice/widget",
                &patch,
                &CommitSignature {
                    name: "joe bloggs".to_string(),
                    email: "joe@example.com".to_string(),
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.branch, "patches/431b84ed");

        let bare = git2::Repository::open(&origin).unwrap();
        let pushed = bare
            .find_reference("refs/heads/patches/431b84ed")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(pushed.id().to_string(), outcome.commit_id);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn push_to_remote_publishes_state_through_the_bridge() {
        let root = temp_root("pushstate");
        let (_seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let urls = vec![origin.to_string_lossy().to_string()];
        worker
            .smart_initialize_repo("alice/widget", &urls, None, &CancelToken::new())
            .await
            .unwrap();

        let mut io = MockEventIO::new();
        io.expect_publish_event().times(1).returning(|_| {
            Ok(IoOutcome {
                ok: true,
                relays: vec!["wss://relay.example".to_string()],
                error: None,
            })
        });
        let keys: Keys = TEST_KEY_1_KEYS.clone();
        let signer: Arc<dyn NostrSigner> = Arc::new(keys);

        let outcome = worker
            .push_to_remote(
                "alice/widget",
                &origin.to_string_lossy(),
                "main",
                Some(BridgeContext {
                    io: &io,
                    signer: &signer,
                    identifier: "widget".to_string(),
                    blob_store: None,
                    include_tags: false,
                }),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.pushed_refs, vec!["refs/heads/main".to_string()]);
        let state = outcome.state.unwrap();
        assert!(state.publish.ok);
        assert_eq!(
            config::protocol_preference("alice/widget").as_deref(),
            Some(origin.to_string_lossy().as_ref())
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn cancellation_surfaces_as_operation_aborted() {
        let root = temp_root("cancel");
        let (_seed, origin) = bare_seeded_origin(&root);
        let worker = worker(&root);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = worker
            .smart_initialize_repo(
                "alice/widget",
                &[origin.to_string_lossy().to_string()],
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::OperationAborted);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    #[serial]
    async fn operations_on_distinct_repos_interleave() {
        let root = temp_root("interleave");
        let (_seed_a, origin_a) = bare_seeded_origin(&root);
        let worker = Arc::new(worker(&root));

        let seed_b = GitTestRepo::default();
        seed_b.populate().unwrap();
        let bare_b = root.join("origin-b.git");
        let bare_b_repo = git2::Repository::init_bare(&bare_b).unwrap();
        bare_b_repo.set_head("refs/heads/main").unwrap();
        drop(bare_b_repo);
        seed_b
            .git_repo
            .remote("bare", &bare_b.to_string_lossy())
            .unwrap()
            .push(&["refs/heads/main:refs/heads/main"], None)
            .unwrap();

        let w1 = worker.clone();
        let w2 = worker.clone();
        let urls_a = vec![origin_a.to_string_lossy().to_string()];
        let urls_b = vec![bare_b.to_string_lossy().to_string()];
        let cancel_a = CancelToken::new();
        let cancel_b = CancelToken::new();
        let (a, b) = tokio::join!(
            w1.smart_initialize_repo("alice/widget", &urls_a, None, &cancel_a),
            w2.smart_initialize_repo("bob/gadget", &urls_b, None, &cancel_b),
        );
        assert!(a.unwrap().success);
        assert!(b.unwrap().success);
        let _ = std::fs::remove_dir_all(root);
    }
}

mod auth;
mod provider;

use std::{path::Path, sync::Once};

use async_trait::async_trait;
use git2::opts::{
    set_server_connect_timeout_in_milliseconds, set_server_timeout_in_milliseconds,
};

pub use auth::{AuthContext, host_of_url, remote_callbacks};
pub use provider::Git2Provider;

use crate::{cache::ObjectCache, error::Result};

static TRANSPORT_TIMEOUTS: Once = Once::new();

/// Installs libgit2's socket timeouts so a stalled remote fails fast with
/// a typed `timeout` error instead of hanging the worker. Process-wide,
/// applied once.
pub fn set_git_network_timeouts() {
    TRANSPORT_TIMEOUTS.call_once(|| unsafe {
        // 3 000 ms to establish the TCP connection (default: 60 000 ms).
        if let Err(err) = set_server_connect_timeout_in_milliseconds(3_000) {
            tracing::warn!("failed to set libgit2 connect timeout: {err}");
        }

        // The server timeout applies per socket send()/recv() call rather
        // than to the entire fetch or push. libgit2 transfers data in
        // ~16 KiB chunks, so each chunk's transfer is subject to this
        // timeout instead of the overall command. 15 000 ms (default:
        // 300 000 ms) aborts a stalled chunk quickly while accommodating
        // transient hiccups.
        if let Err(err) = set_server_timeout_in_milliseconds(15_000) {
            tracing::warn!("failed to set libgit2 I/O timeout: {err}");
        }
    });
}

/// Identity used for commits created by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSignature {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: String,
    pub parents: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub time_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    pub name: String,
    pub url: String,
}

/// Working tree churn at a glance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
}

impl StatusSummary {
    pub fn is_clean(&self) -> bool {
        self.staged == 0 && self.unstaged == 0 && self.untracked == 0
    }
}

/// Git capability consumed by the worker and the merge analyzer.
///
/// Every call receives the per-directory [`ObjectCache`] handle so the
/// implementation can keep object-layer caches alive across reads;
/// mutating operations bump the handle's generation exactly once.
#[async_trait]
pub trait GitProvider: Send + Sync {
    async fn init(&self, dir: &Path, cache: &ObjectCache) -> Result<()>;
    async fn clone_repo(
        &self,
        dir: &Path,
        url: &str,
        depth: Option<u32>,
        cache: &ObjectCache,
    ) -> Result<()>;
    async fn fetch(
        &self,
        dir: &Path,
        remote: &str,
        refspecs: &[String],
        depth: Option<u32>,
        cache: &ObjectCache,
    ) -> Result<()>;
    async fn push(
        &self,
        dir: &Path,
        remote_url: &str,
        refspecs: &[String],
        auth: &AuthContext,
        cache: &ObjectCache,
    ) -> Result<()>;
    async fn commit(
        &self,
        dir: &Path,
        message: &str,
        author: &CommitSignature,
        cache: &ObjectCache,
    ) -> Result<String>;
    async fn log(
        &self,
        dir: &Path,
        reference: &str,
        limit: Option<usize>,
        cache: &ObjectCache,
    ) -> Result<Vec<String>>;
    async fn read_commit(
        &self,
        dir: &Path,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<CommitInfo>;
    /// Blob bytes at `<reference>:<path>`, or `None` when the path does
    /// not exist there.
    async fn read_blob(
        &self,
        dir: &Path,
        reference: &str,
        path: &str,
        cache: &ObjectCache,
    ) -> Result<Option<Vec<u8>>>;
    async fn resolve_ref(&self, dir: &Path, reference: &str, cache: &ObjectCache)
    -> Result<String>;
    async fn list_branches(
        &self,
        dir: &Path,
        cache: &ObjectCache,
    ) -> Result<Vec<crate::cache::BranchTip>>;
    async fn list_remotes(&self, dir: &Path, cache: &ObjectCache) -> Result<Vec<RemoteInfo>>;
    /// `(full ref, commit id)` pairs for every local ref.
    async fn list_refs(&self, dir: &Path, cache: &ObjectCache) -> Result<Vec<(String, String)>>;
    /// Advertised refs of a remote, without fetching objects.
    async fn list_server_refs(
        &self,
        dir: &Path,
        url: &str,
        auth: &AuthContext,
        cache: &ObjectCache,
    ) -> Result<Vec<(String, String)>>;
    async fn write_ref(
        &self,
        dir: &Path,
        full_ref: &str,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<()>;
    async fn delete_ref(&self, dir: &Path, full_ref: &str, cache: &ObjectCache) -> Result<()>;
    /// Checks out `reference`, returning the commit id it landed on.
    async fn checkout(&self, dir: &Path, reference: &str, cache: &ObjectCache) -> Result<String>;
    async fn create_branch(
        &self,
        dir: &Path,
        name: &str,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<()>;
    async fn stage_add(&self, dir: &Path, paths: &[String], cache: &ObjectCache) -> Result<()>;
    async fn stage_remove(&self, dir: &Path, paths: &[String], cache: &ObjectCache)
    -> Result<()>;
    async fn status_summary(&self, dir: &Path, cache: &ObjectCache) -> Result<StatusSummary>;
    async fn is_ancestor(
        &self,
        dir: &Path,
        ancestor: &str,
        descendant: &str,
        cache: &ObjectCache,
    ) -> Result<bool>;
    async fn merge_base(
        &self,
        dir: &Path,
        a: &str,
        b: &str,
        cache: &ObjectCache,
    ) -> Result<Option<String>>;
    async fn commit_exists(
        &self,
        dir: &Path,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<bool>;
    /// HEAD commit id, or `None` for an unborn HEAD.
    async fn head_commit(&self, dir: &Path, cache: &ObjectCache) -> Result<Option<String>>;
    /// Short name of the branch HEAD points at, when symbolic.
    async fn default_branch(&self, dir: &Path, cache: &ObjectCache) -> Result<Option<String>>;
    async fn commit_count(
        &self,
        dir: &Path,
        reference: &str,
        cache: &ObjectCache,
    ) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_timeouts_install_once() {
        set_git_network_timeouts();
        // second call is a no-op rather than an error
        set_git_network_timeouts();
    }
}

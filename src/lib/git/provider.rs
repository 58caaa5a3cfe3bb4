use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use git2::{
    BranchType, Direction, ErrorCode as GitErrorCode, FetchOptions, Oid, PushOptions,
    Repository, Signature, build::CheckoutBuilder, build::RepoBuilder,
};

use super::{AuthContext, CommitInfo, CommitSignature, GitProvider, RemoteInfo, StatusSummary,
    remote_callbacks};
use crate::{
    cache::{BranchTip, ObjectCache},
    error::{CoreError, Result},
};

struct CachedHandle {
    generation: u64,
    repo: Repository,
}

/// libgit2-backed [`GitProvider`]. Open repository handles are kept per
/// directory and reused as long as the injected [`ObjectCache`]
/// generation is unchanged; a bumped generation forces a reopen so no
/// stale object data survives a mutation.
#[derive(Default)]
pub struct Git2Provider {
    repos: Mutex<HashMap<PathBuf, CachedHandle>>,
}

impl Git2Provider {
    pub fn new() -> Self {
        super::set_git_network_timeouts();
        Self::default()
    }

    fn with_repo<T>(
        &self,
        dir: &Path,
        cache: &ObjectCache,
        f: impl FnOnce(&Repository) -> Result<T>,
    ) -> Result<T> {
        let mut repos = self.repos.lock().expect("repo handle registry poisoned");
        let generation = cache.generation();
        let reopen = match repos.get(dir) {
            Some(handle) => handle.generation != generation,
            None => true,
        };
        if reopen {
            let repo = Repository::open(dir)?;
            repos.insert(
                dir.to_path_buf(),
                CachedHandle { generation, repo },
            );
        }
        let handle = repos.get(dir).expect("handle present after open");
        f(&handle.repo)
    }

    fn forget(&self, dir: &Path) {
        self.repos
            .lock()
            .expect("repo handle registry poisoned")
            .remove(dir);
    }
}

fn resolve_commit(repo: &Repository, reference: &str) -> Result<Oid> {
    Ok(repo.revparse_single(reference)?.peel_to_commit()?.id())
}

fn is_not_found(err: &git2::Error) -> bool {
    matches!(
        err.code(),
        GitErrorCode::NotFound | GitErrorCode::UnbornBranch | GitErrorCode::InvalidSpec
    )
}

#[async_trait]
impl GitProvider for Git2Provider {
    async fn init(&self, dir: &Path, cache: &ObjectCache) -> Result<()> {
        Repository::init(dir)?;
        self.forget(dir);
        cache.invalidate();
        Ok(())
    }

    async fn clone_repo(
        &self,
        dir: &Path,
        url: &str,
        depth: Option<u32>,
        cache: &ObjectCache,
    ) -> Result<()> {
        let mut fetch_options = FetchOptions::new();
        if let Some(depth) = depth {
            fetch_options.depth(depth as i32);
        }
        RepoBuilder::new()
            .fetch_options(fetch_options)
            .clone(url, dir)?;
        self.forget(dir);
        cache.invalidate();
        Ok(())
    }

    async fn fetch(
        &self,
        dir: &Path,
        remote: &str,
        refspecs: &[String],
        depth: Option<u32>,
        cache: &ObjectCache,
    ) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            let mut remote = match repo.find_remote(remote) {
                Ok(remote) => remote,
                Err(_) => repo.remote_anonymous(remote)?,
            };
            let mut fetch_options = FetchOptions::new();
            if let Some(depth) = depth {
                fetch_options.depth(depth as i32);
            }
            remote.fetch(refspecs, Some(&mut fetch_options), None)?;
            Ok(())
        })?;
        // fetched objects must be visible to the next read
        self.forget(dir);
        Ok(())
    }

    async fn push(
        &self,
        dir: &Path,
        remote_url: &str,
        refspecs: &[String],
        auth: &AuthContext,
        cache: &ObjectCache,
    ) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            let mut remote = match repo.find_remote(remote_url) {
                Ok(remote) => remote,
                Err(_) => repo.remote_anonymous(remote_url)?,
            };
            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(remote_callbacks(auth));
            remote.push(refspecs, Some(&mut push_options))?;
            Ok(())
        })?;
        cache.invalidate();
        Ok(())
    }

    async fn commit(
        &self,
        dir: &Path,
        message: &str,
        author: &CommitSignature,
        cache: &ObjectCache,
    ) -> Result<String> {
        let id = self.with_repo(dir, cache, |repo| {
            let mut index = repo.index()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let signature = Signature::now(&author.name, &author.email)?;
            let parent = match repo.head() {
                Ok(head) => Some(head.peel_to_commit()?),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err.into()),
            };
            let parents: Vec<&git2::Commit> = parent.iter().collect();
            let oid = repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &parents,
            )?;
            Ok(oid.to_string())
        })?;
        cache.invalidate();
        Ok(id)
    }

    async fn log(
        &self,
        dir: &Path,
        reference: &str,
        limit: Option<usize>,
        cache: &ObjectCache,
    ) -> Result<Vec<String>> {
        self.with_repo(dir, cache, |repo| {
            let tip = resolve_commit(repo, reference)?;
            let mut revwalk = repo.revwalk()?;
            revwalk.push(tip)?;
            let mut commits = Vec::new();
            for oid in revwalk {
                commits.push(oid?.to_string());
                if limit.is_some_and(|l| commits.len() >= l) {
                    break;
                }
            }
            Ok(commits)
        })
    }

    async fn read_commit(
        &self,
        dir: &Path,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<CommitInfo> {
        self.with_repo(dir, cache, |repo| {
            let commit = repo.find_commit(Oid::from_str(commit_id)?)?;
            let info = CommitInfo {
                id: commit.id().to_string(),
                parents: commit.parent_ids().map(|p| p.to_string()).collect(),
                author_name: commit.author().name().unwrap_or_default().to_string(),
                author_email: commit.author().email().unwrap_or_default().to_string(),
                message: commit.message().unwrap_or_default().to_string(),
                time_unix: commit.time().seconds(),
            };
            Ok(info)
        })
    }

    async fn read_blob(
        &self,
        dir: &Path,
        reference: &str,
        path: &str,
        cache: &ObjectCache,
    ) -> Result<Option<Vec<u8>>> {
        self.with_repo(dir, cache, |repo| {
            match repo.revparse_single(&format!("{reference}:{path}")) {
                Ok(object) => {
                    let blob = object.peel_to_blob()?;
                    Ok(Some(blob.content().to_vec()))
                }
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    async fn resolve_ref(
        &self,
        dir: &Path,
        reference: &str,
        cache: &ObjectCache,
    ) -> Result<String> {
        self.with_repo(dir, cache, |repo| {
            Ok(resolve_commit(repo, reference)?.to_string())
        })
    }

    async fn list_branches(&self, dir: &Path, cache: &ObjectCache) -> Result<Vec<BranchTip>> {
        self.with_repo(dir, cache, |repo| {
            let mut tips = Vec::new();
            for branch in repo.branches(Some(BranchType::Local))? {
                let (branch, _) = branch?;
                if let (Some(name), Some(target)) =
                    (branch.name()?, branch.get().target())
                {
                    tips.push(BranchTip {
                        name: name.to_string(),
                        commit: target.to_string(),
                    });
                }
            }
            Ok(tips)
        })
    }

    async fn list_remotes(&self, dir: &Path, cache: &ObjectCache) -> Result<Vec<RemoteInfo>> {
        self.with_repo(dir, cache, |repo| {
            let mut remotes = Vec::new();
            for name in repo.remotes()?.iter().flatten() {
                if let Some(url) = repo.find_remote(name)?.url() {
                    remotes.push(RemoteInfo {
                        name: name.to_string(),
                        url: url.to_string(),
                    });
                }
            }
            Ok(remotes)
        })
    }

    async fn list_refs(&self, dir: &Path, cache: &ObjectCache) -> Result<Vec<(String, String)>> {
        self.with_repo(dir, cache, |repo| {
            let mut refs = Vec::new();
            for reference in repo.references()? {
                let reference = reference?;
                let Some(name) = reference.name() else {
                    continue;
                };
                if let Some(target) = reference.target() {
                    refs.push((name.to_string(), target.to_string()));
                }
            }
            // HEAD as a symbolic entry, the way state events carry it
            if let Ok(head) = repo.find_reference("HEAD") {
                if let Some(target) = head.symbolic_target() {
                    refs.push(("HEAD".to_string(), format!("ref: {target}")));
                }
            }
            Ok(refs)
        })
    }

    async fn list_server_refs(
        &self,
        dir: &Path,
        url: &str,
        auth: &AuthContext,
        cache: &ObjectCache,
    ) -> Result<Vec<(String, String)>> {
        self.with_repo(dir, cache, |repo| {
            let mut remote = repo.remote_anonymous(url)?;
            let connection =
                remote.connect_auth(Direction::Fetch, Some(remote_callbacks(auth)), None)?;
            let refs = connection
                .list()?
                .iter()
                .map(|head| (head.name().to_string(), head.oid().to_string()))
                .collect();
            Ok(refs)
        })
    }

    async fn write_ref(
        &self,
        dir: &Path,
        full_ref: &str,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            repo.reference(full_ref, Oid::from_str(commit_id)?, true, "update ref")?;
            Ok(())
        })?;
        cache.invalidate();
        Ok(())
    }

    async fn delete_ref(&self, dir: &Path, full_ref: &str, cache: &ObjectCache) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            repo.find_reference(full_ref)?.delete()?;
            Ok(())
        })?;
        cache.invalidate();
        Ok(())
    }

    async fn checkout(&self, dir: &Path, reference: &str, cache: &ObjectCache) -> Result<String> {
        let id = self.with_repo(dir, cache, |repo| {
            let (object, gref) = repo.revparse_ext(reference)?;
            repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))?;
            match gref.and_then(|r| r.name().map(ToString::to_string)) {
                Some(name) => repo.set_head(&name)?,
                None => repo.set_head_detached(object.id())?,
            }
            Ok(object.peel_to_commit()?.id().to_string())
        })?;
        cache.invalidate();
        Ok(id)
    }

    async fn create_branch(
        &self,
        dir: &Path,
        name: &str,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            let commit = repo.find_commit(Oid::from_str(commit_id)?)?;
            repo.branch(name, &commit, true)?;
            Ok(())
        })?;
        cache.invalidate();
        Ok(())
    }

    async fn stage_add(&self, dir: &Path, paths: &[String], cache: &ObjectCache) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            let mut index = repo.index()?;
            for path in paths {
                index.add_path(Path::new(path))?;
            }
            index.write()?;
            Ok(())
        })
    }

    async fn stage_remove(
        &self,
        dir: &Path,
        paths: &[String],
        cache: &ObjectCache,
    ) -> Result<()> {
        self.with_repo(dir, cache, |repo| {
            let mut index = repo.index()?;
            for path in paths {
                index.remove_path(Path::new(path))?;
            }
            index.write()?;
            Ok(())
        })
    }

    async fn status_summary(&self, dir: &Path, cache: &ObjectCache) -> Result<StatusSummary> {
        self.with_repo(dir, cache, |repo| {
            let statuses = repo.statuses(None)?;
            let mut summary = StatusSummary::default();
            for entry in statuses.iter() {
                let status = entry.status();
                if status.is_index_new()
                    || status.is_index_modified()
                    || status.is_index_deleted()
                    || status.is_index_renamed()
                {
                    summary.staged += 1;
                }
                if status.is_wt_modified() || status.is_wt_deleted() || status.is_wt_renamed() {
                    summary.unstaged += 1;
                }
                if status.is_wt_new() {
                    summary.untracked += 1;
                }
            }
            Ok(summary)
        })
    }

    async fn is_ancestor(
        &self,
        dir: &Path,
        ancestor: &str,
        descendant: &str,
        cache: &ObjectCache,
    ) -> Result<bool> {
        self.with_repo(dir, cache, |repo| {
            let ancestor = Oid::from_str(ancestor)?;
            let descendant = Oid::from_str(descendant)?;
            if ancestor == descendant {
                return Ok(true);
            }
            Ok(repo
                .graph_descendant_of(descendant, ancestor)
                .unwrap_or(false))
        })
    }

    async fn merge_base(
        &self,
        dir: &Path,
        a: &str,
        b: &str,
        cache: &ObjectCache,
    ) -> Result<Option<String>> {
        self.with_repo(dir, cache, |repo| {
            match repo.merge_base(Oid::from_str(a)?, Oid::from_str(b)?) {
                Ok(oid) => Ok(Some(oid.to_string())),
                Err(err) if is_not_found(&err) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }

    async fn commit_exists(
        &self,
        dir: &Path,
        commit_id: &str,
        cache: &ObjectCache,
    ) -> Result<bool> {
        self.with_repo(dir, cache, |repo| {
            let Ok(oid) = Oid::from_str(commit_id) else {
                return Ok(false);
            };
            Ok(repo.find_commit(oid).is_ok())
        })
    }

    async fn head_commit(&self, dir: &Path, cache: &ObjectCache) -> Result<Option<String>> {
        self.with_repo(dir, cache, |repo| match repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id().to_string())),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(CoreError::from(err)),
        })
    }

    async fn default_branch(&self, dir: &Path, cache: &ObjectCache) -> Result<Option<String>> {
        self.with_repo(dir, cache, |repo| {
            let head = repo.find_reference("HEAD")?;
            Ok(head
                .symbolic_target()
                .and_then(|t| t.strip_prefix("refs/heads/"))
                .map(ToString::to_string))
        })
    }

    async fn commit_count(
        &self,
        dir: &Path,
        reference: &str,
        cache: &ObjectCache,
    ) -> Result<u64> {
        self.with_repo(dir, cache, |repo| {
            let tip = resolve_commit(repo, reference)?;
            let mut revwalk = repo.revwalk()?;
            revwalk.push(tip)?;
            Ok(revwalk.count() as u64)
        })
    }
}

use std::path::Path;

use nostr::Event;

use crate::{
    cache::ObjectCache,
    diff::{ChangeKind, DiffFile, parse_unified_diff},
    error::Result,
    events::{commit_id_from_patch, tags::get_tags},
    git::GitProvider,
};

/// Branches tried, in order, when the requested target cannot be
/// resolved.
const FALLBACK_BRANCHES: [&str; 4] = ["main", "master", "develop", "dev"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analysis {
    Clean,
    UpToDate,
    Diverged,
    Conflicts,
    Error,
}

impl Analysis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Analysis::Clean => "clean",
            Analysis::UpToDate => "up-to-date",
            Analysis::Diverged => "diverged",
            Analysis::Conflicts => "conflicts",
            Analysis::Error => "error",
        }
    }
}

/// How strictly filename-only diffs are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Any divergence among HEAD, patch base and target blobs conflicts.
    #[default]
    Conservative,
    /// Only HEAD/target divergence conflicts.
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeAnalysis {
    pub analysis: Analysis,
    pub can_merge: bool,
    pub has_conflicts: bool,
    pub conflict_files: Vec<String>,
    pub fast_forward: bool,
    pub up_to_date: bool,
    pub error_message: Option<String>,
}

impl MergeAnalysis {
    fn error(message: impl Into<String>) -> Self {
        Self {
            analysis: Analysis::Error,
            can_merge: false,
            has_conflicts: false,
            conflict_files: Vec::new(),
            fast_forward: false,
            up_to_date: false,
            error_message: Some(message.into()),
        }
    }

    fn clean(fast_forward: bool) -> Self {
        Self {
            analysis: Analysis::Clean,
            can_merge: true,
            has_conflicts: false,
            conflict_files: Vec::new(),
            fast_forward,
            up_to_date: false,
            error_message: None,
        }
    }

    fn up_to_date() -> Self {
        Self {
            analysis: Analysis::UpToDate,
            can_merge: false,
            has_conflicts: false,
            conflict_files: Vec::new(),
            fast_forward: false,
            up_to_date: true,
            error_message: None,
        }
    }

    fn diverged() -> Self {
        Self {
            analysis: Analysis::Diverged,
            can_merge: false,
            has_conflicts: false,
            conflict_files: Vec::new(),
            fast_forward: false,
            up_to_date: false,
            error_message: None,
        }
    }

    fn conflicts(files: Vec<String>) -> Self {
        Self {
            analysis: Analysis::Conflicts,
            can_merge: false,
            has_conflicts: true,
            conflict_files: files,
            fast_forward: false,
            up_to_date: false,
            error_message: None,
        }
    }
}

/// Resolves the branch a patch should land on: the requested name first,
/// then the usual default branch names, then whatever branch exists.
/// Returns `(name, tip commit)`.
pub async fn resolve_target_branch(
    provider: &dyn GitProvider,
    dir: &Path,
    requested: &str,
    cache: &ObjectCache,
) -> Result<Option<(String, String)>> {
    let mut candidates: Vec<String> = vec![requested.to_string()];
    for name in FALLBACK_BRANCHES {
        if name != requested {
            candidates.push(name.to_string());
        }
    }
    for candidate in &candidates {
        if let Ok(tip) = provider.resolve_ref(dir, candidate, cache).await {
            return Ok(Some((candidate.clone(), tip)));
        }
    }
    let branches = provider.list_branches(dir, cache).await?;
    Ok(branches
        .first()
        .map(|b| (b.name.clone(), b.commit.clone())))
}

fn patch_commit_ids(patch: &Event) -> Vec<String> {
    let mut ids = Vec::new();
    if let Ok(id) = commit_id_from_patch(patch) {
        ids.push(id);
    }
    for tag in get_tags(patch, "commit") {
        if let Some(value) = tag.as_slice().get(1) {
            if !ids.contains(value) {
                ids.push(value.clone());
            }
        }
    }
    ids
}

fn patch_parent_ids(patch: &Event) -> Vec<String> {
    get_tags(patch, "parent-commit")
        .iter()
        .filter_map(|t| t.as_slice().get(1).cloned())
        .collect()
}

async fn blob_text(
    provider: &dyn GitProvider,
    dir: &Path,
    reference: &str,
    path: &str,
    cache: &ObjectCache,
) -> Result<Option<String>> {
    Ok(provider
        .read_blob(dir, reference, path, cache)
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

/// True when every hunk's pre-image matches the target blob at the
/// position the hunk expects.
fn base_matches_target(file: &DiffFile, target: &str) -> bool {
    let target_lines: Vec<&str> = target.lines().collect();
    for (start, base_lines) in file.base_fragments() {
        let start = start.max(1) as usize - 1;
        for (offset, expected) in base_lines.iter().enumerate() {
            match target_lines.get(start + offset) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
    }
    true
}

async fn scan_file_for_conflict(
    provider: &dyn GitProvider,
    dir: &Path,
    file: &DiffFile,
    target_branch: &str,
    parent_ids: &[String],
    policy: MergePolicy,
    cache: &ObjectCache,
) -> Result<bool> {
    let path = file.path();
    let target = blob_text(provider, dir, target_branch, path, cache).await?;

    if file.change == ChangeKind::Add {
        // an added file colliding with an existing path needs a human
        return Ok(target.is_some());
    }

    if file.is_binary {
        // no hunks to reason about: conflict as soon as the target's copy
        // moved away from ours
        let head = blob_text(provider, dir, "HEAD", path, cache).await?;
        return Ok(target != head);
    }

    if file.has_hunks() {
        return Ok(match &target {
            Some(target) => !base_matches_target(file, target),
            // modified or deleted here, gone on the target
            None => true,
        });
    }

    // filename-only entry (mode change, rename without hunks): compare the
    // copies we can see and treat any divergence as a conflict
    let head = blob_text(provider, dir, "HEAD", path, cache).await?;
    let mut base = None;
    for parent in parent_ids {
        if provider.commit_exists(dir, parent, cache).await? {
            base = blob_text(provider, dir, parent, path, cache).await?;
            break;
        }
    }
    let conflict = match policy {
        MergePolicy::Conservative => {
            let head_vs_target = head != target;
            let head_vs_base = base.is_some() && head != base;
            let base_vs_target = base.is_some() && base != target;
            head_vs_target || head_vs_base || base_vs_target
        }
        MergePolicy::Permissive => head != target,
    };
    Ok(conflict)
}

/// Classifies a patch against a target branch without touching the
/// working tree: up-to-date, fast-forwardable, cleanly mergeable,
/// conflicting (with file granularity) or diverged from the tracked
/// remote.
pub async fn analyze_patch_mergeability(
    provider: &dyn GitProvider,
    dir: &Path,
    patch: &Event,
    target_branch: &str,
    policy: MergePolicy,
    cache: &ObjectCache,
) -> Result<MergeAnalysis> {
    // 1. the patch must carry a parseable unified diff
    let raw = patch.content.trim_start();
    if raw.is_empty() || !raw.starts_with("diff --git") {
        return Ok(MergeAnalysis::error(
            "patch content is empty or not a unified diff",
        ));
    }
    let files = match parse_unified_diff(raw) {
        Ok(files) => files,
        Err(err) => return Ok(MergeAnalysis::error(err.message)),
    };

    let Some((branch, branch_tip)) =
        resolve_target_branch(provider, dir, target_branch, cache).await?
    else {
        return Ok(MergeAnalysis::error("no target branch could be resolved"));
    };

    // 2. already applied?
    let commit_ids = patch_commit_ids(patch);
    let log = provider.log(dir, &branch, None, cache).await?;
    if commit_ids.iter().any(|id| log.contains(id)) {
        return Ok(MergeAnalysis::up_to_date());
    }

    // 3. fast-forward when the proposed tip is already a local object
    //    strictly ahead of the target
    for id in &commit_ids {
        if provider.commit_exists(dir, id, cache).await?
            && provider.is_ancestor(dir, &branch_tip, id, cache).await?
        {
            return Ok(MergeAnalysis::clean(true));
        }
    }

    // 4. a tracked remote that moved past us wins before any file scan
    let remotes = provider.list_remotes(dir, cache).await?;
    if let Some(origin) = remotes
        .iter()
        .find(|r| r.name == "origin")
        .or_else(|| remotes.first())
    {
        provider
            .fetch(
                dir,
                &origin.name,
                &[format!("+refs/heads/*:refs/remotes/{}/*", origin.name)],
                None,
                cache,
            )
            .await?;
        if let Ok(remote_tip) = provider
            .resolve_ref(dir, &format!("{}/{}", origin.name, branch), cache)
            .await
        {
            if !provider
                .is_ancestor(dir, &remote_tip, &branch_tip, cache)
                .await?
            {
                return Ok(MergeAnalysis::diverged());
            }
        }
    }

    // 5. file-granular three-way scan
    let parent_ids = patch_parent_ids(patch);
    let mut conflict_files = Vec::new();
    for file in &files {
        if scan_file_for_conflict(provider, dir, file, &branch, &parent_ids, policy, cache)
            .await?
        {
            let path = file.path().to_string();
            if !conflict_files.contains(&path) {
                conflict_files.push(path);
            }
        }
    }

    if conflict_files.is_empty() {
        Ok(MergeAnalysis::clean(false))
    } else {
        Ok(MergeAnalysis::conflicts(conflict_files))
    }
}

#[cfg(test)]
mod tests {
    use test_utils::{generate_patch_event_with_diff, git::GitTestRepo};

    use super::*;
    use crate::git::Git2Provider;

    fn setup() -> (GitTestRepo, Git2Provider, ObjectCache) {
        let test_repo = GitTestRepo::default();
        test_repo.populate().unwrap();
        (test_repo, Git2Provider::new(), ObjectCache::default())
    }

    fn add_file_diff(path: &str, content: &str) -> String {
        format!(
            "diff --git a/{path} b/{path}\nnew file mode 100644\nindex 0000000..1111111\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,1 @@\n+{content}\n"
        )
    }

    fn modify_t1_diff(old: &str, new: &str) -> String {
        format!(
            "diff --git a/t1.md b/t1.md\nindex 1111111..2222222 100644\n--- a/t1.md\n+++ b/t1.md\n@@ -1,1 +1,1 @@\n-{old}\n+{new}\n"
        )
    }

    const UNKNOWN_COMMIT: &str = "431b84edc0d2fa118d63faa3c2db9c73d630a5ae";

    #[tokio::test]
    async fn empty_or_malformed_content_is_an_error() {
        let (repo, provider, cache) = setup();
        for content in ["", "From 431b84 Mon Sep 17", "not a diff"] {
            let patch = generate_patch_event_with_diff(UNKNOWN_COMMIT, &[], content);
            let analysis =
                analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                    .await
                    .unwrap();
            assert_eq!(analysis.analysis, Analysis::Error);
            assert!(analysis.error_message.is_some());
        }
    }

    #[tokio::test]
    async fn commit_already_in_target_log_is_up_to_date() {
        let (repo, provider, cache) = setup();
        let head = provider
            .head_commit(&repo.dir, &cache)
            .await
            .unwrap()
            .unwrap();
        let patch =
            generate_patch_event_with_diff(&head, &[], &add_file_diff("c.txt", "anything"));
        let analysis =
            analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                .await
                .unwrap();
        assert_eq!(analysis.analysis, Analysis::UpToDate);
        assert!(analysis.up_to_date);
        assert!(!analysis.can_merge);
    }

    #[tokio::test]
    async fn local_commit_ahead_of_target_is_fast_forward() {
        let (repo, provider, cache) = setup();
        repo.create_branch("feature").unwrap();
        repo.checkout("feature").unwrap();
        std::fs::write(repo.dir.join("t3.md"), "feature content").unwrap();
        let tip = repo.stage_and_commit("add t3.md").unwrap().to_string();
        repo.checkout("main").unwrap();

        let patch =
            generate_patch_event_with_diff(&tip, &[], &add_file_diff("t3.md", "feature content"));
        let analysis =
            analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                .await
                .unwrap();
        assert_eq!(analysis.analysis, Analysis::Clean);
        assert!(analysis.fast_forward);
        assert!(analysis.can_merge);
    }

    #[tokio::test]
    async fn added_file_colliding_with_target_conflicts() {
        let (repo, provider, cache) = setup();
        std::fs::write(repo.dir.join("c.txt"), "existing different content").unwrap();
        repo.stage_and_commit("add c.txt").unwrap();

        let patch = generate_patch_event_with_diff(
            UNKNOWN_COMMIT,
            &[],
            &add_file_diff("c.txt", "proposed content"),
        );
        let analysis =
            analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                .await
                .unwrap();
        assert_eq!(analysis.analysis, Analysis::Conflicts);
        assert!(analysis.has_conflicts);
        assert_eq!(analysis.conflict_files, vec!["c.txt".to_string()]);
    }

    #[tokio::test]
    async fn modification_with_matching_base_is_clean() {
        let (repo, provider, cache) = setup();
        let patch = generate_patch_event_with_diff(
            UNKNOWN_COMMIT,
            &[],
            &modify_t1_diff("some content", "updated content"),
        );
        let analysis =
            analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                .await
                .unwrap();
        assert_eq!(analysis.analysis, Analysis::Clean);
        assert!(analysis.can_merge);
        assert!(!analysis.fast_forward);
    }

    #[tokio::test]
    async fn modification_against_diverged_base_conflicts() {
        let (repo, provider, cache) = setup();
        let patch = generate_patch_event_with_diff(
            UNKNOWN_COMMIT,
            &[],
            &modify_t1_diff("content the target never had", "updated content"),
        );
        let analysis =
            analyze_patch_mergeability(&provider, &repo.dir, &patch, "main", MergePolicy::default(), &cache)
                .await
                .unwrap();
        assert_eq!(analysis.analysis, Analysis::Conflicts);
        assert_eq!(analysis.conflict_files, vec!["t1.md".to_string()]);
    }

    #[tokio::test]
    async fn unknown_target_branch_falls_back_to_main() {
        let (repo, provider, cache) = setup();
        let patch = generate_patch_event_with_diff(
            UNKNOWN_COMMIT,
            &[],
            &modify_t1_diff("some content", "updated content"),
        );
        let analysis = analyze_patch_mergeability(
            &provider,
            &repo.dir,
            &patch,
            "no-such-branch",
            MergePolicy::default(),
            &cache,
        )
        .await
        .unwrap();
        assert_eq!(analysis.analysis, Analysis::Clean);
    }

    #[tokio::test]
    async fn local_behind_its_remote_is_diverged() {
        let origin = GitTestRepo::default();
        origin.populate().unwrap();
        let provider = Git2Provider::new();
        let cache = ObjectCache::default();

        let clone_dir = std::env::current_dir()
            .unwrap()
            .join(format!("tmpgit-analyze-{}", rand::random::<u64>()));
        provider
            .clone_repo(&clone_dir, &origin.dir.to_string_lossy(), None, &cache)
            .await
            .unwrap();

        // the remote moves on while the local main rewrites history
        std::fs::write(origin.dir.join("t3.md"), "upstream content").unwrap();
        origin.stage_and_commit("add t3.md").unwrap();
        let clone = GitTestRepo::open(&clone_dir).unwrap();
        std::fs::write(clone_dir.join("local.md"), "local content").unwrap();
        clone.stage_and_commit("local only commit").unwrap();

        let patch = generate_patch_event_with_diff(
            UNKNOWN_COMMIT,
            &[],
            &modify_t1_diff("some content", "updated content"),
        );
        let analysis = analyze_patch_mergeability(
            &provider,
            &clone_dir,
            &patch,
            "main",
            MergePolicy::default(),
            &cache,
        )
        .await
        .unwrap();
        assert_eq!(analysis.analysis, Analysis::Diverged);
        let _ = std::fs::remove_dir_all(clone_dir);
    }
}

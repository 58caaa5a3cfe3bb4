use std::collections::BTreeMap;

use nostr::{Event, EventId};

use crate::events::{
    commit_id_from_patch, event_is_patch_set_root, event_is_revision_root, tags::get_tags,
};

/// One proposed commit, folded across all revisions of the patch that
/// carries it.
#[derive(Debug, Clone)]
pub struct PatchNode {
    pub commit_id: String,
    /// Latest revision by `(created_at, id)`.
    pub event: Event,
    /// Ids of earlier revisions replaced by `event`.
    pub superseded: Vec<EventId>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    /// Sticky: set when any revision was tagged as a patch-set root.
    pub is_root: bool,
    /// Sticky: set when any revision was tagged as a revision root.
    pub is_revision_root: bool,
}

/// Commit-keyed graph of proposed commits. Edges are recorded without
/// traversal, so cyclic references in untrusted input cannot cause
/// non-termination; walkers must carry their own visited set.
#[derive(Debug, Clone, Default)]
pub struct PatchGraph {
    pub nodes: BTreeMap<String, PatchNode>,
}

impl PatchGraph {
    pub fn get(&self, commit_id: &str) -> Option<&PatchNode> {
        self.nodes.get(commit_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn parent_commits(event: &Event) -> Vec<String> {
    let mut parents = Vec::new();
    for tag in get_tags(event, "parent-commit") {
        if let Some(value) = tag.as_slice().get(1) {
            if !parents.contains(value) {
                parents.push(value.clone());
            }
        }
    }
    parents
}

/// Folds a stream of patch events into a commit-keyed graph.
///
/// Revisions of the same logical commit collapse onto one node: events
/// are grouped by their `commit` tag, ordered by `(created_at, id)`, the
/// latest becomes the node's effective event and the rest are recorded as
/// superseded. Root markers survive revision folding regardless of which
/// revision carried them. Patches without a derivable commit id are
/// skipped.
pub fn build_patch_graph(patches: &[Event]) -> PatchGraph {
    let mut by_commit: BTreeMap<String, Vec<&Event>> = BTreeMap::new();
    for event in patches {
        let Ok(commit_id) = commit_id_from_patch(event) else {
            continue;
        };
        by_commit.entry(commit_id).or_default().push(event);
    }

    let mut graph = PatchGraph::default();
    for (commit_id, mut revisions) in by_commit {
        revisions.sort_by_key(|e| (e.created_at, e.id.to_hex()));
        let effective = (*revisions.last().expect("group is non-empty")).clone();
        let superseded = revisions[..revisions.len() - 1]
            .iter()
            .map(|e| e.id)
            .collect();
        let is_root = revisions.iter().any(|e| event_is_patch_set_root(e));
        let is_revision_root = revisions.iter().any(|e| event_is_revision_root(e));
        let parents = parent_commits(&effective);
        graph.nodes.insert(
            commit_id.clone(),
            PatchNode {
                commit_id,
                event: effective,
                superseded,
                parents,
                children: Vec::new(),
                is_root,
                is_revision_root,
            },
        );
    }

    // link children; no duplicates, no traversal
    let edges: Vec<(String, String)> = graph
        .nodes
        .values()
        .flat_map(|node| {
            node.parents
                .iter()
                .map(|p| (p.clone(), node.commit_id.clone()))
                .collect::<Vec<(String, String)>>()
        })
        .collect();
    for (parent, child) in edges {
        if let Some(parent_node) = graph.nodes.get_mut(&parent) {
            if !parent_node.children.contains(&child) {
                parent_node.children.push(child);
            }
        }
    }
    graph
}

/// A patch graph plus its entry points.
#[derive(Debug, Clone, Default)]
pub struct PatchDag {
    pub graph: PatchGraph,
    /// Commits with no recorded parents, or explicitly marked as roots.
    pub roots: Vec<String>,
}

pub fn build_patch_dag(patches: &[Event]) -> PatchDag {
    let graph = build_patch_graph(patches);
    let roots = graph
        .nodes
        .values()
        .filter(|node| node.parents.is_empty() || node.is_root)
        .map(|node| node.commit_id.clone())
        .collect();
    PatchDag { graph, roots }
}

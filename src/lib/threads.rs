use std::collections::HashSet;

use nostr::{Event, EventId, Kind, PublicKey};

use crate::{
    events::{status_kinds, tags::get_tags},
    status::{StatusResolution, resolve_status},
};

/// An issue (or patch-set) root with its ordered comments and effective
/// status.
#[derive(Debug, Clone)]
pub struct IssueThread {
    pub root: Event,
    pub comments: Vec<Event>,
    pub status: StatusResolution,
}

fn first_event_ref(event: &Event, tag_name: &str) -> Option<EventId> {
    get_tags(event, tag_name)
        .iter()
        .filter_map(|t| t.as_slice().get(1))
        .find_map(|v| EventId::parse(v).ok())
}

/// Thread root a comment points at: uppercase `E` per the comment
/// threading convention.
pub fn comment_root(event: &Event) -> Option<EventId> {
    first_event_ref(event, "E")
}

/// Direct parent a comment replies to: lowercase `e`; a comment without
/// one replies to the root itself.
pub fn comment_parent(event: &Event) -> Option<EventId> {
    first_event_ref(event, "e")
}

fn references_root(event: &Event, root_id: &EventId) -> bool {
    comment_root(event) == Some(*root_id) || comment_parent(event) == Some(*root_id)
}

/// Assembles the view of one thread from a mixed event stream: comments
/// that root-reference the issue, in `(created_at, id)` order, plus the
/// effective status resolved from any status events targeting the root.
pub fn resolve_issue_thread(
    root: &Event,
    events: &[Event],
    maintainers: &HashSet<PublicKey>,
) -> IssueThread {
    let mut comments: Vec<Event> = events
        .iter()
        .filter(|e| e.kind.eq(&Kind::Comment) && comment_root(e) == Some(root.id))
        .cloned()
        .collect();
    comments.sort_by_key(|e| (e.created_at, e.id.to_hex()));

    let statuses: Vec<Event> = events
        .iter()
        .filter(|e| status_kinds().contains(&e.kind) && references_root(e, &root.id))
        .cloned()
        .collect();
    let status = resolve_status(&statuses, &root.pubkey, maintainers);

    IssueThread {
        root: root.clone(),
        comments,
        status,
    }
}

#[cfg(test)]
mod tests {
    use nostr::Kind;
    use test_utils::{
        TEST_KEY_1_KEYS, TEST_KEY_2_KEYS, generate_comment_event, generate_issue_event,
        generate_status_event_for,
    };

    use super::*;
    use crate::status::Status;

    fn maintainers() -> HashSet<PublicKey> {
        HashSet::from_iter([TEST_KEY_1_KEYS.public_key()])
    }

    #[test]
    fn comments_are_filtered_to_the_root_and_ordered_by_time() {
        let root = generate_issue_event("parser panics on empty input");
        let other_root = generate_issue_event("unrelated issue");
        let late = generate_comment_event(&root, None, "late reply", 30);
        let early = generate_comment_event(&root, None, "early reply", 10);
        let nested = generate_comment_event(&root, Some(&early), "nested", 20);
        let unrelated = generate_comment_event(&other_root, None, "elsewhere", 5);

        let thread = resolve_issue_thread(
            &root,
            &[late.clone(), unrelated, early.clone(), nested.clone()],
            &maintainers(),
        );
        assert_eq!(
            thread
                .comments
                .iter()
                .map(|c| c.id)
                .collect::<Vec<EventId>>(),
            vec![early.id, nested.id, late.id]
        );
    }

    #[test]
    fn nested_comments_carry_lowercase_parent_and_uppercase_root() {
        let root = generate_issue_event("an issue");
        let top = generate_comment_event(&root, None, "top level", 10);
        let nested = generate_comment_event(&root, Some(&top), "reply", 20);
        assert_eq!(comment_root(&nested), Some(root.id));
        assert_eq!(comment_parent(&nested), Some(top.id));
        assert_eq!(comment_parent(&top), None);
    }

    #[test]
    fn status_events_targeting_the_root_decide_the_outcome() {
        let root = generate_issue_event("an issue");
        let closed =
            generate_status_event_for(&TEST_KEY_1_KEYS, Kind::GitStatusClosed, &root, 50);
        let thread = resolve_issue_thread(&root, &[closed], &maintainers());
        assert_eq!(thread.status.final_status, Status::Closed);
    }

    #[test]
    fn threads_without_statuses_default_to_open() {
        let root = generate_issue_event("an issue");
        let comment = generate_comment_event(&root, None, "me too", 10);
        let thread = resolve_issue_thread(&root, &[comment], &maintainers());
        assert_eq!(thread.status.final_status, Status::Open);
        assert!(thread.status.reason.is_none());
        assert_eq!(thread.root.pubkey, TEST_KEY_2_KEYS.public_key());
    }
}

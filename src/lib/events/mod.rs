pub mod tags;

use nostr::{Event, EventId, Kind};

use crate::error::{CoreError, Result};
use self::tags::{get_tag_value, get_tags};

pub static STATE_KIND: Kind = Kind::Custom(30618);
pub static PULL_REQUEST_KIND: Kind = Kind::Custom(1618);
pub static PERMALINK_KIND: Kind = Kind::Custom(1623);
pub static GRASP_SERVER_SET_KIND: Kind = Kind::Custom(30002);
pub static BOOKMARK_SET_KIND: Kind = Kind::Custom(30003);

pub fn status_kinds() -> Vec<Kind> {
    vec![
        Kind::GitStatusOpen,
        Kind::GitStatusApplied,
        Kind::GitStatusClosed,
        Kind::GitStatusDraft,
    ]
}

fn has_hashtag(event: &Event, value: &str) -> bool {
    event.tags.iter().any(|t| {
        let slice = t.as_slice();
        slice.first().is_some_and(|n| n == "t") && slice.get(1).is_some_and(|v| v == value)
    })
}

pub fn event_is_patch_set_root(event: &Event) -> bool {
    event.kind.eq(&Kind::GitPatch) && has_hashtag(event, "root")
}

pub fn event_is_revision_root(event: &Event) -> bool {
    event.kind.eq(&Kind::GitPatch) && has_hashtag(event, "root-revision")
}

/// Commit id a patch proposes: the `commit` tag, with a fallback to the
/// mbox-style `From <sha>` first line some producers still emit.
pub fn commit_id_from_patch(event: &Event) -> Result<String> {
    if let Some(value) = get_tag_value(event, "commit") {
        return Ok(value.to_string());
    }
    if event.content.starts_with("From ") && event.content.len() > 45 {
        let candidate = &event.content[5..45];
        if is_40_hex(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(CoreError::invalid_input(format!(
        "event {} is not a patch: no commit tag and no mbox header",
        event.id
    )))
}

pub fn is_40_hex(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Schema assertions for the event kinds the core consumes. Gated by
/// `CoreOptions::validate_events`; a failure is always surfaced as an
/// `invalid-input` error, never a silent drop.
pub fn validate_event(event: &Event) -> Result<()> {
    if event.kind.eq(&Kind::GitRepoAnnouncement) || event.kind.eq(&STATE_KIND) {
        if event.tags.identifier().is_none() {
            return Err(CoreError::invalid_input(format!(
                "event {} of kind {} is missing the 'd' handle tag",
                event.id,
                event.kind.as_u16()
            )));
        }
        for tag in get_tags(event, "r") {
            let slice = tag.as_slice();
            if slice.get(2).is_some_and(|m| m == "euc")
                && !slice.get(1).is_some_and(|v| is_40_hex(v))
            {
                return Err(CoreError::invalid_input(format!(
                    "event {} euc reference is not a 40-hex commit id",
                    event.id
                )));
            }
        }
    }
    if event.kind.eq(&Kind::GitPatch) {
        commit_id_from_patch(event)?;
        for name in ["commit", "parent-commit"] {
            for tag in get_tags(event, name) {
                if let Some(value) = tag.as_slice().get(1) {
                    if !is_40_hex(value) {
                        return Err(CoreError::invalid_input(format!(
                            "event {} '{name}' tag value '{value}' is not a 40-hex commit id",
                            event.id
                        )));
                    }
                }
            }
        }
    }
    if status_kinds().contains(&event.kind) {
        let has_root = ["e", "E"].into_iter().any(|name| {
            get_tags(event, name)
                .iter()
                .any(|t| t.as_slice().get(1).is_some_and(|v| EventId::parse(v).is_ok()))
        });
        if !has_root {
            return Err(CoreError::invalid_input(format!(
                "status event {} does not reference a root event",
                event.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_utils::{
        generate_issue_event, generate_patch_event_with, generate_repo_ref_event,
        generate_status_event,
    };

    use super::*;

    #[test]
    fn status_kinds_cover_open_applied_closed_draft() {
        let kinds = status_kinds();
        assert_eq!(kinds.len(), 4);
        assert!(kinds.contains(&Kind::GitStatusOpen));
        assert!(kinds.contains(&Kind::GitStatusApplied));
        assert!(kinds.contains(&Kind::GitStatusClosed));
        assert!(kinds.contains(&Kind::GitStatusDraft));
    }

    #[test]
    fn custom_kind_numbers_are_stable() {
        assert_eq!(STATE_KIND.as_u16(), 30618);
        assert_eq!(PULL_REQUEST_KIND.as_u16(), 1618);
        assert_eq!(PERMALINK_KIND.as_u16(), 1623);
        assert_eq!(GRASP_SERVER_SET_KIND.as_u16(), 30002);
        assert_eq!(BOOKMARK_SET_KIND.as_u16(), 30003);
    }

    mod patch_classification {
        use super::*;

        #[test]
        fn commit_tag_wins_over_content() {
            let commit = "431b84edc0d2fa118d63faa3c2db9c73d630a5ae";
            let event = generate_patch_event_with(commit, &[], true, false);
            assert_eq!(commit_id_from_patch(&event).unwrap(), commit);
        }

        #[test]
        fn mbox_content_fallback() {
            let event = test_utils::generate_patch_event_from_content(
                "From 431b84edc0d2fa118d63faa3c2db9c73d630a5ae Mon Sep 17 00:00:00 2001\n...",
            );
            assert_eq!(
                commit_id_from_patch(&event).unwrap(),
                "431b84edc0d2fa118d63faa3c2db9c73d630a5ae"
            );
        }

        #[test]
        fn non_patch_is_rejected() {
            let event = generate_issue_event("a bug");
            assert!(commit_id_from_patch(&event).is_err());
        }

        #[test]
        fn root_markers() {
            let commit = "431b84edc0d2fa118d63faa3c2db9c73d630a5ae";
            let root = generate_patch_event_with(commit, &[], true, false);
            assert!(event_is_patch_set_root(&root));
            assert!(!event_is_revision_root(&root));
            let revision = generate_patch_event_with(commit, &[], false, true);
            assert!(event_is_revision_root(&revision));
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn announcement_passes() {
            assert!(validate_event(&generate_repo_ref_event()).is_ok());
        }

        #[test]
        fn patch_with_commit_tag_passes() {
            let event = generate_patch_event_with(
                "431b84edc0d2fa118d63faa3c2db9c73d630a5ae",
                &["22d79aed1dbefa38ea8e266e57c3d1e5d2e8a4b0"],
                true,
                false,
            );
            assert!(validate_event(&event).is_ok());
        }

        #[test]
        fn status_without_root_reference_fails() {
            let status = generate_status_event(Kind::GitStatusClosed, None);
            let err = validate_event(&status).unwrap_err();
            assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
        }
    }
}

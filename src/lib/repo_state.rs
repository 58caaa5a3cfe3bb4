use std::collections::{BTreeMap, HashSet};

use git2::Oid;
use nostr::{
    Event, EventBuilder, EventId, PublicKey, Tag, TagKind, Timestamp, UnsignedEvent,
};

use crate::{
    error::{CoreError, Result},
    events::STATE_KIND,
};

/// One author's published view of a repository's refs (kind 30618).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStateEvent {
    pub identifier: String,
    pub author: PublicKey,
    pub created_at: Timestamp,
    pub event_id: EventId,
    /// `(full ref, commit id or symbolic target)` pairs, HEAD included.
    pub refs: Vec<(String, String)>,
}

impl TryFrom<&Event> for RepoStateEvent {
    type Error = CoreError;

    fn try_from(event: &Event) -> Result<Self> {
        if !event.kind.eq(&STATE_KIND) {
            return Err(CoreError::invalid_input(format!(
                "event {} is not a repository state event",
                event.id
            )));
        }
        let mut refs = Vec::new();
        for tag in event.tags.iter() {
            if let Some(name) = tag.as_slice().first() {
                if ["refs/heads/", "refs/tags", "HEAD"]
                    .iter()
                    .any(|s| name.starts_with(*s))
                    // dont include dereferenced tags
                    && !name.ends_with("^{}")
                {
                    if let Some(value) = tag.as_slice().get(1) {
                        if Oid::from_str(value).is_ok() || value.contains("ref: refs/") {
                            refs.push((name.to_owned(), value.to_owned()));
                        }
                    }
                }
            }
        }
        // Infer a HEAD when none is listed so callers never see a repo
        // without a default branch hint
        if !refs.iter().any(|(name, _)| name == "HEAD") {
            if let Some((name, _)) = refs
                .iter()
                .find(|(name, _)| name == "refs/heads/master")
                .or_else(|| refs.iter().find(|(name, _)| name == "refs/heads/main"))
                .or_else(|| {
                    refs.iter()
                        .find(|(name, _)| name.starts_with("refs/heads/"))
                })
            {
                let target = format!("ref: {name}");
                refs.push(("HEAD".to_string(), target));
            }
        }
        Ok(RepoStateEvent {
            identifier: event
                .tags
                .identifier()
                .ok_or_else(|| {
                    CoreError::invalid_input(format!(
                        "state event {} must have an identifier",
                        event.id
                    ))
                })?
                .to_string(),
            author: event.pubkey,
            created_at: event.created_at,
            event_id: event.id,
            refs,
        })
    }
}

/// Unsigned 30618 template listing the given refs under `identifier`.
pub fn state_event_template(
    author: PublicKey,
    identifier: &str,
    refs: &[(String, String)],
) -> UnsignedEvent {
    let mut tags = vec![Tag::identifier(identifier)];
    for (full_ref, value) in refs {
        tags.push(Tag::custom(
            TagKind::Custom(std::borrow::Cow::Owned(full_ref.clone())),
            vec![value.clone()],
        ));
    }
    EventBuilder::new(STATE_KIND, "").tags(tags).build(author)
}

/// The winning entry for one ref key of a merged state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    /// Commit id, or a `ref: refs/…` symbolic target for HEAD.
    pub commit_id: String,
    pub author: PublicKey,
    pub timestamp: Timestamp,
    pub full_ref: String,
}

/// Authoritative ref map keyed by `type:short` (`heads:main`, `tags:v1`)
/// plus `HEAD`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedState {
    pub refs: BTreeMap<String, RefEntry>,
}

impl MergedState {
    pub fn head(&self) -> Option<&RefEntry> {
        self.refs.get("HEAD")
    }

    /// `(full ref, value)` pairs in deterministic order.
    pub fn as_ref_pairs(&self) -> Vec<(String, String)> {
        self.refs
            .values()
            .map(|entry| (entry.full_ref.clone(), entry.commit_id.clone()))
            .collect()
    }
}

fn short_key(full_ref: &str) -> Option<String> {
    if full_ref == "HEAD" {
        return Some("HEAD".to_string());
    }
    let rest = full_ref.strip_prefix("refs/")?;
    let (ref_type, short) = rest.split_once('/')?;
    if short.is_empty() {
        return None;
    }
    Some(format!("{ref_type}:{short}"))
}

/// Merges the state events of many authors into one ref map. Only
/// maintainer-authored events count; per key the newest `created_at`
/// wins, with ties broken by the lexicographically greater event id so
/// the result is deterministic.
pub fn merge_repo_state_by_maintainers(
    maintainers: &HashSet<PublicKey>,
    state_events: &[Event],
) -> MergedState {
    let mut merged = MergedState::default();
    let mut winner_ranks: std::collections::HashMap<String, (Timestamp, String)> =
        std::collections::HashMap::new();
    for event in state_events {
        if !maintainers.contains(&event.pubkey) {
            continue;
        }
        let Ok(state) = RepoStateEvent::try_from(event) else {
            continue;
        };
        let rank = (event.created_at, event.id.to_hex());
        for (full_ref, value) in &state.refs {
            let Some(key) = short_key(full_ref) else {
                continue;
            };
            let replace = match winner_ranks.get(&key) {
                Some(incumbent) => rank > *incumbent,
                None => true,
            };
            if replace {
                winner_ranks.insert(key.clone(), rank.clone());
                merged.refs.insert(
                    key,
                    RefEntry {
                        commit_id: value.clone(),
                        author: state.author,
                        timestamp: state.created_at,
                        full_ref: full_ref.clone(),
                    },
                );
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use test_utils::{
        TEST_KEY_1_KEYS, TEST_KEY_2_KEYS, TEST_KEY_3_KEYS, generate_state_event_at,
    };

    use super::*;

    const C1: &str = "431b84edc0d2fa118d63faa3c2db9c73d630a5ae";
    const C2: &str = "22d79aed1dbefa38ea8e266e57c3d1e5d2e8a4b0";
    const C3: &str = "9ee507fc4357d7ee16a5d8901bedcd103f23c17d";

    fn maintainers() -> HashSet<PublicKey> {
        HashSet::from_iter([TEST_KEY_1_KEYS.public_key()])
    }

    mod parse {
        use super::*;

        #[test]
        fn keeps_heads_tags_and_head() {
            let event = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[
                    ("refs/heads/main", C1),
                    ("refs/tags/v1", C2),
                    ("HEAD", "ref: refs/heads/main"),
                ],
                10,
            );
            let state = RepoStateEvent::try_from(&event).unwrap();
            assert_eq!(state.refs.len(), 3);
        }

        #[test]
        fn skips_dereferenced_tags_and_non_oid_values() {
            let event = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[
                    ("refs/tags/v1^{}", C1),
                    ("refs/heads/main", "not-a-commit"),
                    ("refs/heads/dev", C2),
                ],
                10,
            );
            let state = RepoStateEvent::try_from(&event).unwrap();
            let names: Vec<&String> = state.refs.iter().map(|(n, _)| n).collect();
            assert!(names.contains(&&"refs/heads/dev".to_string()));
            assert!(!names.contains(&&"refs/tags/v1^{}".to_string()));
            assert!(!names.iter().any(|n| *n == "refs/heads/main"));
        }

        #[test]
        fn infers_head_preferring_master_then_main() {
            let event = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C1), ("refs/heads/master", C2)],
                10,
            );
            let state = RepoStateEvent::try_from(&event).unwrap();
            let head = state
                .refs
                .iter()
                .find(|(n, _)| n == "HEAD")
                .map(|(_, v)| v.clone());
            assert_eq!(head.as_deref(), Some("ref: refs/heads/master"));
        }
    }

    mod merge {
        use super::*;

        #[test]
        fn non_maintainer_entries_are_dropped_even_when_newer() {
            let maintainer_old = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C1)],
                10,
            );
            let outsider_new = generate_state_event_at(
                &TEST_KEY_3_KEYS,
                "example",
                &[("refs/heads/main", C2)],
                20,
            );
            let maintainer_new = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C3)],
                30,
            );
            let merged = merge_repo_state_by_maintainers(
                &maintainers(),
                &[maintainer_old, outsider_new, maintainer_new],
            );
            assert_eq!(merged.refs.get("heads:main").unwrap().commit_id, C3);
        }

        #[test]
        fn newest_maintainer_entry_wins_per_key() {
            let both = HashSet::from_iter([
                TEST_KEY_1_KEYS.public_key(),
                TEST_KEY_2_KEYS.public_key(),
            ]);
            let a = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C1), ("refs/tags/v1", C2)],
                10,
            );
            let b = generate_state_event_at(
                &TEST_KEY_2_KEYS,
                "example",
                &[("refs/heads/main", C2)],
                20,
            );
            let merged = merge_repo_state_by_maintainers(&both, &[a, b]);
            assert_eq!(merged.refs.get("heads:main").unwrap().commit_id, C2);
            assert_eq!(
                merged.refs.get("heads:main").unwrap().author,
                TEST_KEY_2_KEYS.public_key()
            );
            // untouched key keeps the older author's entry
            assert_eq!(merged.refs.get("tags:v1").unwrap().commit_id, C2);
            assert_eq!(
                merged.refs.get("tags:v1").unwrap().author,
                TEST_KEY_1_KEYS.public_key()
            );
        }

        #[test]
        fn timestamp_ties_break_by_greater_event_id() {
            let both = HashSet::from_iter([
                TEST_KEY_1_KEYS.public_key(),
                TEST_KEY_2_KEYS.public_key(),
            ]);
            let a = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C1)],
                10,
            );
            let b = generate_state_event_at(
                &TEST_KEY_2_KEYS,
                "example",
                &[("refs/heads/main", C2)],
                10,
            );
            let winner = if a.id.to_hex() > b.id.to_hex() { C1 } else { C2 };
            let forward = merge_repo_state_by_maintainers(&both, &[a.clone(), b.clone()]);
            let reversed = merge_repo_state_by_maintainers(&both, &[b, a]);
            assert_eq!(forward.refs.get("heads:main").unwrap().commit_id, winner);
            assert_eq!(forward, reversed);
        }

        #[test]
        fn head_is_merged_like_any_other_key() {
            let a = generate_state_event_at(
                &TEST_KEY_1_KEYS,
                "example",
                &[("refs/heads/main", C1), ("HEAD", "ref: refs/heads/main")],
                10,
            );
            let merged = merge_repo_state_by_maintainers(&maintainers(), &[a]);
            assert_eq!(merged.head().unwrap().commit_id, "ref: refs/heads/main");
        }
    }

    #[test]
    fn template_round_trips_through_parse() {
        let template = state_event_template(
            TEST_KEY_1_KEYS.public_key(),
            "example",
            &[
                ("refs/heads/main".to_string(), C1.to_string()),
                ("HEAD".to_string(), "ref: refs/heads/main".to_string()),
            ],
        );
        let event = test_utils::sign_template(template, &TEST_KEY_1_KEYS);
        let state = RepoStateEvent::try_from(&event).unwrap();
        assert_eq!(state.identifier, "example");
        assert_eq!(state.refs.len(), 2);
    }
}

use std::collections::HashMap;

use nostr::{Event, FromBech32, PublicKey, RelayUrl};

use crate::repo_ref::RepoAnnouncement;

/// Placeholder substituted for per-user path segments so that personal
/// forks hosted on the same relay collapse to one clone identity.
const NPUB_SEGMENT_PLACEHOLDER: &str = "<npub>";

/// The union of all announcements that describe the same repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoGroup {
    pub group_key: String,
    pub euc: String,
    pub name: String,
    /// Unique `d` handles seen across the group's announcements.
    pub handles: Vec<String>,
    pub announcements: Vec<RepoAnnouncement>,
    pub web: Vec<String>,
    pub clone_urls: Vec<String>,
    pub relays: Vec<RelayUrl>,
    /// Declared maintainers plus every announcement author.
    pub maintainers: Vec<PublicKey>,
}

/// Strips the decorations that make equivalent clone URLs compare
/// unequal: case, `.git`, trailing slashes and per-user `npub1…` path
/// segments.
pub fn normalize_clone_url_for_grouping(url: &str) -> String {
    let lowered = url.trim().to_ascii_lowercase();
    let stripped = lowered.trim_end_matches('/');
    let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);
    stripped
        .split('/')
        .map(|segment| {
            if PublicKey::from_bech32(segment).is_ok() {
                NPUB_SEGMENT_PLACEHOLDER
            } else {
                segment
            }
        })
        .collect::<Vec<&str>>()
        .join("/")
}

fn group_key_for(announcement: &RepoAnnouncement) -> String {
    let mut clones: Vec<String> = announcement
        .clone_urls
        .iter()
        .map(|u| normalize_clone_url_for_grouping(u))
        .collect();
    clones.sort();
    clones.dedup();
    let name = if announcement.name.is_empty() {
        announcement.identifier.clone()
    } else {
        announcement.name.clone()
    };
    format!("{}:{}:{}", announcement.euc, name, clones.join("|"))
}

fn push_unique<T: PartialEq + Clone>(list: &mut Vec<T>, value: &T) {
    if !list.contains(value) {
        list.push(value.clone());
    }
}

/// Folds repository announcements into groups keyed by earliest-unique
/// commit, normalized name and normalized clone set. Two announcements
/// with the same EUC but different names are forks and stay apart; the
/// same EUC, name and clone set from different authors is one repository.
pub fn group_by_euc(events: &[Event]) -> Vec<RepoGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, RepoGroup> = HashMap::new();

    for event in events {
        let Ok(announcement) = RepoAnnouncement::try_from(event) else {
            continue;
        };
        let key = group_key_for(&announcement);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            RepoGroup {
                group_key: key.clone(),
                euc: announcement.euc.clone(),
                name: if announcement.name.is_empty() {
                    announcement.identifier.clone()
                } else {
                    announcement.name.clone()
                },
                handles: Vec::new(),
                announcements: Vec::new(),
                web: Vec::new(),
                clone_urls: Vec::new(),
                relays: Vec::new(),
                maintainers: Vec::new(),
            }
        });

        if !announcement.identifier.is_empty() {
            push_unique(&mut group.handles, &announcement.identifier);
        }
        for url in &announcement.web {
            push_unique(&mut group.web, url);
        }
        for url in &announcement.clone_urls {
            push_unique(&mut group.clone_urls, url);
        }
        for relay in &announcement.relays {
            push_unique(&mut group.relays, relay);
        }
        for maintainer in &announcement.maintainers {
            push_unique(&mut group.maintainers, maintainer);
        }
        // publication itself confers authority
        push_unique(&mut group.maintainers, &announcement.author);
        group.announcements.push(announcement);
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

#[cfg(test)]
mod tests {
    use test_utils::{
        TEST_KEY_1_KEYS, TEST_KEY_2_KEYS, AnnouncementSpec, generate_announcement,
    };

    use super::*;

    const EUC: &str = "9ee507fc4357d7ee16a5d8901bedcd103f23c17d";

    mod clone_url_normalization {
        use super::*;

        #[test]
        fn strips_git_suffix_and_trailing_slash() {
            assert_eq!(
                normalize_clone_url_for_grouping("https://Host/User/Alpha.git/"),
                "https://host/user/alpha"
            );
        }

        #[test]
        fn replaces_npub_path_segments() {
            use nostr::ToBech32;
            let npub = TEST_KEY_1_KEYS.public_key().to_bech32().unwrap();
            assert_eq!(
                normalize_clone_url_for_grouping(&format!("https://relay.host/{npub}/alpha.git")),
                "https://relay.host/<npub>/alpha"
            );
        }
    }

    #[test]
    fn same_euc_name_and_clones_from_two_authors_is_one_group() {
        let a = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_1_KEYS,
            identifier: "alpha",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git"],
            ..AnnouncementSpec::default()
        });
        let b = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_2_KEYS,
            identifier: "alpha-mirror",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git/"],
            ..AnnouncementSpec::default()
        });
        let groups = group_by_euc(&[a, b]);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.handles, vec!["alpha", "alpha-mirror"]);
        assert!(group.maintainers.contains(&TEST_KEY_1_KEYS.public_key()));
        assert!(group.maintainers.contains(&TEST_KEY_2_KEYS.public_key()));
    }

    #[test]
    fn same_euc_different_name_is_a_fork_and_two_groups() {
        let a = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_1_KEYS,
            identifier: "alpha",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git"],
            ..AnnouncementSpec::default()
        });
        let b = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_2_KEYS,
            identifier: "alpha-fork",
            name: "alpha-fork",
            euc: EUC,
            clone_urls: &["https://h/v/alpha-fork.git"],
            ..AnnouncementSpec::default()
        });
        let groups = group_by_euc(&[a, b]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn facets_are_the_union_of_member_facets() {
        let a = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_1_KEYS,
            identifier: "alpha",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git"],
            web: &["https://alpha.example"],
            relays: &["wss://relay-a.example"],
            ..AnnouncementSpec::default()
        });
        let b = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_2_KEYS,
            identifier: "alpha",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git"],
            web: &["https://alpha.example", "https://alpha.other"],
            relays: &["wss://relay-b.example"],
            ..AnnouncementSpec::default()
        });
        let groups = group_by_euc(&[a.clone(), b.clone()]);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(
            group.web,
            vec!["https://alpha.example", "https://alpha.other"]
        );
        assert_eq!(group.relays.len(), 2);
        assert_eq!(group.announcements.len(), 2);
        // every author appears in the maintainer set
        for event in [&a, &b] {
            assert!(group.maintainers.contains(&event.pubkey));
        }
    }

    #[test]
    fn non_announcements_are_skipped() {
        let issue = test_utils::generate_issue_event("just an issue");
        assert!(group_by_euc(&[issue]).is_empty());
    }

    #[test]
    fn grouping_is_stable_under_input_reordering() {
        let a = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_1_KEYS,
            identifier: "alpha",
            name: "alpha",
            euc: EUC,
            clone_urls: &["https://h/u/alpha.git"],
            ..AnnouncementSpec::default()
        });
        let b = generate_announcement(&AnnouncementSpec {
            keys: &TEST_KEY_2_KEYS,
            identifier: "beta",
            name: "beta",
            euc: "22d79aed1dbefa38ea8e266e57c3d1e5d2e8a4b0",
            clone_urls: &["https://h/u/beta.git"],
            ..AnnouncementSpec::default()
        });
        let forward = group_by_euc(&[a.clone(), b.clone()]);
        let reversed = group_by_euc(&[b, a]);
        assert_eq!(forward.len(), 2);
        assert_eq!(reversed.len(), 2);
        let mut forward_keys: Vec<&String> = forward.iter().map(|g| &g.group_key).collect();
        let mut reversed_keys: Vec<&String> = reversed.iter().map(|g| &g.group_key).collect();
        forward_keys.sort();
        reversed_keys.sort();
        assert_eq!(forward_keys, reversed_keys);
    }
}

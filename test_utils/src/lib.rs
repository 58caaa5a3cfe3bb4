pub mod git;

use std::{borrow::Cow, sync::LazyLock};

use nostr::{
    Event, EventBuilder, EventId, Keys, Kind, PublicKey, Tag, TagKind, Timestamp, UnsignedEvent,
};

pub static TEST_KEY_1_NSEC: &str =
    "nsec1ppsg5sm2aexq06juxmu9evtutr6jkwkhp98exxxvwamhru9lyx9s3rwseq";

pub static TEST_KEY_2_NSEC: &str =
    "nsec1ypglg6nj6ep0g2qmyfqcv2al502gje3jvpwye6mthmkvj93tqkesknv6qm";

pub static TEST_KEY_1_KEYS: LazyLock<Keys> =
    LazyLock::new(|| Keys::parse(TEST_KEY_1_NSEC).unwrap());

pub static TEST_KEY_2_KEYS: LazyLock<Keys> =
    LazyLock::new(|| Keys::parse(TEST_KEY_2_NSEC).unwrap());

pub static TEST_KEY_3_KEYS: LazyLock<Keys> = LazyLock::new(|| {
    Keys::parse("0000000000000000000000000000000000000000000000000000000000000003").unwrap()
});

pub const TEST_EUC: &str = "9ee507fc4357d7ee16a5d8901bedcd103f23c17d";

pub fn sign_template(template: UnsignedEvent, keys: &Keys) -> Event {
    template.sign_with_keys(keys).unwrap()
}

fn custom_tag(name: &'static str, values: Vec<String>) -> Tag {
    Tag::custom(TagKind::Custom(Cow::Borrowed(name)), values)
}

fn random_event_id_hex() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct AnnouncementSpec<'a> {
    pub keys: &'a Keys,
    pub identifier: &'a str,
    pub name: &'a str,
    pub euc: &'a str,
    pub clone_urls: &'a [&'a str],
    pub web: &'a [&'a str],
    pub relays: &'a [&'a str],
    pub maintainers: &'a [PublicKey],
}

impl Default for AnnouncementSpec<'static> {
    fn default() -> Self {
        Self {
            keys: &TEST_KEY_1_KEYS,
            identifier: "example-identifier",
            name: "example name",
            euc: TEST_EUC,
            clone_urls: &[],
            web: &[],
            relays: &[],
            maintainers: &[],
        }
    }
}

pub fn generate_announcement(spec: &AnnouncementSpec) -> Event {
    let mut tags = vec![
        Tag::identifier(spec.identifier),
        custom_tag("name", vec![spec.name.to_string()]),
        custom_tag("r", vec![spec.euc.to_string(), "euc".to_string()]),
    ];
    if !spec.clone_urls.is_empty() {
        tags.push(custom_tag(
            "clone",
            spec.clone_urls.iter().map(ToString::to_string).collect(),
        ));
    }
    if !spec.web.is_empty() {
        tags.push(custom_tag(
            "web",
            spec.web.iter().map(ToString::to_string).collect(),
        ));
    }
    if !spec.relays.is_empty() {
        tags.push(custom_tag(
            "relays",
            spec.relays.iter().map(ToString::to_string).collect(),
        ));
    }
    if !spec.maintainers.is_empty() {
        tags.push(custom_tag(
            "maintainers",
            spec.maintainers.iter().map(ToString::to_string).collect(),
        ));
    }
    EventBuilder::new(Kind::GitRepoAnnouncement, "")
        .tags(tags)
        .sign_with_keys(spec.keys)
        .unwrap()
}

pub fn generate_repo_ref_event() -> Event {
    generate_announcement(&AnnouncementSpec {
        keys: &TEST_KEY_1_KEYS,
        identifier: "example-identifier",
        name: "example name",
        euc: TEST_EUC,
        clone_urls: &["https://localhost:1000"],
        web: &["https://exampleproject.xyz", "https://gitworkshop.dev/123"],
        relays: &["wss://relay1.io", "wss://relay2.io"],
        maintainers: &[TEST_KEY_1_KEYS.public_key(), TEST_KEY_2_KEYS.public_key()],
    })
}

pub fn generate_repo_ref_event_with_euc(euc: &str) -> Event {
    generate_announcement(&AnnouncementSpec {
        euc,
        ..AnnouncementSpec::default()
    })
}

pub fn generate_state_event_at(
    keys: &Keys,
    identifier: &str,
    refs: &[(&str, &str)],
    created_at: u64,
) -> Event {
    let mut tags = vec![Tag::identifier(identifier)];
    for (full_ref, value) in refs {
        tags.push(Tag::custom(
            TagKind::Custom(Cow::Owned(full_ref.to_string())),
            vec![value.to_string()],
        ));
    }
    EventBuilder::new(Kind::Custom(30618), "")
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

fn patch_tags(commit: &str, parents: &[&str], root: bool, revision_root: bool) -> Vec<Tag> {
    let mut tags = vec![custom_tag("commit", vec![commit.to_string()])];
    for parent in parents {
        tags.push(custom_tag("parent-commit", vec![parent.to_string()]));
    }
    if root {
        tags.push(Tag::hashtag("root"));
    }
    if revision_root {
        tags.push(Tag::hashtag("root-revision"));
    }
    tags
}

pub fn generate_patch_event_at(
    commit: &str,
    parents: &[&str],
    root: bool,
    revision_root: bool,
    created_at: u64,
) -> Event {
    EventBuilder::new(
        Kind::GitPatch,
        "diff --git a/example.txt b/example.txt\n--- a/example.txt\n+++ b/example.txt\n@@ -1,1 +1,1 @@\n-old\n+new\n",
    )
    .tags(patch_tags(commit, parents, root, revision_root))
    .custom_created_at(Timestamp::from(created_at))
    .sign_with_keys(&TEST_KEY_2_KEYS)
    .unwrap()
}

pub fn generate_patch_event_with(
    commit: &str,
    parents: &[&str],
    root: bool,
    revision_root: bool,
) -> Event {
    generate_patch_event_at(commit, parents, root, revision_root, 1_000)
}

pub fn generate_patch_event_with_diff(commit: &str, parents: &[&str], diff: &str) -> Event {
    EventBuilder::new(Kind::GitPatch, diff)
        .tags(patch_tags(commit, parents, true, false))
        .sign_with_keys(&TEST_KEY_2_KEYS)
        .unwrap()
}

pub fn generate_patch_event_from_content(content: &str) -> Event {
    EventBuilder::new(Kind::GitPatch, content)
        .sign_with_keys(&TEST_KEY_2_KEYS)
        .unwrap()
}

pub fn generate_issue_event(content: &str) -> Event {
    EventBuilder::new(Kind::GitIssue, content)
        .sign_with_keys(&TEST_KEY_2_KEYS)
        .unwrap()
}

pub fn generate_issue_event_with_labels(
    namespaces: &[&str],
    labels: &[(&str, Option<&str>)],
    topics: &[&str],
) -> Event {
    let mut tags = Vec::new();
    for namespace in namespaces {
        tags.push(custom_tag("L", vec![namespace.to_string()]));
    }
    for (value, namespace) in labels {
        let mut values = vec![value.to_string()];
        if let Some(namespace) = namespace {
            values.push(namespace.to_string());
        }
        tags.push(custom_tag("l", values));
    }
    for topic in topics {
        tags.push(Tag::hashtag(*topic));
    }
    EventBuilder::new(Kind::GitIssue, "an issue with labels")
        .tags(tags)
        .sign_with_keys(&TEST_KEY_2_KEYS)
        .unwrap()
}

pub fn generate_label_event(namespace: &str, value: &str, target: Option<&Event>) -> Event {
    let mut tags = vec![
        custom_tag("L", vec![namespace.to_string()]),
        custom_tag("l", vec![value.to_string(), namespace.to_string()]),
    ];
    if let Some(target) = target {
        tags.push(custom_tag("e", vec![target.id.to_hex()]));
    }
    EventBuilder::new(Kind::Label, "")
        .tags(tags)
        .sign_with_keys(&TEST_KEY_3_KEYS)
        .unwrap()
}

pub fn generate_status_event(kind: Kind, root: Option<&EventId>) -> Event {
    let mut tags = Vec::new();
    if let Some(root) = root {
        tags.push(custom_tag("e", vec![root.to_hex()]));
    }
    EventBuilder::new(kind, "")
        .tags(tags)
        .sign_with_keys(&TEST_KEY_1_KEYS)
        .unwrap()
}

pub fn generate_status_event_for(
    keys: &Keys,
    kind: Kind,
    root: &Event,
    created_at: u64,
) -> Event {
    EventBuilder::new(kind, "")
        .tags([custom_tag("e", vec![root.id.to_hex()])])
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

/// NIP-22 style comment: uppercase tags reference the thread root,
/// lowercase tags the direct parent.
pub fn generate_comment_event(
    root: &Event,
    parent: Option<&Event>,
    content: &str,
    created_at: u64,
) -> Event {
    let mut tags = vec![
        custom_tag("E", vec![root.id.to_hex()]),
        custom_tag("K", vec![root.kind.as_u16().to_string()]),
        custom_tag("P", vec![root.pubkey.to_string()]),
    ];
    if let Some(parent) = parent {
        tags.push(custom_tag("e", vec![parent.id.to_hex()]));
        tags.push(custom_tag("k", vec![parent.kind.as_u16().to_string()]));
        tags.push(custom_tag("p", vec![parent.pubkey.to_string()]));
    }
    EventBuilder::new(Kind::Comment, content)
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(&TEST_KEY_3_KEYS)
        .unwrap()
}

pub fn generate_status_event_at(keys: &Keys, kind: Kind, created_at: u64) -> Event {
    EventBuilder::new(kind, "")
        .tags([custom_tag("e", vec![random_event_id_hex()])])
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .unwrap()
}

use nostr::{
    Event, EventBuilder, Kind, PublicKey, RelayUrl, Tag, TagKind, TagStandard, Timestamp,
    UnsignedEvent,
};

use crate::{
    canonical::make_repo_addr,
    error::{CoreError, Result},
    events::is_40_hex,
};

/// A parsed repository announcement (kind 30617).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoAnnouncement {
    pub identifier: String,
    pub name: String,
    pub description: String,
    /// Earliest-unique-commit: the repository's content fingerprint.
    pub euc: String,
    pub clone_urls: Vec<String>,
    pub web: Vec<String>,
    pub relays: Vec<RelayUrl>,
    pub maintainers: Vec<PublicKey>,
    pub author: PublicKey,
    pub created_at: Timestamp,
}

impl TryFrom<&Event> for RepoAnnouncement {
    type Error = CoreError;

    fn try_from(event: &Event) -> Result<Self> {
        if !event.kind.eq(&Kind::GitRepoAnnouncement) {
            return Err(CoreError::invalid_input(format!(
                "event {} is not a repository announcement",
                event.id
            )));
        }

        let mut r = Self {
            identifier: String::new(),
            name: String::new(),
            description: String::new(),
            euc: String::new(),
            clone_urls: Vec::new(),
            web: Vec::new(),
            relays: Vec::new(),
            maintainers: Vec::new(),
            author: event.pubkey,
            created_at: event.created_at,
        };

        for tag in event.tags.iter() {
            match tag.as_slice() {
                [t, id, ..] if t == "d" => r.identifier = id.clone(),
                [t, name, ..] if t == "name" => r.name = name.clone(),
                [t, description, ..] if t == "description" => r.description = description.clone(),
                [t, clone @ ..] if t == "clone" => {
                    r.clone_urls = clone.to_vec();
                }
                [t, web @ ..] if t == "web" => {
                    r.web = web.to_vec();
                }
                [t, commit_id]
                    if t == "r" && is_40_hex(commit_id) && git2::Oid::from_str(commit_id).is_ok() =>
                {
                    r.euc = commit_id.clone();
                }
                [t, commit_id, marker]
                    if t == "r"
                        && marker == "euc"
                        && is_40_hex(commit_id)
                        && git2::Oid::from_str(commit_id).is_ok() =>
                {
                    r.euc = commit_id.clone();
                }
                [t, relays @ ..] if t == "relays" => {
                    for relay in relays {
                        if let Ok(relay_url) = RelayUrl::parse(relay) {
                            r.relays.push(relay_url);
                        }
                    }
                }
                [t, maintainers @ ..] if t == "maintainers" => {
                    if !maintainers.contains(&event.pubkey.to_string()) {
                        r.maintainers.push(event.pubkey);
                    }
                    for pk in maintainers {
                        r.maintainers.push(PublicKey::parse(pk).map_err(|e| {
                            CoreError::invalid_input(format!(
                                "maintainers tag entry '{pk}' is not a valid public key: {e}"
                            ))
                        })?);
                    }
                }
                _ => {}
            }
        }

        // The author always has authority over their own announcement.
        if r.maintainers.is_empty() {
            r.maintainers.push(event.pubkey);
        }
        Ok(r)
    }
}

impl RepoAnnouncement {
    /// Unsigned announcement template. Signing is the host's concern.
    pub fn to_event_template(&self) -> UnsignedEvent {
        EventBuilder::new(Kind::GitRepoAnnouncement, "")
            .tags([
                Tag::identifier(if self.identifier.is_empty() {
                    // an identifier derived from the earliest commit stops
                    // users accidentally minting two handles for one repo;
                    // 7 characters is the shorthand commit id convention
                    self.euc[..7.min(self.euc.len())].to_string()
                } else {
                    self.identifier.clone()
                }),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("r")),
                    vec![self.euc.clone(), "euc".to_string()],
                ),
                Tag::from_standardized(TagStandard::Name(self.name.clone())),
                Tag::from_standardized(TagStandard::Description(self.description.clone())),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("clone")),
                    self.clone_urls.clone(),
                ),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("web")),
                    self.web.clone(),
                ),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("relays")),
                    self.relays
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<String>>(),
                ),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("maintainers")),
                    self.maintainers
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<String>>(),
                ),
                Tag::custom(
                    TagKind::Custom(std::borrow::Cow::Borrowed("alt")),
                    vec![format!("git repository: {}", self.name)],
                ),
            ])
            .build(self.author)
    }

    /// `30617:<pubkey>:<identifier>` for this announcement.
    pub fn addr(&self) -> String {
        make_repo_addr(&self.author, &self.identifier)
    }

    /// Addresses under which replaceable copies of this announcement may
    /// live: one per maintainer.
    pub fn maintainer_addrs(&self) -> Vec<String> {
        let mut addrs = vec![self.addr()];
        for m in &self.maintainers {
            let addr = make_repo_addr(m, &self.identifier);
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}

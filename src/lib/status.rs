use std::collections::HashSet;

use nostr::{Event, EventId, Kind, PublicKey};

/// Effective lifecycle state of an issue or patch set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Open,
    Draft,
    Closed,
    Applied,
}

impl Status {
    pub fn from_kind(kind: Kind) -> Option<Self> {
        if kind.eq(&Kind::GitStatusOpen) {
            Some(Status::Open)
        } else if kind.eq(&Kind::GitStatusApplied) {
            Some(Status::Applied)
        } else if kind.eq(&Kind::GitStatusClosed) {
            Some(Status::Closed)
        } else if kind.eq(&Kind::GitStatusDraft) {
            Some(Status::Draft)
        } else {
            None
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Status::Open => Kind::GitStatusOpen,
            Status::Applied => Kind::GitStatusApplied,
            Status::Closed => Kind::GitStatusClosed,
            Status::Draft => Kind::GitStatusDraft,
        }
    }

    /// applied/resolved > closed > draft > open
    fn priority(&self) -> u8 {
        match self {
            Status::Applied => 3,
            Status::Closed => 2,
            Status::Draft => 1,
            Status::Open => 0,
        }
    }
}

/// Who published the deciding status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusRole {
    Other,
    RootAuthor,
    Maintainer,
}

/// Why the resolver picked the final status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReason {
    pub role: StatusRole,
    pub status: Status,
    pub event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResolution {
    pub final_status: Status,
    /// `None` when no status event decided the outcome (defaulted open).
    pub reason: Option<StatusReason>,
}

fn role_of(
    author: &PublicKey,
    root_author: &PublicKey,
    maintainers: &HashSet<PublicKey>,
) -> StatusRole {
    if maintainers.contains(author) {
        StatusRole::Maintainer
    } else if author == root_author {
        StatusRole::RootAuthor
    } else {
        StatusRole::Other
    }
}

/// Picks the effective status from competing status events.
///
/// Candidates are ranked by `(role, kind priority, created_at, id)` and
/// the greatest tuple wins: a maintainer's word beats the root author's,
/// which beats everyone else's, and only within one role do the status
/// semantics and recency matter. Non-status kinds are ignored.
pub fn resolve_status(
    statuses: &[Event],
    root_author: &PublicKey,
    maintainers: &HashSet<PublicKey>,
) -> StatusResolution {
    let mut best: Option<(StatusRole, u8, nostr::Timestamp, String, &Event, Status)> = None;
    for event in statuses {
        let Some(status) = Status::from_kind(event.kind) else {
            continue;
        };
        let role = role_of(&event.pubkey, root_author, maintainers);
        let rank = (
            role,
            status.priority(),
            event.created_at,
            event.id.to_hex(),
            event,
            status,
        );
        let replace = match &best {
            Some((r, p, t, id, _, _)) => (rank.0, rank.1, rank.2, &rank.3) > (*r, *p, *t, id),
            None => true,
        };
        if replace {
            best = Some(rank);
        }
    }
    match best {
        Some((role, _, _, _, event, status)) => StatusResolution {
            final_status: status,
            reason: Some(StatusReason {
                role,
                status,
                event_id: event.id,
            }),
        },
        None => StatusResolution {
            final_status: Status::Open,
            reason: None,
        },
    }
}

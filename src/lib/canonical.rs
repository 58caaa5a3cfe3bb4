use std::fmt;

use nostr::{PublicKey, RelayUrl};

use crate::error::{CoreError, Result};

/// Normalizes a repository key to `owner/name`.
///
/// Accepts `owner/name` or `owner:name`. Each segment is sanitized: path
/// separators and whitespace become `-`, as does anything outside
/// `[A-Za-z0-9._-]`. A bare 64-hex value is rejected because it is almost
/// certainly an event id pasted where a repo key was expected.
pub fn normalize_repo_key(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid_input("empty repository key"));
    }
    if is_64_hex(trimmed) {
        return Err(CoreError::invalid_input(format!(
            "'{trimmed}' looks like an event id, not an owner/name repository key"
        )));
    }
    let (owner, name) = match trimmed.find(['/', ':']) {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => {
            return Err(CoreError::invalid_input(format!(
                "'{trimmed}' is missing an owner/name separator"
            )));
        }
    };
    let owner = sanitize_key_segment(owner);
    let name = sanitize_key_segment(name);
    if owner.is_empty() || name.is_empty() {
        return Err(CoreError::invalid_input(format!(
            "'{trimmed}' is missing the owner or name segment"
        )));
    }
    Ok(format!("{owner}/{name}"))
}

fn sanitize_key_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_whitespace() => '-',
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

fn is_64_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalizes a relay URL to canonical `ws(s)://host[:port][/path][?q]`.
///
/// `.onion` hosts get `ws://`, everything else `wss://`. The host is
/// lowercased, default ports (80/443) are stripped, duplicate slashes in
/// the path collapse, the fragment is dropped, userinfo and query survive.
pub fn normalize_relay_url(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid_input("empty relay url"));
    }
    let rest = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let rest = rest.split('#').next().unwrap_or("");
    let (rest, query) = match rest.split_once('?') {
        Some((before, q)) => (before, Some(q)),
        None => (rest, None),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let (userinfo, host_port) = match authority.rfind('@') {
        Some(idx) => (Some(&authority[..idx]), &authority[idx + 1..]),
        None => (None, authority),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            (h, Some(p))
        }
        _ => (host_port, None),
    };
    if host.is_empty() {
        return Err(CoreError::invalid_input(format!(
            "relay url '{trimmed}' has no host"
        )));
    }
    let host = host.to_ascii_lowercase();
    let scheme = if host.ends_with(".onion") { "ws" } else { "wss" };

    let mut out = String::new();
    out.push_str(scheme);
    out.push_str("://");
    if let Some(userinfo) = userinfo {
        out.push_str(userinfo);
        out.push('@');
    }
    out.push_str(&host);
    if let Some(port) = port {
        if port != "80" && port != "443" {
            out.push(':');
            out.push_str(port);
        }
    }
    let mut collapsed = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !last_was_slash {
                collapsed.push(c);
            }
            last_was_slash = true;
        } else {
            collapsed.push(c);
            last_was_slash = false;
        }
    }
    let collapsed = collapsed.trim_end_matches('/');
    out.push_str(collapsed);
    if let Some(query) = query {
        if !query.is_empty() {
            out.push('?');
            out.push_str(query);
        }
    }
    RelayUrl::parse(&out)
        .map_err(|e| CoreError::invalid_input(format!("'{trimmed}' is not a relay url: {e}")))?;
    Ok(out)
}

pub const REPO_ANNOUNCEMENT_KIND_NUMBER: u16 = 30617;

/// Addressable reference to a repository announcement:
/// `30617:<pubkey-hex>:<identifier>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoAddr {
    pub public_key: PublicKey,
    pub identifier: String,
}

impl fmt::Display for RepoAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            REPO_ANNOUNCEMENT_KIND_NUMBER,
            self.public_key.to_hex(),
            self.identifier
        )
    }
}

pub fn make_repo_addr(public_key: &PublicKey, identifier: &str) -> String {
    RepoAddr {
        public_key: *public_key,
        identifier: identifier.to_string(),
    }
    .to_string()
}

pub fn parse_repo_addr(addr: &str) -> Result<RepoAddr> {
    let mut parts = addr.splitn(3, ':');
    let kind = parts
        .next()
        .ok_or_else(|| CoreError::invalid_input("empty repo address"))?;
    let pubkey = parts.next().ok_or_else(|| {
        CoreError::invalid_input(format!("repo address '{addr}' is missing a pubkey segment"))
    })?;
    let identifier = parts.next().ok_or_else(|| {
        CoreError::invalid_input(format!(
            "repo address '{addr}' is missing an identifier segment"
        ))
    })?;
    if kind != REPO_ANNOUNCEMENT_KIND_NUMBER.to_string() {
        return Err(CoreError::invalid_input(format!(
            "repo address '{addr}' does not reference a repository announcement kind"
        )));
    }
    if !is_64_hex(pubkey) {
        return Err(CoreError::invalid_input(format!(
            "repo address '{addr}' pubkey segment is not 64-hex"
        )));
    }
    let public_key = PublicKey::from_hex(pubkey).map_err(|e| {
        CoreError::invalid_input(format!("repo address '{addr}' pubkey is invalid: {e}"))
    })?;
    Ok(RepoAddr {
        public_key,
        identifier: identifier.to_string(),
    })
}

/// A URL pinning a region of a file at a fixed ref or commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permalink {
    /// Hostname of the server the link points at.
    pub platform: String,
    pub owner: String,
    pub repo: String,
    pub reference: String,
    pub path: Option<String>,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub is_diff: bool,
    pub diff_hash: Option<String>,
}

/// Parses web permalinks in the three common hosting shapes:
/// `/owner/repo/blob/<ref>/<path>#L10-L20`, `/owner/repo/commit/<sha>#diff-<hash>`
/// and Gitea's `/owner/repo/src/commit/<sha>/<path>#L10-L20`.
pub fn parse_permalink(url: &str) -> Option<Permalink> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))?;
    let (rest, fragment) = match rest.split_once('#') {
        Some((r, f)) => (r, Some(f)),
        None => (rest, None),
    };
    let rest = rest.split('?').next().unwrap_or(rest);
    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let host = segments.next()?;
    let owner = segments.next()?;
    let repo = segments.next()?.trim_end_matches(".git");
    let style = segments.next()?;

    let (reference, path, is_diff, diff_hash, lines) = match style {
        "blob" => {
            let reference = segments.next()?;
            let path: Vec<&str> = segments.collect();
            if path.is_empty() {
                return None;
            }
            (
                reference.to_string(),
                Some(path.join("/")),
                false,
                None,
                fragment.and_then(parse_line_fragment),
            )
        }
        "commit" => {
            let reference = segments.next()?;
            let (diff_hash, lines) = match fragment {
                Some(frag) => parse_diff_fragment(frag)?,
                None => (None, None),
            };
            (reference.to_string(), None, true, diff_hash, lines)
        }
        "src" => {
            // Gitea pins files under src/commit/<sha>/<path>.
            if segments.next()? != "commit" {
                return None;
            }
            let reference = segments.next()?;
            let path: Vec<&str> = segments.collect();
            if path.is_empty() {
                return None;
            }
            (
                reference.to_string(),
                Some(path.join("/")),
                false,
                None,
                fragment.and_then(parse_line_fragment),
            )
        }
        _ => return None,
    };

    let (start_line, end_line) = lines.unwrap_or((None, None));
    Some(Permalink {
        platform: host.to_ascii_lowercase(),
        owner: owner.to_string(),
        repo: repo.to_string(),
        reference,
        path,
        start_line,
        end_line,
        is_diff,
        diff_hash,
    })
}

type LineRange = (Option<u32>, Option<u32>);

/// `L10` or `L10-L20`.
fn parse_line_fragment(fragment: &str) -> Option<LineRange> {
    let fragment = fragment.strip_prefix('L')?;
    match fragment.split_once("-L") {
        Some((start, end)) => Some((start.parse().ok(), end.parse().ok())),
        None => Some((fragment.parse().ok(), None)),
    }
}

/// `diff-<hash>` with an optional `L10`/`R10` style line suffix.
fn parse_diff_fragment(fragment: &str) -> Option<(Option<String>, Option<LineRange>)> {
    let rest = fragment.strip_prefix("diff-")?;
    let hash: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    if hash.is_empty() {
        return None;
    }
    let suffix = &rest[hash.len()..];
    let lines = suffix
        .strip_prefix('L')
        .or_else(|| suffix.strip_prefix('R'))
        .map(|s| match s.split_once(['-']) {
            Some((start, end)) => {
                let end = end.trim_start_matches(['L', 'R']);
                (start.parse().ok(), end.parse().ok())
            }
            None => (s.parse().ok(), None),
        });
    Some((Some(hash), lines))
}

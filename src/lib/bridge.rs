use std::{path::Path, sync::Arc, time::Duration};

use nostr::{PublicKey, ToBech32, signer::NostrSigner};
use serde_json::Value;

use crate::{
    cache::ObjectCache,
    cancel::CancelToken,
    canonical::normalize_relay_url,
    client::{BlobStore, BlossomSummary, EventIO, PublishOutcome, sign_event_template},
    error::{CoreError, ErrorCode, ErrorContext, Result, with_timeout},
    git::GitProvider,
    repo_state::state_event_template,
};

const NIP11_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT_MS: u64 = 30_000;

/// GRASP capability profile a relay advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraspLevel {
    /// Full git hosting: refs and objects, fetch and push.
    Grasp01,
    /// Archive-only mirror.
    Grasp05,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginSource {
    /// Declared in the relay's NIP-11 document.
    Nip11,
    /// Derived from observed relay layouts.
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpOrigin {
    pub url: String,
    pub source: OriginSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraspCapability {
    pub relay_url: String,
    pub level: GraspLevel,
    pub smart_http: bool,
    pub http_origins: Vec<HttpOrigin>,
}

/// `wss://relay.host/path` → `https://relay.host/path` (and ws → http).
pub fn relay_http_origin(relay_url: &str) -> Result<String> {
    let normalized = normalize_relay_url(relay_url)?;
    if let Some(rest) = normalized.strip_prefix("wss://") {
        Ok(format!("https://{rest}"))
    } else if let Some(rest) = normalized.strip_prefix("ws://") {
        Ok(format!("http://{rest}"))
    } else {
        Err(CoreError::invalid_input(format!(
            "'{relay_url}' is not a relay url"
        )))
    }
}

fn string_entries(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Pure classification of a NIP-11 document against the relay's HTTP
/// origin. Declared origins come first; the `/git` suffix guess is
/// appended last and marked heuristic so strict callers can drop it.
pub fn classify_nip11(relay_url: &str, origin: &str, doc: &Value) -> GraspCapability {
    let grasps: Vec<String> = string_entries(doc.get("supported_grasps").unwrap_or(&Value::Null))
        .iter()
        .map(|s| s.to_ascii_uppercase())
        .collect();
    let level = if grasps.iter().any(|g| g.ends_with("01")) {
        GraspLevel::Grasp01
    } else if grasps.iter().any(|g| g.ends_with("05")) {
        GraspLevel::Grasp05
    } else {
        GraspLevel::Unsupported
    };

    let mut smart_http = false;
    let mut http_origins: Vec<HttpOrigin> = Vec::new();
    for field in ["smart_http", "http"] {
        match doc.get(field) {
            Some(Value::Bool(true)) => smart_http = true,
            Some(value) => {
                for url in string_entries(value) {
                    smart_http = true;
                    if !http_origins.iter().any(|o| o.url == url) {
                        http_origins.push(HttpOrigin {
                            url,
                            source: OriginSource::Nip11,
                        });
                    }
                }
            }
            None => {}
        }
    }
    for guess in [origin.to_string(), format!("{origin}/git")] {
        if !http_origins.iter().any(|o| o.url == guess) {
            http_origins.push(HttpOrigin {
                url: guess,
                source: OriginSource::Heuristic,
            });
        }
    }

    GraspCapability {
        relay_url: relay_url.to_string(),
        level,
        smart_http,
        http_origins,
    }
}

/// Fetches and classifies a relay's NIP-11 document
/// (`Accept: application/nostr+json` against the HTTP origin).
pub async fn detect_grasp_capability(
    relay_url: &str,
    cors_proxy: Option<&str>,
) -> Result<GraspCapability> {
    let origin = relay_http_origin(relay_url)?;
    let probe_url = match cors_proxy {
        Some(prefix) => format!("{prefix}{origin}"),
        None => origin.clone(),
    };
    let response = reqwest::Client::new()
        .get(&probe_url)
        .header(reqwest::header::ACCEPT, "application/nostr+json")
        .timeout(NIP11_TIMEOUT)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(CoreError::new(
            ErrorCode::RelayError,
            format!("relay information request returned {}", response.status()),
        )
        .with_context(
            crate::error::ErrorContext::for_operation("detect-grasp-capability")
                .with_relay(relay_url)
                .with_status_code(response.status().as_u16()),
        ));
    }
    let doc: Value = response.json().await?;
    Ok(classify_nip11(relay_url, &origin, &doc))
}

/// Probes several relays concurrently. Unreachable relays yield errors
/// in place, so one dead relay never hides the others' capabilities.
pub async fn detect_grasp_capabilities(
    relay_urls: &[String],
    cors_proxy: Option<&str>,
) -> Vec<Result<GraspCapability>> {
    futures::future::join_all(
        relay_urls
            .iter()
            .map(|url| detect_grasp_capability(url, cors_proxy)),
    )
    .await
}

/// Clone URL for a repository hosted on a GRASP server:
/// `<origin>/<npub>/<identifier>.git`.
pub fn grasp_clone_url(origin: &str, public_key: &PublicKey, identifier: &str) -> Result<String> {
    let npub = public_key
        .to_bech32()
        .map_err(|e| CoreError::invalid_input(format!("cannot encode public key: {e}")))?;
    Ok(format!(
        "{}/{npub}/{}.git",
        origin.trim_end_matches('/'),
        urlencoding::encode(identifier)
    ))
}

/// True when a clone target is relay-shaped and should go through the
/// relay-aware path.
pub fn is_relay_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://") || url.starts_with("nostr://")
}

/// What the bridge did after a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePublishReport {
    pub state_event: nostr::Event,
    pub publish: PublishOutcome,
    pub blossom: Option<BlossomSummary>,
}

/// Publishes the repository's authoritative state after a push and
/// mirrors newly-reachable objects when a blob store is configured.
///
/// Sequencing is strict: the push already happened, the state event goes
/// out next, the mirror runs last. A mirror failure never retries the
/// push; it is reported in the summary.
pub async fn publish_state_after_push(
    io: &dyn EventIO,
    signer: &Arc<dyn NostrSigner>,
    provider: &dyn GitProvider,
    dir: &Path,
    identifier: &str,
    include_tags: bool,
    blob_store: Option<&dyn BlobStore>,
    pushed_objects: &[String],
    cancel: &CancelToken,
    cache: &ObjectCache,
) -> Result<StatePublishReport> {
    cancel.check("publish-state")?;

    let refs: Vec<(String, String)> = provider
        .list_refs(dir, cache)
        .await?
        .into_iter()
        .filter(|(name, _)| {
            name == "HEAD"
                || name.starts_with("refs/heads/")
                || (include_tags && name.starts_with("refs/tags/"))
        })
        .collect();

    let author = signer
        .get_public_key()
        .await
        .map_err(|e| CoreError::new(ErrorCode::Unknown, format!("signer has no pubkey: {e}")))?;
    let template = state_event_template(author, identifier, &refs);
    let state_event = sign_event_template(template, signer).await?;

    let publish = cancel
        .guard(
            "publish-state",
            with_timeout(
                io.publish_event(state_event.clone()),
                PUBLISH_TIMEOUT_MS,
                "publish-state",
                ErrorContext::for_operation("publish-state"),
            ),
        )
        .await?;

    let blossom = match blob_store {
        Some(store) => {
            cancel.check("mirror-blobs")?;
            match store.push_to_blossom(dir, pushed_objects).await {
                Ok(summary) => Some(summary),
                Err(err) => {
                    tracing::warn!(code = %err.code, "blob mirror failed: {err}");
                    Some(BlossomSummary {
                        total: pushed_objects.len(),
                        uploaded: 0,
                        skipped: 0,
                        failures: pushed_objects.len(),
                    })
                }
            }
        }
        None => None,
    };

    Ok(StatePublishReport {
        state_event,
        publish,
        blossom,
    })
}

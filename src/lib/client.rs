use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use nostr::{Event, Filter, UnsignedEvent, signer::NostrSigner};

use crate::error::{CoreError, ErrorCode, Result};

/// Result of publishing one event through the host's relay pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub ok: bool,
    /// Relays that accepted the event.
    pub relays: Vec<String>,
    pub error: Option<String>,
}

/// Relay access contract. The host application owns subscriptions and
/// transport; the core only fetches filtered event sets and publishes
/// signed events. Both operations are suspension points and may be
/// cancelled by dropping the future.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventIO: Send + Sync {
    async fn fetch_events(&self, filters: Vec<Filter>) -> Result<Vec<Event>>;
    async fn publish_event(&self, event: Event) -> Result<PublishOutcome>;
}

/// Outcome of mirroring repository objects into a blob store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlossomSummary {
    pub total: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failures: usize,
}

/// Optional large-object storage the bridge mirrors freshly-reachable
/// objects into after a push.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn push_to_blossom(
        &self,
        repo_dir: &std::path::Path,
        object_ids: &[String],
    ) -> Result<BlossomSummary>;
}

/// Signs an unsigned template with the host's signer. The core never
/// holds private keys.
pub async fn sign_event_template(
    template: UnsignedEvent,
    signer: &Arc<dyn NostrSigner>,
) -> Result<Event> {
    signer.sign_event(template).await.map_err(|e| {
        CoreError::new(ErrorCode::Unknown, format!("signer rejected event: {e}"))
            .with_hint("the host signer refused to sign; check its connection and permissions")
    })
}

#[cfg(test)]
mod tests {
    use nostr::Keys;
    use test_utils::TEST_KEY_1_KEYS;

    use super::*;
    use crate::repo_state::state_event_template;

    #[tokio::test]
    async fn sign_event_template_produces_a_verifiable_event() {
        let keys: Keys = TEST_KEY_1_KEYS.clone();
        let signer: Arc<dyn NostrSigner> = Arc::new(keys);
        let template = state_event_template(
            TEST_KEY_1_KEYS.public_key(),
            "example",
            &[(
                "refs/heads/main".to_string(),
                "431b84edc0d2fa118d63faa3c2db9c73d630a5ae".to_string(),
            )],
        );
        let event = sign_event_template(template, &signer).await.unwrap();
        assert!(event.verify().is_ok());
        assert_eq!(event.pubkey, TEST_KEY_1_KEYS.public_key());
    }

    #[tokio::test]
    async fn mock_event_io_round_trip() {
        let mut io = MockEventIO::new();
        io.expect_fetch_events().returning(|_| Ok(vec![]));
        io.expect_publish_event().returning(|_| {
            Ok(PublishOutcome {
                ok: true,
                relays: vec!["wss://relay.example".to_string()],
                error: None,
            })
        });
        let events = io.fetch_events(vec![Filter::new()]).await.unwrap();
        assert!(events.is_empty());
    }
}

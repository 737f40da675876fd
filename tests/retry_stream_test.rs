//! Retry behavior through the full agent loop: transient provider errors
//! back off and retry; the run log records each attempt.

mod common;

use async_trait::async_trait;
use common::{ScriptedClient, text_turn};
use relay_agent::prelude::*;
use relay_agent::provider::{EventStream, ProviderRequest};
use relay_agent::storage::memory::MemoryRunLogStore;
use relay_agent::storage::{RunLogEventType, RunLogStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails the first N stream calls with a scripted error, then delegates.
struct FlakyClient {
    inner: ScriptedClient,
    failures_left: AtomicUsize,
    error: fn() -> Error,
}

#[async_trait]
impl ProviderClient for FlakyClient {
    async fn stream(&self, request: &ProviderRequest) -> Result<EventStream> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err((self.error)());
        }
        self.inner.stream(request).await
    }

    async fn count_tokens(&self, _request: &ProviderRequest) -> Result<Option<u64>> {
        Ok(None)
    }
}

fn config(base_delay: f64, max_retries: u32) -> AgentConfig {
    AgentConfig::builder()
        .model("claude-sonnet-4-5")
        .base_delay(base_delay)
        .max_retries(max_retries)
        .build()
        .unwrap()
}

#[tokio::test]
async fn transient_error_retries_and_succeeds() {
    let run_log_store: Arc<dyn RunLogStore> = Arc::new(MemoryRunLogStore::new());
    let client = Arc::new(FlakyClient {
        inner: ScriptedClient::new(vec![text_turn("made it", StopReason::EndTurn)]),
        failures_left: AtomicUsize::new(1),
        error: || Error::rate_limited("429"),
    });

    let mut agent = Agent::builder()
        .config(config(0.01, 3))
        .client(client)
        .run_log_store(run_log_store.clone())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    let outcome = agent.run("try hard", tx).await.unwrap();

    assert_eq!(outcome.stop_reason, "end_turn");
    assert_eq!(outcome.final_text.as_deref(), Some("made it"));

    // One retry event with the kind and a sleep inside the jitter window.
    let events = run_log_store
        .load(agent.agent_uuid(), &outcome.run_id)
        .await
        .unwrap();
    let retries: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == RunLogEventType::Retry)
        .collect();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].error_kind.as_deref(), Some("rate_limited"));
    let delay = retries[0].delay_seconds.unwrap();
    assert!((0.01..=1.01).contains(&delay), "delay was {delay}");
}

#[tokio::test]
async fn client_errors_fail_fast_without_retry() {
    let run_log_store: Arc<dyn RunLogStore> = Arc::new(MemoryRunLogStore::new());
    let client = Arc::new(FlakyClient {
        inner: ScriptedClient::new(vec![text_turn("unreachable", StopReason::EndTurn)]),
        failures_left: AtomicUsize::new(10),
        error: || Error::BadRequest("malformed payload".into()),
    });

    let mut agent = Agent::builder()
        .config(config(0.01, 5))
        .client(client)
        .run_log_store(run_log_store.clone())
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    let err = agent.run("go", tx).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
    assert_eq!(agent.state(), AgentState::Idle);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let client = Arc::new(FlakyClient {
        inner: ScriptedClient::new(vec![]),
        failures_left: AtomicUsize::new(10),
        error: || Error::server("boom"),
    });

    let mut agent = Agent::builder()
        .config(config(0.01, 2))
        .client(client)
        .build()
        .unwrap();
    agent.initialize().await.unwrap();

    let (tx, _rx) = output_channel();
    let err = agent.run("go", tx).await.unwrap_err();
    assert!(matches!(err, Error::ServerError(_)));
    // Ready for another run on the same agent.
    assert_eq!(agent.state(), AgentState::Idle);
}

//! Retrying stream driver: exponential backoff around a whole stream.
//!
//! Streaming calls fail mid-flight; resuming a half-delivered stream is not
//! part of the provider contract, so the driver retries the **entire**
//! stream. Transient errors (rate limits, timeouts, connection drops, 5xx,
//! unclassified) back off and retry; client errors (400/401/403/404/422)
//! fail immediately.
//!
//! The delay before attempt `n` (0-based) is
//! `base_delay · 2^n + random(0, 1)` seconds. For `base_delay = 5`:
//! attempt 1 waits ~5s, attempt 2 ~10s, attempt 3 ~20s, and so on.
//!
//! The driver shares one output channel across attempts: chunks a failed
//! attempt already delivered are replayed by the next attempt. Consumers
//! that care can buffer per `meta_init` boundary; the alternative
//! (buffering inside the driver and flushing on success) trades
//! first-token latency and memory for replay-free output, and was rejected
//! here.

use crate::config::FormatterKind;
use crate::error::Result;
use crate::logging::RunScope;
use crate::provider::{ProviderClient, ProviderRequest};
use crate::storage::RunLogEvent;
use crate::streaming::{OutputSender, format_stream};
use crate::types::ProviderMessage;
use std::time::Duration;
use tokio::time::sleep;

/// Retry behavior for the streaming driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (≥ 1)
    pub max_retries: u32,
    /// Base delay in seconds for exponential backoff
    pub base_delay: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            base_delay: crate::config::DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay: base_delay.max(0.0),
        }
    }

    /// Backoff before retrying after failed attempt `attempt` (0-based):
    /// `base_delay · 2^attempt` plus up to one second of jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2f64.powi(attempt as i32);
        let jitter: f64 = rand::random::<f64>();
        Duration::from_secs_f64(backoff + jitter)
    }

    /// Upper bound on total sleep across a full retry cycle, in seconds.
    pub fn max_total_delay(&self) -> f64 {
        (0..self.max_retries.saturating_sub(1))
            .map(|attempt| self.base_delay * 2f64.powi(attempt as i32) + 1.0)
            .sum()
    }
}

/// Run one streaming request through the formatter with retry.
///
/// On success, returns the final assembled message. Each retry appends a
/// [`RunLogEvent::retry`] line carrying the attempt number, error kind, and
/// sleep duration. Non-retryable errors and exhausted budgets surface the
/// last error to the caller.
pub async fn stream_with_backoff(
    client: &dyn ProviderClient,
    request: &ProviderRequest,
    formatter: FormatterKind,
    tx: &OutputSender,
    policy: &RetryPolicy,
    scope: &RunScope,
    run_log: &mut Vec<RunLogEvent>,
) -> Result<ProviderMessage> {
    let mut attempt = 0;
    loop {
        log::info!(
            "{scope} provider stream attempt {}/{}",
            attempt + 1,
            policy.max_retries
        );

        let result = match client.stream(request).await {
            Ok(events) => format_stream(formatter, events, tx).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(message) => {
                log::info!(
                    "{scope} provider stream completed, stop_reason={:?}",
                    message.stop_reason
                );
                return Ok(message);
            }
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                let delay_secs = delay.as_secs_f64();
                log::warn!(
                    "{scope} retryable error ({}), attempt {}/{}, sleeping {delay_secs:.2}s",
                    e.kind().as_str(),
                    attempt + 1,
                    policy.max_retries
                );
                run_log.push(RunLogEvent::retry(
                    Some(scope.step),
                    attempt + 1,
                    e.kind().as_str(),
                    delay_secs,
                ));
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    log::error!(
                        "{scope} all {} attempts failed ({})",
                        policy.max_retries,
                        e.kind().as_str()
                    );
                } else {
                    log::error!("{scope} non-retryable error ({})", e.kind().as_str());
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::provider::{
        Delta, EventStream, MessageDeltaBody, MessageStart, RawContentBlock, StreamEvent,
    };
    use crate::storage::RunLogEventType;
    use crate::streaming::output_channel;
    use crate::types::{StopReason, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that fails with scripted errors before succeeding.
    struct FlakyClient {
        failures: Mutex<Vec<Error>>,
        calls: AtomicUsize,
    }

    impl FlakyClient {
        fn new(failures: Vec<Error>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            }
        }

        fn success_events() -> Vec<crate::error::Result<StreamEvent>> {
            vec![
                Ok(StreamEvent::MessageStart {
                    message: MessageStart::default(),
                }),
                Ok(StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: RawContentBlock {
                        block_type: "text".into(),
                        ..Default::default()
                    },
                }),
                Ok(StreamEvent::ContentBlockDelta {
                    index: 0,
                    delta: Delta::TextDelta { text: "ok".into() },
                }),
                Ok(StreamEvent::ContentBlockStop { index: 0 }),
                Ok(StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(StopReason::EndTurn),
                        stop_sequence: None,
                    },
                    usage: Usage::default(),
                }),
                Ok(StreamEvent::MessageStop),
            ]
        }
    }

    #[async_trait]
    impl ProviderClient for FlakyClient {
        async fn stream(&self, _request: &ProviderRequest) -> crate::error::Result<EventStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next_failure = self.failures.lock().unwrap().pop();
            match next_failure {
                Some(err) => Err(err),
                None => Ok(Box::pin(futures::stream::iter(Self::success_events()))),
            }
        }

        async fn count_tokens(
            &self,
            _request: &ProviderRequest,
        ) -> crate::error::Result<Option<u64>> {
            Ok(None)
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 0.01)
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let client = FlakyClient::new(vec![Error::rate_limited("slow down")]);
        let (tx, _rx) = output_channel();
        let scope = RunScope::new("a", "r").at_step(1);
        let mut run_log = Vec::new();

        let message = stream_with_backoff(
            &client,
            &ProviderRequest::default(),
            FormatterKind::Xml,
            &tx,
            &fast_policy(3),
            &scope,
            &mut run_log,
        )
        .await
        .unwrap();

        assert_eq!(message.text(), "ok");
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);

        // Exactly one retry event with the error kind and a bounded sleep.
        assert_eq!(run_log.len(), 1);
        assert_eq!(run_log[0].event_type, RunLogEventType::Retry);
        assert_eq!(run_log[0].error_kind.as_deref(), Some("rate_limited"));
        let delay = run_log[0].delay_seconds.unwrap();
        assert!((0.01..=1.01).contains(&delay), "delay was {delay}");
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let client = FlakyClient::new(vec![Error::BadRequest("malformed".into())]);
        let (tx, _rx) = output_channel();
        let scope = RunScope::new("a", "r");
        let mut run_log = Vec::new();

        let result = stream_with_backoff(
            &client,
            &ProviderRequest::default(),
            FormatterKind::Xml,
            &tx,
            &fast_policy(5),
            &scope,
            &mut run_log,
        )
        .await;

        assert!(matches!(result, Err(Error::BadRequest(_))));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(run_log.is_empty());
    }

    #[tokio::test]
    async fn test_exhausts_retry_budget() {
        let client = FlakyClient::new(vec![
            Error::server("boom"),
            Error::server("boom"),
            Error::server("boom"),
        ]);
        let (tx, _rx) = output_channel();
        let scope = RunScope::new("a", "r");
        let mut run_log = Vec::new();

        let result = stream_with_backoff(
            &client,
            &ProviderRequest::default(),
            FormatterKind::Xml,
            &tx,
            &fast_policy(2),
            &scope,
            &mut run_log,
        )
        .await;

        assert!(matches!(result, Err(Error::ServerError(_))));
        // Two attempts total, one retry event.
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run_log.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_errors_are_retried() {
        let client = FlakyClient::new(vec![Error::unknown("???")]);
        let (tx, _rx) = output_channel();
        let scope = RunScope::new("a", "r");
        let mut run_log = Vec::new();

        let message = stream_with_backoff(
            &client,
            &ProviderRequest::default(),
            FormatterKind::Xml,
            &tx,
            &fast_policy(2),
            &scope,
            &mut run_log,
        )
        .await
        .unwrap();

        assert_eq!(message.text(), "ok");
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, 1.0);
        // Jitter adds at most one second on top of the deterministic base.
        let d0 = policy.delay_for_attempt(0).as_secs_f64();
        let d1 = policy.delay_for_attempt(1).as_secs_f64();
        let d2 = policy.delay_for_attempt(2).as_secs_f64();
        assert!((1.0..2.0).contains(&d0), "d0 was {d0}");
        assert!((2.0..3.0).contains(&d1), "d1 was {d1}");
        assert!((4.0..5.0).contains(&d2), "d2 was {d2}");
    }

    #[test]
    fn test_max_total_delay_bound() {
        let policy = RetryPolicy::new(3, 5.0);
        // 5·1 + 1 + 5·2 + 1 = 17
        assert_eq!(policy.max_total_delay(), 17.0);

        let single = RetryPolicy::new(1, 5.0);
        assert_eq!(single.max_total_delay(), 0.0);
    }

    #[test]
    fn test_policy_clamps_degenerate_values() {
        let policy = RetryPolicy::new(0, -3.0);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.base_delay, 0.0);
    }
}

//! Explicit retry policy for the split-mode conversation loop,
//! replacing the "try/catch loop with a sleep" pattern spec.md §9
//! calls out for re-architecture. Grounded on the teacher's
//! `agent/failover.rs` (`classify_error`/`should_failover` deciding
//! whether a failure is worth a fresh attempt) generalized from
//! "fail over to the next model in the chain" to "retry the same
//! endpoint with backoff", since this pipeline has no failover chain —
//! only one brain/TTS/STT endpoint each.

use crate::error::{AgentError, AgentErrorKind};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    End,
}

/// `{maxAttempts, backoff, classify(err)->{retry|end}}` per spec.md §9.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub classify: fn(&AgentError) -> RetryDecision,
}

impl RetryPolicy {
    /// Transient network/protocol hiccups (connect refused, stream
    /// dropped mid-response) are worth a couple of quick retries;
    /// `ProtocolError` means the endpoint answered but the shape was
    /// wrong, which a retry won't fix.
    pub fn conversation_loop_default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            classify: classify_transient_network_errors,
        }
    }

    /// Run `attempt` until it succeeds, `classify` says `End`, or
    /// `max_attempts` is exhausted, sleeping `backoff` between retries.
    pub async fn run<T, Fut>(&self, mut attempt: impl FnMut() -> Fut) -> Result<T, AgentError>
    where
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let mut last_err = None;
        for try_number in 0..self.max_attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let decision = (self.classify)(&e);
                    let attempts_remain = try_number + 1 < self.max_attempts;
                    if decision == RetryDecision::End || !attempts_remain {
                        return Err(e);
                    }
                    tracing::warn!(
                        error = %e,
                        attempt = try_number + 1,
                        "split-brain turn failed, retrying after backoff"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }
}

fn classify_transient_network_errors(err: &AgentError) -> RetryDecision {
    match err.kind {
        AgentErrorKind::ConnectFailed | AgentErrorKind::StreamError => RetryDecision::Retry,
        AgentErrorKind::ProtocolError => RetryDecision::End,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy { max_attempts: 3, backoff: Duration::from_millis(1), classify: classify_transient_network_errors };
        let calls = AtomicUsize::new(0);
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AgentError::new(AgentErrorKind::StreamError, "transient"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn protocol_errors_end_immediately_without_retrying() {
        let policy = RetryPolicy::conversation_loop_default();
        let calls = AtomicUsize::new(0);
        let result: Result<(), AgentError> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::new(AgentErrorKind::ProtocolError, "bad shape")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "ProtocolError must not be retried");
    }

    #[tokio::test]
    async fn exhausting_max_attempts_surfaces_the_last_error() {
        let policy = RetryPolicy { max_attempts: 2, backoff: Duration::from_millis(1), classify: classify_transient_network_errors };
        let calls = AtomicUsize::new(0);
        let result: Result<(), AgentError> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AgentError::new(AgentErrorKind::ConnectFailed, "down")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

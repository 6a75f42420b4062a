//! Bounded retry for layered callers.
//!
//! The core client never retries. Services that call other services wrap it
//! in a [`RetryingClient`], which repeats the whole connect → handshake → call
//! sequence with a fixed backoff and, once out of attempts, fires a
//! [`ShutdownTrigger`] so the calling service stops instead of limping on.

use crate::client::{Call, RpcClient};
use crate::shutdown::{ShutdownReason, ShutdownTrigger};

use hookwire_types::config::{ClientConfig, RetryConfig};
use hookwire_types::error::{RpcError, RpcResult};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// Gave up, either out of attempts or on a non-retryable error.
    Exhausted { last_error: E, attempts: u32 },
}

/// Execute an async operation with fixed-backoff retry.
///
/// `operation` is called once per attempt; `should_retry` decides whether an
/// error is worth another attempt.
pub async fn retry_async<F, Fut, T, E, P>(config: &RetryConfig, mut operation: F, should_retry: P) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded after {} previous failures", attempt - 1);
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt,
                };
            }
            Err(err) => {
                if !should_retry(&err) {
                    debug!(attempt, "error is not retryable, giving up: {}", err);
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt,
                    };
                }
                if attempt >= max {
                    warn!(attempt, max_attempts = max, "all retry attempts exhausted: {}", err);
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt,
                    };
                }
                warn!(
                    attempt,
                    max_attempts = max,
                    delay_ms = config.backoff_ms,
                    "retrying after error: {}",
                    err
                );
                tokio::time::sleep(config.backoff()).await;
            }
        }
    }
}

/// A client that renegotiates and retries on transport-level failures.
pub struct RetryingClient {
    config: ClientConfig,
    retry: RetryConfig,
    shutdown: Option<ShutdownTrigger>,
    session: Mutex<Option<RpcClient>>,
}

impl RetryingClient {
    pub fn new(config: ClientConfig, retry: RetryConfig) -> Self {
        Self {
            config,
            retry,
            shutdown: None,
            session: Mutex::new(None),
        }
    }

    /// Fire `trigger` with a fatal reason when retries run out.
    pub fn with_shutdown(mut self, trigger: ShutdownTrigger) -> Self {
        self.shutdown = Some(trigger);
        self
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Send `call`, retrying per the retry policy.
    pub async fn send(&self, call: Call) -> RpcResult<Value> {
        let this = self;
        let template = &call;
        let outcome = retry_async(
            &self.retry,
            move || this.attempt(template.clone()),
            RpcError::is_retryable,
        )
        .await;
        match outcome {
            RetryOutcome::Success { result, .. } => Ok(result),
            RetryOutcome::Exhausted { last_error, attempts } if last_error.is_retryable() => {
                error!(
                    addr = %self.config.addr,
                    attempts,
                    procedure = call.procedure(),
                    "Giving up on remote service: {}",
                    last_error
                );
                if let Some(trigger) = &self.shutdown {
                    trigger.fire(ShutdownReason::Fatal(format!(
                        "{} unreachable after {attempts} attempts: {last_error}",
                        self.config.addr
                    )));
                }
                Err(RpcError::RetriesExhausted {
                    attempts,
                    last: Box::new(last_error),
                })
            }
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    /// Send `call` and deserialize its payload as `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, call: Call) -> RpcResult<T> {
        let procedure = call.procedure().to_string();
        let value = self.send(call).await?;
        serde_json::from_value(value).map_err(|e| RpcError::UnexpectedPayload(format!("{procedure}(): {e}")))
    }

    async fn attempt(&self, call: Call) -> RpcResult<Value> {
        let client = self.session().await?;
        let result = client.send(call).await;
        if matches!(&result, Err(e) if e.is_retryable()) {
            // Renegotiate on the next attempt.
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        result
    }

    async fn session(&self) -> RpcResult<RpcClient> {
        let cached = self.session.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(client) = cached {
            return Ok(client);
        }
        let client = RpcClient::connect(self.config.clone()).await?;
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = &AtomicU32::new(0);
        let outcome = retry_async(
            &fast_retry(3),
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient")
                } else {
                    Ok(7)
                }
            },
            |_| true,
        )
        .await;
        match outcome {
            RetryOutcome::Success { result, attempts } => {
                assert_eq!(result, 7);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let counter = &AtomicU32::new(0);
        let outcome: RetryOutcome<(), &str> = retry_async(
            &fast_retry(5),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("fatal")
            },
            |_| false,
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_fires_shutdown() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let trigger = ShutdownTrigger::new();
        let client = RetryingClient::new(ClientConfig::new(addr), fast_retry(3)).with_shutdown(trigger.clone());
        let err = client.send(Call::new("check_credentials")).await.unwrap_err();
        match err {
            RpcError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RpcError::Connection { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(trigger.reason().is_some_and(|r| r.is_fatal()));
    }
}

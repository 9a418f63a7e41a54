//! Per-(service, api) isolation compartment.
//!
//! A bulkhead combines a FIFO concurrency semaphore, a time budget and a
//! circuit breaker. Callers that cannot get a permit within a few
//! milliseconds fail fast instead of queueing; calls that outlive the budget
//! are cancelled and reported as timeouts. Every executed call feeds the
//! breaker.
use std::{future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::RuntimeConfig,
    core::breaker::{Admission, CircuitBreaker, CircuitState},
    metrics,
};

/// How long a caller may wait for a permit before being shed.
const PERMIT_WAIT: Duration = Duration::from_millis(5);

/// Compartment-level rejections. The inner upstream error type stays generic;
/// the engine decides what counts as success.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadError {
    #[error("concurrency cap reached")]
    CapacityExceeded { retry_after_ms: u64 },

    #[error("circuit open")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("time budget of {budget_ms}ms exceeded")]
    Timeout { budget_ms: u64 },
}

pub struct Bulkhead {
    key: String,
    semaphore: Arc<Semaphore>,
    budget: Duration,
    breaker: CircuitBreaker,
}

impl Bulkhead {
    pub fn new(key: String, runtime: &RuntimeConfig) -> Self {
        Self {
            key,
            semaphore: Arc::new(Semaphore::new(runtime.concurrency.max(1))),
            budget: Duration::from_millis(runtime.timeout_ms),
            breaker: CircuitBreaker::new(runtime.circuit.clone()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current_state(&self) -> CircuitState {
        self.breaker.current_state()
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }

    /// Run `call` inside the compartment. The closure receives a cancellation
    /// token that fires when the budget expires or the ingress request is
    /// abandoned; implementations must stop work when it triggers.
    ///
    /// Outer `Err` is a compartment rejection; the inner result is the
    /// upstream outcome (`Ok` counts as success toward the breaker).
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Result<T, E>, BulkheadError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.breaker.try_acquire();
        let trial = match admission {
            Admission::Admit => false,
            Admission::AdmitTrial => true,
            Admission::Reject { retry_after_ms } => {
                metrics::increment_rejection(&self.key, "circuit_open");
                return Err(BulkheadError::CircuitOpen { retry_after_ms });
            }
        };

        let permit = match tokio::time::timeout(PERMIT_WAIT, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                if trial {
                    // The probe never ran; keep the circuit open.
                    self.breaker.record(false, true);
                }
                metrics::increment_rejection(&self.key, "capacity");
                return Err(BulkheadError::CapacityExceeded {
                    retry_after_ms: self.breaker.sleep_window().as_millis() as u64,
                });
            }
        };

        let call_token = cancel.child_token();
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.budget, call(call_token.clone())) => result,
            _ = cancel.cancelled() => {
                call_token.cancel();
                drop(permit);
                self.breaker.record(false, trial);
                metrics::increment_rejection(&self.key, "cancelled");
                return Err(BulkheadError::Timeout { budget_ms: self.budget_ms() });
            }
        };
        drop(permit);

        match outcome {
            Ok(result) => {
                self.breaker.record(result.is_ok(), trial);
                Ok(result)
            }
            Err(_) => {
                call_token.cancel();
                self.breaker.record(false, trial);
                metrics::increment_rejection(&self.key, "timeout");
                Err(BulkheadError::Timeout {
                    budget_ms: self.budget_ms(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::models::CircuitConfig;

    fn runtime(concurrency: usize, timeout_ms: u64) -> RuntimeConfig {
        RuntimeConfig {
            timeout_ms,
            concurrency,
            circuit: CircuitConfig {
                error_threshold_percent: 50,
                request_volume: 10,
                sleep_window_ms: 1000,
            },
            fallback_enabled: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_cap_enforced() {
        let bulkhead = Arc::new(Bulkhead::new("payments.orders".into(), &runtime(3, 5000)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let bulkhead = bulkhead.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .execute::<_, (), _, _>(&cancel, |_| async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(BulkheadError::CapacityExceeded { .. }) => rejected += 1,
                Ok(Ok(())) => {}
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(rejected, 2);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn budget_timeout_cancels_call() {
        let bulkhead = Bulkhead::new("payments.orders".into(), &runtime(1, 50));
        let cancel = CancellationToken::new();

        let started = std::time::Instant::now();
        let result = bulkhead
            .execute::<(), (), _, _>(&cancel, |token| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                    _ = token.cancelled() => Err(()),
                }
            })
            .await;

        assert!(matches!(result, Err(BulkheadError::Timeout { budget_ms: 50 })));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn ingress_cancellation_releases_permit() {
        let bulkhead = Arc::new(Bulkhead::new("payments.orders".into(), &runtime(1, 5000)));
        let cancel = CancellationToken::new();

        let task = {
            let bulkhead = bulkhead.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute::<(), (), _, _>(&cancel, |token| async move {
                        token.cancelled().await;
                        Err(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(BulkheadError::Timeout { .. })));

        // Permit must be free again for the next caller.
        let fresh = CancellationToken::new();
        let ok = bulkhead
            .execute::<_, (), _, _>(&fresh, |_| async { Ok(1) })
            .await;
        assert_eq!(ok.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn failures_trip_breaker_and_shed() {
        let bulkhead = Bulkhead::new("payments.orders".into(), &runtime(4, 1000));
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            let _ = bulkhead
                .execute::<(), &str, _, _>(&cancel, |_| async { Err("upstream 500") })
                .await;
        }
        assert_eq!(bulkhead.current_state(), CircuitState::Open);

        let result = bulkhead
            .execute::<(), &str, _, _>(&cancel, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(BulkheadError::CircuitOpen { .. })));
    }
}

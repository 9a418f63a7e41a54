//! Callback dispatcher.
//!
//! Consumes request ids entering CALLBACK_PENDING from a bounded queue and
//! POSTs the stored response to the caller-supplied URI. Deliveries retry
//! with jittered exponential backoff up to `max_attempts`; exhaustion parks
//! the record in CALLBACK_FAILED. Queue overflow loses nothing: records stay
//! CALLBACK_PENDING in persistence and a rescuer task re-enqueues them.
use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};

use crate::{
    core::record::{RecordPatch, RequestRecord, RequestState},
    metrics,
    ports::persistence::PersistenceProvider,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const RESCUE_INTERVAL: Duration = Duration::from_secs(30);

pub struct CallbackDispatcher {
    persistence: Arc<dyn PersistenceProvider>,
    client: reqwest::Client,
    timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    in_flight: scc::HashMap<String, ()>,
}

impl CallbackDispatcher {
    pub fn new(
        persistence: Arc<dyn PersistenceProvider>,
        timeout_ms: u64,
        max_attempts: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            persistence,
            client,
            timeout: Duration::from_millis(timeout_ms),
            max_attempts: max_attempts.max(1),
            backoff_base: INITIAL_BACKOFF,
            in_flight: scc::HashMap::new(),
        }
    }

    /// Shrink the retry backoff (tests).
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Start the consumer loop plus the rescuer. Returns the enqueue handle
    /// and the task handles for shutdown.
    pub fn spawn(
        self: Arc<Self>,
        queue_depth: usize,
        workers: usize,
    ) -> (mpsc::Sender<String>, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, mut rx) = mpsc::channel::<String>(queue_depth.max(1));
        let limit = Arc::new(Semaphore::new(workers.max(1)));

        let consumer = {
            let dispatcher = self.clone();
            let limit = limit.clone();
            tokio::spawn(async move {
                tracing::info!("callback dispatcher started");
                while let Some(request_id) = rx.recv().await {
                    let permit = match limit.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.deliver(&request_id).await;
                        drop(permit);
                    });
                }
                tracing::info!("callback dispatcher stopped");
            })
        };

        let rescuer = {
            let dispatcher = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(RESCUE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    dispatcher.rescue(&tx).await;
                }
            })
        };

        (tx, vec![consumer, rescuer])
    }

    /// Re-enqueue CALLBACK_PENDING records that fell out of the queue.
    async fn rescue(&self, tx: &mpsc::Sender<String>) {
        let pending = match self.persistence.list_callback_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "rescuer failed listing pending callbacks");
                return;
            }
        };
        for record in pending {
            if self.in_flight.contains(&record.request_id) {
                continue;
            }
            if tx.try_send(record.request_id.clone()).is_ok() {
                tracing::info!(request_id = %record.request_id, "rescued pending callback");
            }
        }
    }

    /// Deliver one record's response, retrying until success or exhaustion.
    async fn deliver(&self, request_id: &str) {
        if self.in_flight.insert(request_id.to_string(), ()).is_err() {
            return;
        }
        self.deliver_inner(request_id).await;
        self.in_flight.remove(request_id);
    }

    async fn deliver_inner(&self, request_id: &str) {
        let record = match self.persistence.get(request_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(request_id, "callback record vanished before delivery");
                return;
            }
            Err(e) => {
                tracing::error!(request_id, error = %e, "failed loading callback record");
                return;
            }
        };

        // A rescued id may already have been delivered by another worker.
        if record.state != RequestState::CallbackPending {
            return;
        }
        let Some(callback_uri) = record.callback_uri.clone() else {
            tracing::error!(request_id, "CALLBACK_PENDING record without callback uri");
            self.finish(request_id, RequestState::CallbackFailed, record.attempts)
                .await;
            return;
        };

        let mut attempts = record.attempts;
        loop {
            attempts += 1;
            let _ = self
                .persistence
                .update_state(
                    request_id,
                    RequestState::CallbackPending,
                    RecordPatch {
                        attempts: Some(attempts),
                        ..RecordPatch::default()
                    },
                )
                .await;

            match self.post_callback(&callback_uri, &record).await {
                Ok(status) if (200..300).contains(&status) => {
                    tracing::info!(request_id, attempts, "callback delivered");
                    metrics::increment_callback("sent");
                    self.finish(request_id, RequestState::CallbackSent, attempts)
                        .await;
                    return;
                }
                Ok(status) => {
                    tracing::warn!(request_id, attempts, status, "callback rejected");
                }
                Err(e) => {
                    tracing::warn!(request_id, attempts, error = %e, "callback transport failure");
                }
            }

            if attempts >= self.max_attempts {
                tracing::error!(request_id, attempts, "callback attempts exhausted");
                metrics::increment_callback("failed");
                self.finish(request_id, RequestState::CallbackFailed, attempts)
                    .await;
                return;
            }

            tokio::time::sleep(self.backoff_delay(attempts)).await;
        }
    }

    async fn post_callback(
        &self,
        callback_uri: &str,
        record: &RequestRecord,
    ) -> Result<u16, reqwest::Error> {
        let mut request = self
            .client
            .post(callback_uri)
            .timeout(self.timeout)
            .header(crate::core::engine::HEADER_REQUEST_ID, &record.request_id);
        for (name, value) in &record.response_headers {
            request = request.header(name, value);
        }
        if let Some(body) = &record.response_body {
            request = request.body(body.clone());
        }
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }

    async fn finish(&self, request_id: &str, state: RequestState, attempts: u32) {
        if let Err(e) = self
            .persistence
            .update_state(
                request_id,
                state,
                RecordPatch {
                    attempts: Some(attempts),
                    ..RecordPatch::default()
                },
            )
            .await
        {
            tracing::error!(request_id, state = state.as_str(), error = %e, "callback state update failed");
        }
    }

    /// Exponential backoff doubling from the base up to 60s, jittered ±20%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(MAX_BACKOFF);
        let jitter = rand::rng().random_range(0.8..1.2);
        raw.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::{extract::State, http::StatusCode, routing::post, Router};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        adapters::memory_store::InMemoryPersistenceProvider,
        core::record::{RequestMode, RequestRecord},
    };

    async fn callback_server(fail_first: u32) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let state = hits.clone();
        let app = Router::new().route(
            "/cb",
            post(move |State(hits): State<Arc<AtomicU32>>| async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                }
            })
            .with_state(state),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/cb"), hits)
    }

    async fn pending_record(
        store: &InMemoryPersistenceProvider,
        id: &str,
        callback_uri: &str,
    ) {
        let mut record = RequestRecord::new(
            id.to_string(),
            "payments".to_string(),
            "orders".to_string(),
            RequestMode::Callback,
            "POST".to_string(),
            "/orders".to_string(),
            60,
        );
        record.callback_uri = Some(callback_uri.to_string());
        record.state = RequestState::CallbackPending;
        record.response_status = Some(200);
        record.response_body = Some(b"{\"ok\":true}".to_vec());
        store.save(record).await.unwrap();
    }

    #[tokio::test]
    async fn successful_delivery_marks_sent() {
        let (uri, hits) = callback_server(0).await;
        let store = Arc::new(InMemoryPersistenceProvider::new(60));
        pending_record(&store, "r1", &uri).await;

        let dispatcher = Arc::new(
            CallbackDispatcher::new(store.clone(), 1000, 3)
                .backoff_base(Duration::from_millis(10)),
        );
        dispatcher.deliver("r1").await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::CallbackSent);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let (uri, hits) = callback_server(2).await;
        let store = Arc::new(InMemoryPersistenceProvider::new(60));
        pending_record(&store, "r1", &uri).await;

        let dispatcher = Arc::new(
            CallbackDispatcher::new(store.clone(), 1000, 5)
                .backoff_base(Duration::from_millis(5)),
        );
        dispatcher.deliver("r1").await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::CallbackSent);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn exhaustion_marks_failed() {
        let (uri, hits) = callback_server(u32::MAX).await;
        let store = Arc::new(InMemoryPersistenceProvider::new(60));
        pending_record(&store, "r1", &uri).await;

        let dispatcher = Arc::new(
            CallbackDispatcher::new(store.clone(), 1000, 2)
                .backoff_base(Duration::from_millis(5)),
        );
        dispatcher.deliver("r1").await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::CallbackFailed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn queue_path_delivers_end_to_end() {
        let (uri, _hits) = callback_server(0).await;
        let store = Arc::new(InMemoryPersistenceProvider::new(60));
        pending_record(&store, "r1", &uri).await;

        let dispatcher = Arc::new(
            CallbackDispatcher::new(store.clone(), 1000, 3)
                .backoff_base(Duration::from_millis(5)),
        );
        let (tx, handles) = dispatcher.spawn(16, 2);
        tx.send("r1".to_string()).await.unwrap();

        // Wait for the delivery to land.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get("r1").await.unwrap().unwrap().state == RequestState::CallbackSent {
                break;
            }
        }
        assert_eq!(
            store.get("r1").await.unwrap().unwrap().state,
            RequestState::CallbackSent
        );
        for handle in handles {
            handle.abort();
        }
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let store = Arc::new(InMemoryPersistenceProvider::new(60));
        let dispatcher = CallbackDispatcher::new(store, 1000, 5);
        for attempt in 1..=20 {
            let delay = dispatcher.backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(800), "attempt {attempt}: {delay:?}");
            assert!(delay <= Duration::from_secs(72), "attempt {attempt}: {delay:?}");
        }
        // First attempt centers on the 1s initial backoff.
        let first = dispatcher.backoff_delay(1);
        assert!(first <= Duration::from_millis(1200));
    }
}

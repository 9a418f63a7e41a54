//! In-memory mailbox backend.
//!
//! Records live in a concurrent map keyed by request id. TTL is enforced by
//! a background sweep plus lazy expiry on read, so an expired record is never
//! served even between sweeps. State changes go through a per-entry closure,
//! which serializes them and lets the transition graph be checked under the
//! entry lock.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    core::record::{RecordPatch, RequestRecord, RequestState},
    metrics,
    ports::persistence::{PersistenceError, PersistenceProvider, PersistenceResult},
};

pub struct InMemoryPersistenceProvider {
    records: scc::HashMap<String, RequestRecord>,
    ttl_seconds: u64,
}

impl InMemoryPersistenceProvider {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            records: scc::HashMap::new(),
            ttl_seconds,
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Periodic TTL sweep. Runs until the provider is dropped elsewhere and
    /// the task is aborted on shutdown.
    pub fn spawn_sweeper(provider: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match provider.expire_before(Utc::now()).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::debug!(removed, "mailbox sweep expired records");
                    }
                    Err(e) => tracing::error!(error = %e, "mailbox sweep failed"),
                }
                metrics::set_mailbox_size(provider.len());
            }
        })
    }
}

#[async_trait]
impl PersistenceProvider for InMemoryPersistenceProvider {
    async fn save(&self, record: RequestRecord) -> PersistenceResult<()> {
        let key = record.request_id.clone();
        if self
            .records
            .update(&key, |_, existing| *existing = record.clone())
            .is_none()
        {
            let _ = self.records.insert(key, record);
        }
        Ok(())
    }

    async fn create_if_absent(&self, record: RequestRecord) -> PersistenceResult<bool> {
        let key = record.request_id.clone();
        let now = Utc::now();

        // An expired leftover does not block reuse of its id.
        let live = self
            .records
            .read(&key, |_, existing| !existing.is_expired(now))
            .unwrap_or(false);
        if live {
            return Ok(false);
        }

        match self.records.insert(key.clone(), record.clone()) {
            Ok(()) => Ok(true),
            Err(_) => {
                let replaced = self
                    .records
                    .update(&key, |_, existing| {
                        if existing.is_expired(now) {
                            *existing = record.clone();
                            true
                        } else {
                            false
                        }
                    })
                    .unwrap_or(false);
                Ok(replaced)
            }
        }
    }

    async fn get(&self, request_id: &str) -> PersistenceResult<Option<RequestRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .read(request_id, |_, record| record.clone())
            .filter(|record| !record.is_expired(now)))
    }

    async fn list_mailbox(&self, mailbox_id: &str) -> PersistenceResult<Vec<RequestRecord>> {
        let now = Utc::now();
        let mut out = Vec::new();
        self.records.scan(|_, record| {
            if record.mailbox_id.as_deref() == Some(mailbox_id) && !record.is_expired(now) {
                out.push(record.clone());
            }
        });
        out.sort_by_key(|record| record.created_at);
        Ok(out)
    }

    async fn update_state(
        &self,
        request_id: &str,
        new_state: RequestState,
        patch: RecordPatch,
    ) -> PersistenceResult<RequestRecord> {
        let result = self.records.update(request_id, |_, record| {
            if !record.state.can_transition_to(new_state) {
                return Err(PersistenceError::IllegalTransition {
                    request_id: request_id.to_string(),
                    from: record.state,
                    to: new_state,
                });
            }
            record.state = new_state;
            patch.apply(record);
            Ok(record.clone())
        });
        match result {
            Some(outcome) => outcome,
            None => Err(PersistenceError::NotFound(request_id.to_string())),
        }
    }

    async fn list_callback_pending(&self) -> PersistenceResult<Vec<RequestRecord>> {
        let now = Utc::now();
        let mut out = Vec::new();
        self.records.scan(|_, record| {
            if record.state == RequestState::CallbackPending && !record.is_expired(now) {
                out.push(record.clone());
            }
        });
        out.sort_by_key(|record| record.updated_at);
        Ok(out)
    }

    async fn expire_before(&self, ts: DateTime<Utc>) -> PersistenceResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > ts);
        Ok(before.saturating_sub(self.records.len()))
    }
}

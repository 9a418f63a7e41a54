use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::record::{RecordPatch, RequestRecord, RequestState};

/// Errors surfaced by mailbox backends.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PersistenceError {
    #[error("No record for request id '{0}'")]
    NotFound(String),

    /// The requested state change is not in the permitted transition graph.
    #[error("Illegal transition {from:?} -> {to:?} for request id '{request_id}'")]
    IllegalTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },

    #[error("Backend failure: {0}")]
    Backend(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Port for request/response persistence (the mailbox).
///
/// Backends must serialize per-record state changes: `update_state` is a
/// compare-and-set against the current state and fails on transitions the
/// [`RequestState`] graph forbids. All records carry an absolute expiry;
/// backends without native TTL honor it via `expire_before`.
#[async_trait]
pub trait PersistenceProvider: Send + Sync + 'static {
    /// Idempotent upsert keyed by `request_id`.
    async fn save(&self, record: RequestRecord) -> PersistenceResult<()>;

    /// Insert only when no live record holds this `request_id`. Returns
    /// false when one already exists — the engine's idempotent-replay check.
    async fn create_if_absent(&self, record: RequestRecord) -> PersistenceResult<bool>;

    async fn get(&self, request_id: &str) -> PersistenceResult<Option<RequestRecord>>;

    /// All records grouped under a mailbox id, oldest first.
    async fn list_mailbox(&self, mailbox_id: &str) -> PersistenceResult<Vec<RequestRecord>>;

    /// Transition a record, applying `patch` alongside. Returns the updated
    /// record.
    async fn update_state(
        &self,
        request_id: &str,
        new_state: RequestState,
        patch: RecordPatch,
    ) -> PersistenceResult<RequestRecord>;

    /// Records parked in CALLBACK_PENDING, for the dispatcher's rescuer.
    async fn list_callback_pending(&self) -> PersistenceResult<Vec<RequestRecord>>;

    /// Drop records that expired before `ts`. Returns how many were removed.
    /// Backends with native TTL may make this a no-op.
    async fn expire_before(&self, ts: DateTime<Utc>) -> PersistenceResult<usize>;
}

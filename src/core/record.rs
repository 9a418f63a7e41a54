//! Persisted request lifecycle model.
//!
//! A [`RequestRecord`] is created when an async request is accepted and walks
//! a fixed transition graph until it expires. Transitions are validated here
//! and enforced with compare-and-set semantics by the persistence providers.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Interaction mode selected for a request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestMode {
    Sync,
    Polling,
    Callback,
}

impl RequestMode {
    pub fn is_async(&self) -> bool {
        matches!(self, RequestMode::Polling | RequestMode::Callback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::Sync => "SYNC",
            RequestMode::Polling => "POLLING",
            RequestMode::Callback => "CALLBACK",
        }
    }
}

/// Lifecycle state of a persisted request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    InProgress,
    Completed,
    Failed,
    TimedOut,
    CallbackPending,
    CallbackSent,
    CallbackFailed,
}

impl RequestState {
    /// Whether `next` is a legal successor. Re-asserting the current state is
    /// allowed so patches (attempt counters) can ride an update.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Received, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, TimedOut)
                | (Completed, CallbackPending)
                | (CallbackPending, CallbackSent)
                | (CallbackPending, CallbackFailed)
        )
    }

    /// Terminal states never leave via the transition graph (TTL expiry is
    /// the only exit). COMPLETED is not terminal: callback mode promotes it
    /// to CALLBACK_PENDING.
    pub fn is_terminal(self) -> bool {
        use RequestState::*;
        matches!(self, Failed | TimedOut | CallbackSent | CallbackFailed)
    }

    /// The upstream call already ran and produced a stored response.
    pub fn has_response(self) -> bool {
        use RequestState::*;
        matches!(self, Completed | CallbackPending | CallbackSent | CallbackFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "RECEIVED",
            RequestState::InProgress => "IN_PROGRESS",
            RequestState::Completed => "COMPLETED",
            RequestState::Failed => "FAILED",
            RequestState::TimedOut => "TIMED_OUT",
            RequestState::CallbackPending => "CALLBACK_PENDING",
            RequestState::CallbackSent => "CALLBACK_SENT",
            RequestState::CallbackFailed => "CALLBACK_FAILED",
        }
    }
}

/// Stored request/response snapshot keyed by the client-supplied request id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    #[serde(default)]
    pub mailbox_id: Option<String>,
    pub service: String,
    pub api: String,
    pub mode: RequestMode,
    pub state: RequestState,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
    #[serde(default)]
    pub request_body: Option<Vec<u8>>,
    #[serde(default)]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    #[serde(default)]
    pub response_body: Option<Vec<u8>>,
    #[serde(default)]
    pub callback_uri: Option<String>,
    /// Callback delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RequestRecord {
    /// Fresh record in RECEIVED state with an absolute expiry.
    pub fn new(
        request_id: String,
        service: String,
        api: String,
        mode: RequestMode,
        method: String,
        path: String,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            mailbox_id: None,
            service,
            api,
            mode,
            state: RequestState::Received,
            method,
            path,
            request_headers: Vec::new(),
            request_body: None,
            response_status: None,
            response_headers: Vec::new(),
            response_body: None,
            callback_uri: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Partial update applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub response_status: Option<u16>,
    pub response_headers: Option<Vec<(String, String)>>,
    pub response_body: Option<Vec<u8>>,
    pub attempts: Option<u32>,
}

impl RecordPatch {
    pub fn apply(&self, record: &mut RequestRecord) {
        if let Some(status) = self.response_status {
            record.response_status = Some(status);
        }
        if let Some(headers) = &self.response_headers {
            record.response_headers = headers.clone();
        }
        if let Some(body) = &self.response_body {
            record.response_body = Some(body.clone());
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        record.updated_at = Utc::now();
    }
}

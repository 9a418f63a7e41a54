//! Redis mailbox backend.
//!
//! Records are JSON blobs under `revolver:req:{id}` with native TTL; mailbox
//! grouping and the callback-pending set are maintained as side indexes with
//! the same expiry. `expire_before` is a no-op since redis ages keys itself.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};

use crate::{
    core::record::{RecordPatch, RequestRecord, RequestState},
    ports::persistence::{PersistenceError, PersistenceProvider, PersistenceResult},
};

const RECORD_PREFIX: &str = "revolver:req:";
const MAILBOX_PREFIX: &str = "revolver:mbx:";
const PENDING_SET: &str = "revolver:callback_pending";

pub struct RedisPersistenceProvider {
    connection: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisPersistenceProvider {
    pub async fn connect(url: &str, ttl_seconds: u64) -> PersistenceResult<Self> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        let connection = ConnectionManager::new(client).await.map_err(backend_err)?;
        tracing::info!(ttl_seconds, "connected redis mailbox");
        Ok(Self {
            connection,
            ttl_seconds,
        })
    }

    fn record_key(request_id: &str) -> String {
        format!("{RECORD_PREFIX}{request_id}")
    }

    fn mailbox_key(mailbox_id: &str) -> String {
        format!("{MAILBOX_PREFIX}{mailbox_id}")
    }

    fn encode(record: &RequestRecord) -> PersistenceResult<String> {
        serde_json::to_string(record).map_err(|e| PersistenceError::Backend(e.to_string()))
    }

    fn decode(raw: &str) -> PersistenceResult<RequestRecord> {
        serde_json::from_str(raw).map_err(|e| PersistenceError::Backend(e.to_string()))
    }

    /// Write the record and refresh its indexes under the record TTL.
    async fn write(&self, record: &RequestRecord) -> PersistenceResult<()> {
        let mut conn = self.connection.clone();
        let payload = Self::encode(record)?;
        let key = Self::record_key(&record.request_id);

        let mut pipe = redis::pipe();
        pipe.set_ex(&key, payload, self.ttl_seconds);
        if let Some(mailbox_id) = &record.mailbox_id {
            let mailbox_key = Self::mailbox_key(mailbox_id);
            pipe.sadd(&mailbox_key, &record.request_id);
            pipe.expire(&mailbox_key, self.ttl_seconds as i64);
        }
        if record.state == RequestState::CallbackPending {
            pipe.sadd(PENDING_SET, &record.request_id);
        } else {
            pipe.srem(PENDING_SET, &record.request_id);
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn fetch_ids(&self, ids: Vec<String>) -> PersistenceResult<Vec<RequestRecord>> {
        let mut conn = self.connection.clone();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(Self::record_key(&id))
                .await
                .map_err(backend_err)?;
            if let Some(raw) = raw {
                records.push(Self::decode(&raw)?);
            }
        }
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[async_trait]
impl PersistenceProvider for RedisPersistenceProvider {
    async fn save(&self, record: RequestRecord) -> PersistenceResult<()> {
        self.write(&record).await
    }

    async fn create_if_absent(&self, record: RequestRecord) -> PersistenceResult<bool> {
        let mut conn = self.connection.clone();
        let key = Self::record_key(&record.request_id);
        let payload = Self::encode(&record)?;

        // SET NX EX: atomic claim of the id for the TTL window.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if claimed.is_none() {
            return Ok(false);
        }

        if let Some(mailbox_id) = &record.mailbox_id {
            let mailbox_key = Self::mailbox_key(mailbox_id);
            let mut pipe = redis::pipe();
            pipe.sadd(&mailbox_key, &record.request_id);
            pipe.expire(&mailbox_key, self.ttl_seconds as i64);
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(backend_err)?;
        }
        Ok(true)
    }

    async fn get(&self, request_id: &str) -> PersistenceResult<Option<RequestRecord>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(Self::record_key(request_id))
            .await
            .map_err(backend_err)?;
        raw.map(|raw| Self::decode(&raw)).transpose()
    }

    async fn list_mailbox(&self, mailbox_id: &str) -> PersistenceResult<Vec<RequestRecord>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn
            .smembers(Self::mailbox_key(mailbox_id))
            .await
            .map_err(backend_err)?;
        self.fetch_ids(ids).await
    }

    async fn update_state(
        &self,
        request_id: &str,
        new_state: RequestState,
        patch: RecordPatch,
    ) -> PersistenceResult<RequestRecord> {
        // Get-check-set: per-record writers are already serialized by the
        // engine/dispatcher split, so optimistic concurrency suffices here.
        let mut record = self
            .get(request_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(request_id.to_string()))?;

        if !record.state.can_transition_to(new_state) {
            return Err(PersistenceError::IllegalTransition {
                request_id: request_id.to_string(),
                from: record.state,
                to: new_state,
            });
        }
        record.state = new_state;
        patch.apply(&mut record);
        self.write(&record).await?;
        Ok(record)
    }

    async fn list_callback_pending(&self) -> PersistenceResult<Vec<RequestRecord>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(PENDING_SET).await.map_err(backend_err)?;
        let records = self.fetch_ids(ids).await?;
        // Drop stale index entries whose records have aged out.
        Ok(records
            .into_iter()
            .filter(|record| record.state == RequestState::CallbackPending)
            .collect())
    }

    async fn expire_before(&self, _ts: DateTime<Utc>) -> PersistenceResult<usize> {
        // Redis ages records natively via SET EX.
        Ok(0)
    }
}

fn backend_err(e: redis::RedisError) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

//! Execution engine: the invoke pipeline.
//!
//! Routes an ingress request, selects the interaction mode, persists async
//! records, pushes the upstream call through the per-API bulkhead and maps
//! the outcome onto a response plus a final record state. Sync calls answer
//! inline; polling and callback submissions answer `202 Accepted` and finish
//! in a background task.
use std::{collections::HashMap, sync::Arc, time::Instant};

use base64::Engine as _;
use http::{HeaderMap, Method, Request, StatusCode};
use hyper::body::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::models::{api_key, ApiConfig, ApiMode, AuthConfig, ServiceSettings},
    core::{
        bulkhead::BulkheadError,
        error::GatewayError,
        record::{RecordPatch, RequestMode, RequestRecord, RequestState},
        registry::BulkheadRegistry,
        resolver::ResolverRegistry,
        router::{RouteMatch, ServiceRouter},
    },
    metrics,
    ports::{
        http_client::{UpstreamClient, UpstreamClientError},
        persistence::PersistenceProvider,
    },
};

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_REQUEST_MODE: &str = "x-request-mode";
pub const HEADER_CALLBACK_URI: &str = "x-callback-uri";
pub const HEADER_MAILBOX_ID: &str = "x-mailbox-id";
pub const HEADER_GATEWAY_TIMESTAMP: &str = "x-gateway-timestamp";

/// Connection-scoped headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Per-(service, api) enable flags, seeded true at registration.
pub type ApiStatusMap = scc::HashMap<String, bool>;

/// Decoded ingress request handed in by the HTTP edge.
#[derive(Debug, Clone)]
pub struct IngressRequest {
    pub service: String,
    /// Path remainder after `/apis/{service}`, with leading slash.
    pub path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the edge sends back for an invoke.
#[derive(Debug)]
pub enum EngineReply {
    /// SYNC: the mapped upstream (or fallback) response.
    Inline {
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    /// POLLING / CALLBACK: accepted for async processing.
    Accepted { request_id: String },
}

/// Buffered upstream response after header filtering.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct ExecutionEngine {
    router: Arc<ServiceRouter>,
    registry: Arc<BulkheadRegistry>,
    resolvers: Arc<ResolverRegistry>,
    clients: HashMap<String, Arc<dyn UpstreamClient>>,
    services: HashMap<String, Arc<ServiceSettings>>,
    api_status: Arc<ApiStatusMap>,
    persistence: Arc<dyn PersistenceProvider>,
    callback_tx: mpsc::Sender<String>,
    ttl_seconds: u64,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<ServiceRouter>,
        registry: Arc<BulkheadRegistry>,
        resolvers: Arc<ResolverRegistry>,
        clients: HashMap<String, Arc<dyn UpstreamClient>>,
        services: HashMap<String, Arc<ServiceSettings>>,
        api_status: Arc<ApiStatusMap>,
        persistence: Arc<dyn PersistenceProvider>,
        callback_tx: mpsc::Sender<String>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            router,
            registry,
            resolvers,
            clients,
            services,
            api_status,
            persistence,
            callback_tx,
            ttl_seconds,
        }
    }

    /// Full invoke pipeline for one ingress request.
    pub async fn invoke(
        self: Arc<Self>,
        ingress: IngressRequest,
        cancel: CancellationToken,
    ) -> Result<EngineReply, GatewayError> {
        let route = self
            .router
            .match_route(&ingress.service, &ingress.path)
            .ok_or_else(|| GatewayError::NotFound {
                service: ingress.service.clone(),
                path: ingress.path.clone(),
            })?;

        if !route.api.methods.iter().any(|m| m.matches(&ingress.method)) {
            return Err(GatewayError::BadRequest(format!(
                "method {} not allowed for API '{}'",
                ingress.method, route.api.api
            )));
        }

        let key = api_key(&route.service, &route.api.api);
        let enabled = self
            .api_status
            .read(&key, |_, enabled| *enabled)
            .unwrap_or(true);
        if !enabled {
            return Err(GatewayError::ApiDisabled(key));
        }

        let mode = select_mode(&route.api, &ingress.headers)?;
        let request_id = header_value(&ingress.headers, HEADER_REQUEST_ID)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mailbox_id = header_value(&ingress.headers, HEADER_MAILBOX_ID);
        let callback_uri = header_value(&ingress.headers, HEADER_CALLBACK_URI);

        if route.api.auth_required && !ingress.headers.contains_key(http::header::AUTHORIZATION) {
            return Err(GatewayError::Auth);
        }

        if mode.is_async() {
            self.invoke_async(route, ingress, mode, request_id, mailbox_id, callback_uri)
                .await
        } else {
            self.invoke_sync(route, ingress, request_id, cancel).await
        }
    }

    async fn invoke_sync(
        self: Arc<Self>,
        route: RouteMatch,
        ingress: IngressRequest,
        request_id: String,
        cancel: CancellationToken,
    ) -> Result<EngineReply, GatewayError> {
        let persist = route.api.persist_sync;
        if persist {
            let record = self.build_record(&route, &ingress, RequestMode::Sync, &request_id, None, None);
            self.persistence
                .create_if_absent(record)
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            self.transition(&request_id, RequestState::InProgress, RecordPatch::default())
                .await;
        }

        let outcome = self
            .call_upstream(&route, &ingress, &request_id, cancel)
            .await;

        if persist {
            self.persist_outcome(&request_id, &outcome).await;
        }

        match outcome {
            Ok(response) => Ok(EngineReply::Inline {
                status: StatusCode::from_u16(response.status)
                    .unwrap_or(StatusCode::BAD_GATEWAY),
                headers: response.headers,
                body: response.body,
            }),
            Err(err) => self.apply_fallback(&route.service, &route.api, err),
        }
    }

    async fn invoke_async(
        self: Arc<Self>,
        route: RouteMatch,
        ingress: IngressRequest,
        mode: RequestMode,
        request_id: String,
        mailbox_id: Option<String>,
        callback_uri: Option<String>,
    ) -> Result<EngineReply, GatewayError> {
        let record = self.build_record(
            &route,
            &ingress,
            mode,
            &request_id,
            mailbox_id,
            callback_uri,
        );
        let created = self
            .persistence
            .create_if_absent(record)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        if !created {
            // Replay-safe retry: the prior record answers, the upstream is
            // not invoked again.
            tracing::info!(request_id = %request_id, "duplicate async submission, replaying record");
            return Ok(EngineReply::Accepted { request_id });
        }

        self.transition(&request_id, RequestState::InProgress, RecordPatch::default())
            .await;

        let engine = self.clone();
        let task_id = request_id.clone();
        tokio::spawn(async move {
            // The caller is gone; only the bulkhead budget bounds this call.
            let cancel = CancellationToken::new();
            let outcome = engine
                .call_upstream(&route, &ingress, &task_id, cancel)
                .await;
            engine.persist_outcome(&task_id, &outcome).await;

            if mode == RequestMode::Callback && outcome.is_ok() {
                engine
                    .transition(&task_id, RequestState::CallbackPending, RecordPatch::default())
                    .await;
                if engine.callback_tx.try_send(task_id.clone()).is_err() {
                    // Queue saturated: the record stays CALLBACK_PENDING and
                    // the rescuer re-enqueues it from persistence.
                    tracing::warn!(request_id = %task_id, "callback queue full, deferring to rescuer");
                    metrics::increment_callback("deferred");
                }
            }
        });

        Ok(EngineReply::Accepted { request_id })
    }

    /// Resolve, decorate and issue the upstream call through the bulkhead,
    /// retrying idempotent methods on transient failures within the budget.
    async fn call_upstream(
        &self,
        route: &RouteMatch,
        ingress: &IngressRequest,
        correlation_id: &str,
        cancel: CancellationToken,
    ) -> Result<StoredResponse, GatewayError> {
        let service = self
            .services
            .get(&route.service)
            .ok_or_else(|| GatewayError::Internal(format!("no service '{}'", route.service)))?
            .clone();
        let client = self
            .clients
            .get(&route.service)
            .ok_or_else(|| GatewayError::Internal(format!("no client for '{}'", route.service)))?
            .clone();
        let bulkhead = self.registry.get(&route.service, &route.api.api);
        let key = bulkhead.key().to_string();
        let budget_ms = bulkhead.budget_ms();

        let api = route.api.clone();
        let resolvers = self.resolvers.clone();
        let ingress = ingress.clone();
        let correlation = correlation_id.to_string();
        let started = Instant::now();

        let result = bulkhead
            .execute(&cancel, move |token| async move {
                let retryable_method = api
                    .methods
                    .iter()
                    .find(|m| m.matches(&ingress.method))
                    .map(|m| m.is_idempotent())
                    .unwrap_or(false);
                let max_attempts = if retryable_method {
                    api.retry.max_attempts.max(1)
                } else {
                    1
                };

                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let endpoint = resolvers.resolve(&ingress.service).ok_or_else(|| {
                        UpstreamClientError::ConnectionError(format!(
                            "no endpoint for service '{}'",
                            ingress.service
                        ))
                    })?;

                    let request =
                        build_upstream_request(&ingress, &api, &service, &endpoint, &correlation)?;

                    let result = tokio::select! {
                        r = client.execute(request) => r,
                        _ = token.cancelled() => {
                            return Err(UpstreamClientError::ConnectionError(
                                "cancelled by deadline".to_string(),
                            ));
                        }
                    };

                    let error = match result {
                        Ok(response) if response.status().is_server_error() => {
                            UpstreamClientError::ServerError {
                                status: response.status().as_u16(),
                            }
                        }
                        Ok(response) => return Ok(filter_response(response, &api)),
                        Err(e) => e,
                    };

                    if attempt >= max_attempts || !error.is_retryable() || token.is_cancelled() {
                        return Err(error);
                    }

                    let backoff = api.retry.backoff_base_ms << (attempt - 1);
                    tracing::debug!(
                        attempt,
                        backoff_ms = backoff,
                        error = %error,
                        "retrying idempotent upstream call"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
            })
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mapped = match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(GatewayError::UpstreamFailure(err.to_string())),
            Err(BulkheadError::CapacityExceeded { retry_after_ms }) => {
                Err(GatewayError::CapacityExceeded {
                    key: key.clone(),
                    retry_after_ms,
                })
            }
            Err(BulkheadError::CircuitOpen { retry_after_ms }) => Err(GatewayError::CircuitOpen {
                key: key.clone(),
                retry_after_ms,
            }),
            Err(BulkheadError::Timeout { .. }) => Err(GatewayError::Timeout(budget_ms)),
        };

        let outcome = match &mapped {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        tracing::info!(
            service = %route.service,
            api = %route.api.api,
            latency_ms,
            outcome,
            "upstream call completed"
        );
        metrics::increment_api_request(&route.service, &route.api.api, outcome);
        metrics::record_upstream_duration(&route.service, &route.api.api, started.elapsed());

        mapped
    }

    fn build_record(
        &self,
        route: &RouteMatch,
        ingress: &IngressRequest,
        mode: RequestMode,
        request_id: &str,
        mailbox_id: Option<String>,
        callback_uri: Option<String>,
    ) -> RequestRecord {
        let mut record = RequestRecord::new(
            request_id.to_string(),
            route.service.clone(),
            route.api.api.clone(),
            mode,
            ingress.method.to_string(),
            ingress.path.clone(),
            self.ttl_seconds,
        );
        record.mailbox_id = mailbox_id;
        record.callback_uri = callback_uri;
        record.request_headers = header_pairs(&ingress.headers);
        if !ingress.body.is_empty() {
            record.request_body = Some(ingress.body.to_vec());
        }
        record
    }

    async fn persist_outcome(
        &self,
        request_id: &str,
        outcome: &Result<StoredResponse, GatewayError>,
    ) {
        let (state, patch) = match outcome {
            Ok(response) => (
                RequestState::Completed,
                RecordPatch {
                    response_status: Some(response.status),
                    response_headers: Some(response.headers.clone()),
                    response_body: Some(response.body.to_vec()),
                    attempts: None,
                },
            ),
            Err(err @ GatewayError::Timeout(_)) => (
                RequestState::TimedOut,
                RecordPatch {
                    response_status: Some(err.status().as_u16()),
                    response_body: Some(err.to_string().into_bytes()),
                    ..RecordPatch::default()
                },
            ),
            Err(err) => (
                RequestState::Failed,
                RecordPatch {
                    response_status: Some(err.status().as_u16()),
                    response_body: Some(err.to_string().into_bytes()),
                    ..RecordPatch::default()
                },
            ),
        };
        self.transition(request_id, state, patch).await;
    }

    async fn transition(&self, request_id: &str, state: RequestState, patch: RecordPatch) {
        if let Err(e) = self
            .persistence
            .update_state(request_id, state, patch)
            .await
        {
            // A lost transition must not fail the compartment; the record
            // will age out via TTL.
            tracing::error!(request_id, state = state.as_str(), error = %e, "state transition failed");
        }
    }

    /// Synthesize the configured fallback body for shed or failed calls.
    /// Runs outside the compartment so a slow fallback cannot hold a permit.
    fn apply_fallback(
        &self,
        service: &str,
        api: &ApiConfig,
        err: GatewayError,
    ) -> Result<EngineReply, GatewayError> {
        let fallback_enabled = self.registry.runtime(service, &api.api).fallback_enabled;
        let shed = matches!(
            err,
            GatewayError::CapacityExceeded { .. }
                | GatewayError::CircuitOpen { .. }
                | GatewayError::Timeout(_)
                | GatewayError::UpstreamFailure(_)
        );
        if fallback_enabled && shed {
            if let Some(body) = &api.fallback_body {
                tracing::debug!(api = %api.api, "serving fallback response");
                metrics::increment_api_request(service, &api.api, "fallback");
                return Ok(EngineReply::Inline {
                    status: StatusCode::OK,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: Bytes::from(body.clone()),
                });
            }
        }
        Err(err)
    }
}

fn select_mode(api: &ApiConfig, headers: &HeaderMap) -> Result<RequestMode, GatewayError> {
    if header_value(headers, HEADER_CALLBACK_URI).is_some() {
        return Ok(RequestMode::Callback);
    }
    if let Some(raw) = header_value(headers, HEADER_REQUEST_MODE) {
        return match raw.to_ascii_uppercase().as_str() {
            "SYNC" => Ok(RequestMode::Sync),
            "POLLING" => Ok(RequestMode::Polling),
            "CALLBACK" => Err(GatewayError::BadRequest(
                "CALLBACK mode requires the X-Callback-Uri header".to_string(),
            )),
            other => Err(GatewayError::BadRequest(format!(
                "unknown request mode '{other}'"
            ))),
        };
    }
    Ok(match api.mode {
        ApiMode::Sync => RequestMode::Sync,
        ApiMode::Polling => RequestMode::Polling,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Gateway control headers; re-stamped explicitly, never forwarded raw.
fn is_gateway_header(name: &str) -> bool {
    [HEADER_REQUEST_ID, HEADER_REQUEST_MODE, HEADER_CALLBACK_URI, HEADER_MAILBOX_ID]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Build the decorated upstream request: whitelisted headers, auth material,
/// correlation id, optional tracking headers.
fn build_upstream_request(
    ingress: &IngressRequest,
    api: &ApiConfig,
    service: &ServiceSettings,
    endpoint: &crate::core::resolver::Endpoint,
    correlation_id: &str,
) -> Result<Request<Bytes>, UpstreamClientError> {
    let mut uri = format!("{}://{}{}", endpoint.scheme(), endpoint.authority(), ingress.path);
    if let Some(query) = &ingress.query {
        uri.push('?');
        uri.push_str(query);
    }

    let mut builder = Request::builder().method(ingress.method.clone()).uri(uri);

    for (name, value) in ingress.headers.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || is_gateway_header(name_str) {
            continue;
        }
        let allowed = api.whitelist_request_headers.is_empty()
            || api
                .whitelist_request_headers
                .iter()
                .any(|w| w.eq_ignore_ascii_case(name_str));
        if allowed {
            builder = builder.header(name, value);
        }
    }

    builder = builder.header(HEADER_REQUEST_ID, correlation_id);

    if service.tracking_headers {
        builder = builder.header(
            HEADER_GATEWAY_TIMESTAMP,
            chrono::Utc::now().timestamp_millis().to_string(),
        );
        if let Some(mailbox) = ingress
            .headers
            .get(HEADER_MAILBOX_ID)
            .and_then(|v| v.to_str().ok())
        {
            builder = builder.header(HEADER_MAILBOX_ID, mailbox);
        }
    }

    if let Some(auth) = &service.auth {
        let value = match auth {
            AuthConfig::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
            AuthConfig::Token { prefix, token } => format!("{prefix} {token}"),
        };
        builder = builder.header(http::header::AUTHORIZATION, value);
    }

    builder
        .body(ingress.body.clone())
        .map_err(|e| UpstreamClientError::InvalidRequest(e.to_string()))
}

/// Reduce an upstream response to the whitelisted header set plus body.
fn filter_response(response: http::Response<Bytes>, api: &ApiConfig) -> StoredResponse {
    let status = response.status().as_u16();
    let (parts, body) = response.into_parts();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str) {
                return None;
            }
            let allowed = api.whitelist_response_headers.is_empty()
                || api
                    .whitelist_response_headers
                    .iter()
                    .any(|w| w.eq_ignore_ascii_case(name_str));
            if !allowed {
                return None;
            }
            value
                .to_str()
                .ok()
                .map(|v| (name_str.to_string(), v.to_string()))
        })
        .collect();
    StoredResponse {
        status,
        headers,
        body,
    }
}

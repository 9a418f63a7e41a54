//! Ingress HTTP surface for the gateway.
//!
//! Explicit route registrations over the published `Gateway` generation:
//! the invoke surface under `/apis`, the mailbox polling endpoints, the
//! upstream-originated callback receipt, the metadata summary and the admin
//! enable/disable toggles. All gateway-emitted bodies are JSON; proxied
//! bodies pass through verbatim.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
    routing::{any, get, post},
    Router,
};
use hyper::body::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::{
        engine::{EngineReply, IngressRequest, HEADER_REQUEST_ID},
        error::GatewayError,
        gateway::Gateway,
        record::{RecordPatch, RequestMode, RequestRecord, RequestState},
    },
    metrics,
    ports::persistence::PersistenceProvider,
};

/// Largest ingress body the gateway buffers.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct GatewayHandler {
    gateway: Arc<ArcSwap<Gateway>>,
    persistence: Arc<dyn PersistenceProvider>,
    callback_tx: mpsc::Sender<String>,
    in_flight: AtomicU64,
}

impl GatewayHandler {
    pub fn new(
        gateway: Arc<ArcSwap<Gateway>>,
        persistence: Arc<dyn PersistenceProvider>,
        callback_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            gateway,
            persistence,
            callback_tx,
            in_flight: AtomicU64::new(0),
        }
    }

    /// Requests currently inside the gateway, for the shutdown drain.
    pub fn active_requests(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Build the full axum router over this handler.
    pub fn router(handler: Arc<Self>) -> Router {
        Router::new()
            .route("/apis/{service}/{*path}", any(invoke))
            .route("/v1/request/{request_id}", get(get_request))
            .route("/v1/mailbox/{mailbox_id}", get(list_mailbox))
            .route("/v1/callback/{request_id}", post(receive_callback))
            .route("/v1/metadata/status", get(metadata_status))
            .route("/v1/manage/api/status", get(manage_status_all))
            .route("/v1/manage/api/status/{service}/{api}", get(manage_status_one))
            .route(
                "/v1/manage/api/status/{service}/{api}/enable",
                post(manage_enable),
            )
            .route(
                "/v1/manage/api/status/{service}/{api}/disable",
                post(manage_disable),
            )
            .with_state(handler)
    }
}

async fn invoke(
    State(handler): State<Arc<GatewayHandler>>,
    Path((service, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    handler.in_flight.fetch_add(1, Ordering::AcqRel);
    let started = std::time::Instant::now();
    let method = request.method().clone();

    let correlation_id = request
        .headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let span = crate::tracing_setup::create_request_span(
        method.as_str(),
        request.uri().path(),
        &correlation_id,
    );

    let response = invoke_inner(&handler, service, path, request)
        .instrument(span)
        .await;

    let duration = started.elapsed();
    tracing::Span::current().record("http.status_code", response.status().as_u16());
    tracing::Span::current().record("duration_ms", duration.as_millis() as u64);

    handler.in_flight.fetch_sub(1, Ordering::AcqRel);
    metrics::increment_ingress(method.as_str(), response.status().as_u16());
    metrics::record_ingress_duration(method.as_str(), duration);
    response
}

async fn invoke_inner(
    handler: &Arc<GatewayHandler>,
    service: String,
    path: String,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(&GatewayError::BadRequest(format!(
                "failed reading request body: {e}"
            )));
        }
    };

    let ingress = IngressRequest {
        service,
        path: format!("/{path}"),
        query: parts.uri.query().map(|q| q.to_string()),
        method: parts.method,
        headers: parts.headers,
        body,
    };

    let gateway = handler.gateway.load_full();
    let cancel = CancellationToken::new();
    match gateway.engine().clone().invoke(ingress, cancel).await {
        Ok(EngineReply::Inline {
            status,
            headers,
            body,
        }) => {
            let mut builder = Response::builder().status(status);
            for (name, value) in &headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| plain_error(StatusCode::BAD_GATEWAY))
        }
        Ok(EngineReply::Accepted { request_id }) => json_response(
            StatusCode::ACCEPTED,
            &json!({ "request_id": request_id }),
            &[(HEADER_REQUEST_ID, request_id.as_str())],
        ),
        Err(err) => error_response(&err),
    }
}

async fn get_request(
    State(handler): State<Arc<GatewayHandler>>,
    Path(request_id): Path<String>,
) -> Response {
    match handler.persistence.get(&request_id).await {
        Ok(Some(record)) => render_record(&record),
        Ok(None) => error_response(&GatewayError::NotFound {
            service: "mailbox".to_string(),
            path: request_id,
        }),
        Err(e) => error_response(&GatewayError::Internal(e.to_string())),
    }
}

/// Completed records answer with the stored upstream response verbatim;
/// in-flight ones answer 202 with the current state.
fn render_record(record: &RequestRecord) -> Response {
    if let Some(status) = record.response_status {
        let mut builder = Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
            .header(HEADER_REQUEST_ID, &record.request_id);
        for (name, value) in &record.response_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }
        let body = record.response_body.clone().unwrap_or_default();
        return builder
            .body(Body::from(Bytes::from(body)))
            .unwrap_or_else(|_| plain_error(StatusCode::BAD_GATEWAY));
    }

    json_response(
        StatusCode::ACCEPTED,
        &json!({
            "request_id": record.request_id,
            "state": record.state.as_str(),
        }),
        &[(HEADER_REQUEST_ID, record.request_id.as_str())],
    )
}

async fn list_mailbox(
    State(handler): State<Arc<GatewayHandler>>,
    Path(mailbox_id): Path<String>,
) -> Response {
    match handler.persistence.list_mailbox(&mailbox_id).await {
        Ok(records) => {
            let entries: Vec<_> = records
                .iter()
                .map(|record| {
                    json!({
                        "request_id": record.request_id,
                        "service": record.service,
                        "api": record.api,
                        "mode": record.mode.as_str(),
                        "state": record.state.as_str(),
                        "response_status": record.response_status,
                        "created_at": record.created_at.to_rfc3339(),
                        "updated_at": record.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                &json!({ "mailbox_id": mailbox_id, "requests": entries }),
                &[],
            )
        }
        Err(e) => error_response(&GatewayError::Internal(e.to_string())),
    }
}

/// Upstream-originated completion: the upstream POSTs the response for a
/// request the gateway accepted earlier, closing the loop without a second
/// upstream call.
async fn receive_callback(
    State(handler): State<Arc<GatewayHandler>>,
    Path(request_id): Path<String>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(&GatewayError::BadRequest(format!(
                "failed reading callback body: {e}"
            )));
        }
    };

    let record = match handler.persistence.get(&request_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(&GatewayError::NotFound {
                service: "mailbox".to_string(),
                path: request_id,
            });
        }
        Err(e) => return error_response(&GatewayError::Internal(e.to_string())),
    };

    if record.state.has_response() || record.state.is_terminal() {
        return error_response(&GatewayError::BadRequest(format!(
            "request '{request_id}' already completed"
        )));
    }

    // A record the engine never started (upstream completes fully
    // out-of-band) still walks the full transition graph.
    if record.state == RequestState::Received {
        let _ = handler
            .persistence
            .update_state(&request_id, RequestState::InProgress, RecordPatch::default())
            .await;
    }

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let patch = RecordPatch {
        response_status: Some(200),
        response_headers: Some(headers),
        response_body: Some(body.to_vec()),
        attempts: None,
    };
    match handler
        .persistence
        .update_state(&request_id, RequestState::Completed, patch)
        .await
    {
        Ok(updated) => {
            if updated.mode == RequestMode::Callback {
                let _ = handler
                    .persistence
                    .update_state(
                        &request_id,
                        RequestState::CallbackPending,
                        RecordPatch::default(),
                    )
                    .await;
                if handler.callback_tx.try_send(request_id.clone()).is_err() {
                    tracing::warn!(request_id = %request_id, "callback queue full, deferring to rescuer");
                }
            }
            json_response(
                StatusCode::ACCEPTED,
                &json!({ "request_id": request_id, "state": "COMPLETED" }),
                &[],
            )
        }
        Err(e) => error_response(&GatewayError::BadRequest(e.to_string())),
    }
}

async fn metadata_status(State(handler): State<Arc<GatewayHandler>>) -> Response {
    let gateway = handler.gateway.load_full();
    json_response(
        StatusCode::OK,
        &json!({ "services": gateway.metadata_status() }),
        &[],
    )
}

async fn manage_status_all(State(handler): State<Arc<GatewayHandler>>) -> Response {
    let gateway = handler.gateway.load_full();
    json_response(StatusCode::OK, &json!(gateway.api_statuses()), &[])
}

async fn manage_status_one(
    State(handler): State<Arc<GatewayHandler>>,
    Path((service, api)): Path<(String, String)>,
) -> Response {
    let gateway = handler.gateway.load_full();
    match gateway.api_status_of(&service, &api) {
        Some(status) => json_response(
            StatusCode::OK,
            &json!({ "service": service, "api": api, "status": status }),
            &[],
        ),
        None => json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "service": service, "api": api }),
            &[],
        ),
    }
}

async fn manage_enable(
    State(handler): State<Arc<GatewayHandler>>,
    Path((service, api)): Path<(String, String)>,
) -> Response {
    toggle_api(&handler, service, api, true)
}

async fn manage_disable(
    State(handler): State<Arc<GatewayHandler>>,
    Path((service, api)): Path<(String, String)>,
) -> Response {
    toggle_api(&handler, service, api, false)
}

fn toggle_api(handler: &GatewayHandler, service: String, api: String, enabled: bool) -> Response {
    let gateway = handler.gateway.load_full();
    if gateway.set_api_enabled(&service, &api, enabled) {
        json_response(
            StatusCode::OK,
            &json!({ "service": service, "api": api, "status": enabled }),
            &[],
        )
    } else {
        json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "service": service, "api": api }),
            &[],
        )
    }
}

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
    extra_headers: &[(&str, &str)],
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| plain_error(StatusCode::INTERNAL_SERVER_ERROR))
}

fn error_response(err: &GatewayError) -> Response {
    let mut builder = Response::builder()
        .status(err.status())
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry_after) = err.retry_after_secs() {
        builder = builder.header(header::RETRY_AFTER, retry_after.to_string());
    }
    let body = json!({
        "error_code": err.error_code(),
        "message": err.to_string(),
    });
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| plain_error(err.status()))
}

fn plain_error(status: StatusCode) -> Response {
    let mut response = Response::new(Body::from("internal error"));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_code_and_retry_after() {
        let err = GatewayError::CircuitOpen {
            key: "payments.orders".to_string(),
            retry_after_ms: 5000,
        };
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }

    #[test]
    fn render_pending_record_is_accepted() {
        let record = RequestRecord::new(
            "r1".to_string(),
            "payments".to_string(),
            "orders".to_string(),
            RequestMode::Polling,
            "GET".to_string(),
            "/orders/1".to_string(),
            60,
        );
        let response = render_record(&record);
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[HEADER_REQUEST_ID], "r1");
    }

    #[test]
    fn render_completed_record_replays_stored_response() {
        let mut record = RequestRecord::new(
            "r1".to_string(),
            "payments".to_string(),
            "orders".to_string(),
            RequestMode::Polling,
            "GET".to_string(),
            "/orders/1".to_string(),
            60,
        );
        record.state = RequestState::Completed;
        record.response_status = Some(201);
        record.response_headers = vec![("content-type".to_string(), "text/plain".to_string())];
        record.response_body = Some(b"done".to_vec());

        let response = render_record(&record);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }
}

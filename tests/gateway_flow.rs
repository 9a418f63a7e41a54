//! End-to-end gateway flows against a local mock upstream.
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use http::{HeaderMap, Method};
use hyper::body::Bytes;
use revolver::{
    adapters::{build_service_clients, CallbackDispatcher, InMemoryPersistenceProvider},
    config::models::{
        ApiConfig, ApiMethod, ApiMode, CircuitConfig, EndpointSpec, RetryConfig, RevolverConfig,
        RuntimeConfig, ServiceConfig, ServiceSettings,
    },
    core::{
        engine::{EngineReply, IngressRequest},
        record::RequestState,
        Gateway, GatewayError,
    },
    ports::persistence::PersistenceProvider,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct UpstreamState {
    order_hits: Arc<AtomicU32>,
}

async fn start_upstream() -> (String, Arc<AtomicU32>) {
    let order_hits = Arc::new(AtomicU32::new(0));
    let state = UpstreamState {
        order_hits: order_hits.clone(),
    };

    let app = Router::new()
        .route("/orders/latest", get(|| async { "latest" }))
        .route(
            "/orders/{id}",
            get(
                |State(state): State<UpstreamState>, Path(id): Path<String>| async move {
                    state.order_hits.fetch_add(1, Ordering::SeqCst);
                    format!("order {id}")
                },
            ),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(2000)).await;
                "slow"
            }),
        )
        .route(
            "/busy",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "busy"
            }),
        )
        .route("/fail", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .route("/orders", post(|| async { (StatusCode::CREATED, "created") }))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), order_hits)
}

fn methods(list: &[ApiMethod]) -> HashSet<ApiMethod> {
    list.iter().copied().collect()
}

fn api(name: &str, path: &str, api_methods: &[ApiMethod]) -> ApiConfig {
    ApiConfig {
        api: name.to_string(),
        path: path.to_string(),
        methods: methods(api_methods),
        mode: ApiMode::Sync,
        runtime: None,
        retry: RetryConfig {
            max_attempts: 1,
            backoff_base_ms: 10,
        },
        auth_required: false,
        whitelist_request_headers: Vec::new(),
        whitelist_response_headers: Vec::new(),
        fallback_body: None,
        persist_sync: false,
    }
}

fn runtime(timeout_ms: u64, concurrency: usize, volume: usize, sleep_ms: u64) -> RuntimeConfig {
    RuntimeConfig {
        timeout_ms,
        concurrency,
        circuit: CircuitConfig {
            error_threshold_percent: 50,
            request_volume: volume,
            sleep_window_ms: sleep_ms,
        },
        fallback_enabled: false,
    }
}

fn gateway_config(upstream_addr: &str) -> RevolverConfig {
    let apis = vec![
        api("latest", "/orders/latest", &[ApiMethod::GET]),
        api("order_by_id", "/orders/{id}", &[ApiMethod::GET]),
        ApiConfig {
            runtime: Some(runtime(500, 8, 100, 5000)),
            ..api("slow", "/slow", &[ApiMethod::GET])
        },
        ApiConfig {
            runtime: Some(runtime(5000, 3, 100, 5000)),
            ..api("busy", "/busy", &[ApiMethod::GET])
        },
        ApiConfig {
            runtime: Some(runtime(1000, 8, 10, 1000)),
            ..api("flaky", "/fail", &[ApiMethod::GET])
        },
        ApiConfig {
            mode: ApiMode::Polling,
            ..api("create_order", "/orders", &[ApiMethod::POST])
        },
    ];

    RevolverConfig {
        services: vec![ServiceConfig::Http {
            settings: ServiceSettings {
                service: "payments".to_string(),
                endpoint: EndpointSpec::Simple {
                    endpoints: vec![upstream_addr.to_string()],
                },
                connection_pool_size: 8,
                keep_alive_ms: 30_000,
                compression: false,
                auth: None,
                tracking_headers: false,
                apis,
            },
        }],
        ..RevolverConfig::default()
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    store: Arc<InMemoryPersistenceProvider>,
    order_hits: Arc<AtomicU32>,
}

async fn harness() -> Harness {
    let (upstream_addr, order_hits) = start_upstream().await;
    let config = Arc::new(gateway_config(&upstream_addr));
    let store = Arc::new(InMemoryPersistenceProvider::new(3600));

    let dispatcher = Arc::new(
        CallbackDispatcher::new(store.clone(), 1000, 3).backoff_base(Duration::from_millis(20)),
    );
    let (callback_tx, _handles) = dispatcher.spawn(64, 2);

    let clients = build_service_clients(&config).unwrap();
    let gateway =
        Gateway::new(config, clients, store.clone(), callback_tx, None).unwrap();

    Harness {
        gateway: Arc::new(gateway),
        store,
        order_hits,
    }
}

fn ingress(method: Method, path: &str, headers: HeaderMap) -> IngressRequest {
    IngressRequest {
        service: "payments".to_string(),
        path: path.to_string(),
        query: None,
        method,
        headers,
        body: Bytes::new(),
    }
}

async fn invoke(
    harness: &Harness,
    method: Method,
    path: &str,
    headers: HeaderMap,
) -> Result<EngineReply, GatewayError> {
    harness
        .gateway
        .engine()
        .clone()
        .invoke(ingress(method, path, headers), CancellationToken::new())
        .await
}

fn inline_body(reply: EngineReply) -> (StatusCode, Bytes) {
    match reply {
        EngineReply::Inline { status, body, .. } => (status, body),
        other => panic!("expected inline reply, got {other:?}"),
    }
}

async fn wait_for_state(
    store: &InMemoryPersistenceProvider,
    request_id: &str,
    state: RequestState,
) -> bool {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if let Some(record) = store.get(request_id).await.unwrap() {
            if record.state == state {
                return true;
            }
        }
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn literal_route_beats_parametric() {
    let h = harness().await;

    let reply = invoke(&h, Method::GET, "/orders/latest", HeaderMap::new())
        .await
        .unwrap();
    let (status, body) = inline_body(reply);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"latest");

    let reply = invoke(&h, Method::GET, "/orders/42", HeaderMap::new())
        .await
        .unwrap();
    let (status, body) = inline_body(reply);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"order 42");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_route_is_not_found() {
    let h = harness().await;
    let err = invoke(&h, Method::GET, "/nope", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn method_not_in_api_set_is_rejected() {
    let h = harness().await;
    let err = invoke(&h, Method::DELETE, "/orders/latest", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::BadRequest(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_upstream_times_out_within_budget() {
    let h = harness().await;

    let started = std::time::Instant::now();
    let err = invoke(&h, Method::GET, "/slow", HeaderMap::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, GatewayError::Timeout(500)));
    assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "elapsed {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn bulkhead_caps_concurrent_requests() {
    let h = harness().await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let gateway = h.gateway.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .engine()
                .clone()
                .invoke(
                    ingress(Method::GET, "/busy", HeaderMap::new()),
                    CancellationToken::new(),
                )
                .await
        }));
    }

    let mut ok = 0;
    let mut shed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(GatewayError::CapacityExceeded { .. }) => shed += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(shed, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn breaker_trips_and_admits_trial_after_sleep() {
    let h = harness().await;

    // Fill the window: 10 upstream 500s.
    for _ in 0..10 {
        let err = invoke(&h, Method::GET, "/fail", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure(_)));
    }

    // 11th sheds fast without an upstream call.
    let started = std::time::Instant::now();
    let err = invoke(&h, Method::GET, "/fail", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    assert!(started.elapsed() < Duration::from_millis(100));

    // After the sleep window one trial goes upstream (and fails again).
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let err = invoke(&h, Method::GET, "/fail", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamFailure(_)));

    // Trial failure reopens immediately.
    let err = invoke(&h, Method::GET, "/fail", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::CircuitOpen { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_api_is_shed_with_503() {
    let h = harness().await;
    assert!(h.gateway.set_api_enabled("payments", "latest", false));

    let err = invoke(&h, Method::GET, "/orders/latest", HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ApiDisabled(_)));

    assert!(h.gateway.set_api_enabled("payments", "latest", true));
    assert!(invoke(&h, Method::GET, "/orders/latest", HeaderMap::new())
        .await
        .is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_submission_persists_and_replays() {
    let h = harness().await;

    let mut headers = HeaderMap::new();
    headers.insert("x-request-id", "r1".parse().unwrap());
    headers.insert("x-request-mode", "POLLING".parse().unwrap());

    let reply = invoke(&h, Method::GET, "/orders/7", headers.clone())
        .await
        .unwrap();
    match reply {
        EngineReply::Accepted { request_id } => assert_eq!(request_id, "r1"),
        other => panic!("expected accepted, got {other:?}"),
    }

    assert!(wait_for_state(&h.store, "r1", RequestState::Completed).await);
    let first_hits = h.order_hits.load(Ordering::SeqCst);
    assert_eq!(first_hits, 1);

    // Same id again: 202, no second upstream call.
    let reply = invoke(&h, Method::GET, "/orders/7", headers).await.unwrap();
    assert!(matches!(reply, EngineReply::Accepted { .. }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.order_hits.load(Ordering::SeqCst), first_hits);

    // Stored response is retrievable.
    let record = h.store.get("r1").await.unwrap().unwrap();
    assert_eq!(record.response_status, Some(200));
    assert_eq!(record.response_body.as_deref(), Some(b"order 7".as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn callback_mode_delivers_to_callback_uri() {
    let h = harness().await;

    // Callback receiver records hits.
    let cb_hits = Arc::new(AtomicU32::new(0));
    let cb_state = cb_hits.clone();
    let cb_app = Router::new().route(
        "/cb",
        post(move |State(hits): State<Arc<AtomicU32>>| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK
        })
        .with_state(cb_state),
    );
    let cb_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cb_addr = cb_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(cb_listener, cb_app).await.unwrap();
    });

    let mut headers = HeaderMap::new();
    headers.insert("x-request-id", "cb-1".parse().unwrap());
    headers.insert(
        "x-callback-uri",
        format!("http://{cb_addr}/cb").parse().unwrap(),
    );

    let reply = invoke(&h, Method::GET, "/orders/9", headers).await.unwrap();
    assert!(matches!(reply, EngineReply::Accepted { .. }));

    assert!(wait_for_state(&h.store, "cb-1", RequestState::CallbackSent).await);
    assert_eq!(cb_hits.load(Ordering::SeqCst), 1);

    let record = h.store.get("cb-1").await.unwrap().unwrap();
    assert_eq!(record.attempts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_mode_via_api_default() {
    let h = harness().await;

    let mut headers = HeaderMap::new();
    headers.insert("x-request-id", "p1".parse().unwrap());
    // create_order defaults to polling mode; no mode header needed.
    let reply = invoke(&h, Method::POST, "/orders", headers).await.unwrap();
    assert!(matches!(reply, EngineReply::Accepted { .. }));

    assert!(wait_for_state(&h.store, "p1", RequestState::Completed).await);
    let record = h.store.get("p1").await.unwrap().unwrap();
    assert_eq!(record.response_status, Some(201));
}

#[tokio::test(flavor = "multi_thread")]
async fn mailbox_groups_async_requests() {
    let h = harness().await;

    for (id, order) in [("m-r1", "/orders/1"), ("m-r2", "/orders/2")] {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", id.parse().unwrap());
        headers.insert("x-request-mode", "POLLING".parse().unwrap());
        headers.insert("x-mailbox-id", "box-1".parse().unwrap());
        invoke(&h, Method::GET, order, headers).await.unwrap();
    }

    assert!(wait_for_state(&h.store, "m-r1", RequestState::Completed).await);
    assert!(wait_for_state(&h.store, "m-r2", RequestState::Completed).await);

    let records = h.store.list_mailbox("box-1").await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.mailbox_id.as_deref() == Some("box-1")));
}

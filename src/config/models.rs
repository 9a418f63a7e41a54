//! Configuration data structures for Revolver.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde-friendly and include defaults so that minimal
//! configs remain concise. Polymorphic sections (service transport, endpoint
//! resolution, upstream auth, mailbox backend) are tagged enums discriminated
//! by a `type` field.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_callback_timeout_ms() -> u64 {
    3000
}

/// Upper bound on the callback POST timeout; larger configured values are
/// clamped, not rejected.
pub const MAX_CALLBACK_TIMEOUT_MS: u64 = 30_000;

fn default_config_poll_interval() -> u64 {
    600
}

fn default_shutdown_grace() -> u64 {
    30
}

/// Root configuration for the gateway process.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RevolverConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default, alias = "clientConfig")]
    pub client: ClientConfig,
    /// Runtime defaults applied to every API without an override.
    #[serde(default)]
    pub global: RuntimeConfig,
    #[serde(default, alias = "serviceResolverConfig")]
    pub service_resolver: ResolverConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default, alias = "mailBox")]
    pub mailbox: MailboxConfig,
    #[serde(default = "default_callback_timeout_ms", alias = "callbackTimeout")]
    pub callback_timeout_ms: u64,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default, alias = "dynamicConfig")]
    pub dynamic_config: bool,
    #[serde(default, alias = "dynamicConfigUrl")]
    pub dynamic_config_url: Option<String>,
    #[serde(default = "default_config_poll_interval", alias = "configPollIntervalSeconds")]
    pub config_poll_interval_seconds: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl RevolverConfig {
    /// Callback POST timeout with the 30s ceiling applied.
    pub fn callback_timeout_ms(&self) -> u64 {
        self.callback_timeout_ms.min(MAX_CALLBACK_TIMEOUT_MS)
    }

    /// Effective runtime for an API: the per-API override when present,
    /// otherwise the global defaults.
    pub fn runtime_for(&self, api: &ApiConfig) -> RuntimeConfig {
        api.runtime.clone().unwrap_or_else(|| self.global.clone())
    }
}

impl Default for RevolverConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            client: ClientConfig::default(),
            global: RuntimeConfig::default(),
            service_resolver: ResolverConfig::default(),
            services: Vec::new(),
            mailbox: MailboxConfig::default(),
            callback_timeout_ms: default_callback_timeout_ms(),
            callback: CallbackConfig::default(),
            dynamic_config: false,
            dynamic_config_url: None,
            config_poll_interval_seconds: default_config_poll_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// Gateway-wide defaults for upstream HTTP clients.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Revolver-Gateway/1.0".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

/// Per-API execution budget: time, concurrency and circuit thresholds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub timeout_ms: u64,
    pub concurrency: usize,
    pub circuit: CircuitConfig,
    pub fallback_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            concurrency: 8,
            circuit: CircuitConfig::default(),
            fallback_enabled: false,
        }
    }
}

/// Circuit breaker thresholds for one compartment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitConfig {
    /// Percentage of non-success completions in the window that opens the circuit.
    pub error_threshold_percent: u8,
    /// Number of completions the sliding window holds; the breaker does not
    /// trip before the window is full.
    pub request_volume: usize,
    /// How long an open circuit sheds load before admitting a trial call.
    pub sleep_window_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_threshold_percent: 50,
            request_volume: 20,
            sleep_window_ms: 5000,
        }
    }
}

/// Retry policy for idempotent upstream calls.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 50,
        }
    }
}

/// Endpoint resolution mode for the whole gateway.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ResolverConfig {
    /// When true, services may use `watched` endpoint specs backed by an
    /// external discovery driver. When false every service needs a static
    /// endpoint list.
    pub use_watcher: bool,
}

/// Service definitions (tagged enum). `https` services carry client TLS
/// material and imply secure endpoints.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServiceConfig {
    Http {
        #[serde(flatten)]
        settings: ServiceSettings,
    },
    Https {
        #[serde(flatten)]
        settings: ServiceSettings,
        tls: TlsMaterial,
    },
}

impl ServiceConfig {
    pub fn settings(&self) -> &ServiceSettings {
        match self {
            ServiceConfig::Http { settings } => settings,
            ServiceConfig::Https { settings, .. } => settings,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ServiceConfig::Https { .. })
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        match self {
            ServiceConfig::Http { .. } => None,
            ServiceConfig::Https { tls, .. } => Some(tls),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceConfig::Http { .. } => "http",
            ServiceConfig::Https { .. } => "https",
        }
    }
}

fn default_pool_size() -> usize {
    8
}

fn default_keep_alive_ms() -> u64 {
    30_000
}

/// Settings shared by http and https services.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceSettings {
    /// Logical service identity clients address via `/apis/{service}/...`.
    pub service: String,
    pub endpoint: EndpointSpec,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Stamp `X-Request-Id` / `X-Mailbox-Id` / timestamp headers onto
    /// upstream requests.
    #[serde(default)]
    pub tracking_headers: bool,
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
}

/// Client TLS material for https services (PEM encoded).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsMaterial {
    /// Client certificate chain presented to the upstream.
    pub cert_path: String,
    /// Private key matching `cert_path`.
    pub key_path: String,
    /// Extra trust root appended to the native store.
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// How a service name maps to concrete endpoints.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum EndpointSpec {
    /// Fixed `host:port` list, round-robin selection.
    Simple { endpoints: Vec<String> },
    /// Live set published by the discovery driver, uniform-random selection
    /// among healthy members.
    Watched { cluster: String },
}

/// Upstream authentication material (tagged enum).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Token { prefix: String, token: String },
}

/// HTTP methods an API accepts.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::GET => "GET",
            ApiMethod::POST => "POST",
            ApiMethod::PUT => "PUT",
            ApiMethod::DELETE => "DELETE",
            ApiMethod::PATCH => "PATCH",
            ApiMethod::HEAD => "HEAD",
            ApiMethod::OPTIONS => "OPTIONS",
        }
    }

    /// Methods safe to retry on transient upstream failures.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, ApiMethod::GET | ApiMethod::HEAD | ApiMethod::OPTIONS)
    }

    pub fn matches(&self, method: &http::Method) -> bool {
        method.as_str() == self.as_str()
    }
}

fn default_methods() -> HashSet<ApiMethod> {
    let mut methods = HashSet::new();
    methods.insert(ApiMethod::GET);
    methods
}

/// Default execution mode for an API (callers may upgrade per request).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    #[default]
    Sync,
    Polling,
}

/// One named route on a service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiConfig {
    /// Logical API name, unique within the service.
    pub api: String,
    /// URL path template; `{name}` segments are parameters.
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: HashSet<ApiMethod>,
    #[serde(default)]
    pub mode: ApiMode,
    /// Per-API runtime override; absent means the global runtime applies.
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Require an Authorization header on ingress.
    #[serde(default)]
    pub auth_required: bool,
    /// Request headers forwarded upstream; empty means all except hop-by-hop.
    #[serde(default)]
    pub whitelist_request_headers: Vec<String>,
    /// Response headers relayed back; empty means all except hop-by-hop.
    #[serde(default)]
    pub whitelist_response_headers: Vec<String>,
    /// Body synthesized when the runtime has fallback enabled and the call
    /// does not succeed.
    #[serde(default)]
    pub fallback_body: Option<String>,
    /// Persist SYNC requests too (async modes are always persisted).
    #[serde(default)]
    pub persist_sync: bool,
}

fn default_in_memory_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

/// Mailbox (request persistence) backend selection.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum MailboxConfig {
    InMemory {
        #[serde(default = "default_in_memory_ttl")]
        ttl_seconds: u64,
        #[serde(default = "default_sweep_interval")]
        sweep_interval_seconds: u64,
    },
    Redis {
        url: String,
        #[serde(default = "default_in_memory_ttl")]
        ttl_seconds: u64,
    },
}

impl MailboxConfig {
    pub fn ttl_seconds(&self) -> u64 {
        match self {
            MailboxConfig::InMemory { ttl_seconds, .. } => *ttl_seconds,
            MailboxConfig::Redis { ttl_seconds, .. } => *ttl_seconds,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig::InMemory {
            ttl_seconds: default_in_memory_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_callback_attempts() -> u32 {
    5
}

fn default_callback_queue_depth() -> usize {
    1024
}

fn default_callback_workers() -> usize {
    4
}

/// Callback dispatcher sizing.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub queue_depth: usize,
    pub workers: usize,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_callback_attempts(),
            queue_depth: default_callback_queue_depth(),
            workers: default_callback_workers(),
        }
    }
}

/// Registry key for one `(service, api)` compartment.
pub fn api_key(service: &str, api: &str) -> String {
    format!("{service}.{api}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_timeout_is_clamped() {
        let config = RevolverConfig {
            callback_timeout_ms: 45_000,
            ..RevolverConfig::default()
        };
        assert_eq!(config.callback_timeout_ms(), MAX_CALLBACK_TIMEOUT_MS);

        let config = RevolverConfig::default();
        assert_eq!(config.callback_timeout_ms(), 3000);
    }

    #[test]
    fn runtime_override_wins_over_global() {
        let mut config = RevolverConfig::default();
        config.global.timeout_ms = 1000;

        let api = ApiConfig {
            api: "orders".to_string(),
            path: "/orders".to_string(),
            methods: default_methods(),
            mode: ApiMode::Sync,
            runtime: Some(RuntimeConfig {
                timeout_ms: 250,
                ..RuntimeConfig::default()
            }),
            retry: RetryConfig::default(),
            auth_required: false,
            whitelist_request_headers: Vec::new(),
            whitelist_response_headers: Vec::new(),
            fallback_body: None,
            persist_sync: false,
        };
        assert_eq!(config.runtime_for(&api).timeout_ms, 250);

        let plain = ApiConfig {
            runtime: None,
            ..api
        };
        assert_eq!(config.runtime_for(&plain).timeout_ms, 1000);
    }

    #[test]
    fn service_config_tag_round_trips() {
        let yaml = r#"
type: http
service: payments
endpoint:
  type: simple
  endpoints:
    - "127.0.0.1:9001"
apis:
  - api: orders
    path: "/orders/{id}"
"#;
        let source = config::File::from_str(yaml, config::FileFormat::Yaml);
        let service: ServiceConfig = config::Config::builder()
            .add_source(source)
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(service.settings().service, "payments");
        assert!(!service.is_secure());
        assert_eq!(service.settings().apis.len(), 1);
        assert_eq!(service.settings().apis[0].mode, ApiMode::Sync);
        assert!(service.settings().apis[0].methods.contains(&ApiMethod::GET));
    }

    #[test]
    fn auth_config_variants_parse() {
        let basic: AuthConfig =
            serde_json::from_str(r#"{"type":"basic","username":"u","password":"p"}"#).unwrap();
        assert!(matches!(basic, AuthConfig::Basic { .. }));

        let token: AuthConfig =
            serde_json::from_str(r#"{"type":"token","prefix":"Bearer","token":"t"}"#).unwrap();
        assert!(matches!(token, AuthConfig::Token { .. }));
    }
}

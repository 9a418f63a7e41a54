//! Core gateway orchestration value.
//!
//! A `Gateway` aggregates one configuration generation: the compiled routing
//! table, the bulkhead registry, per-service resolvers and clients, the
//! admin enable/disable map and the execution engine wired over them. It is
//! owned by the process behind an `ArcSwap`; a dynamic config reload builds
//! a fresh `Gateway` and swaps it in whole, so readers always observe a
//! consistent generation and the old one drains as references release.
use std::{collections::HashMap, sync::Arc};

use eyre::{Result, WrapErr};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config::models::{api_key, RevolverConfig, ServiceSettings},
    core::{
        breaker::CircuitState,
        engine::{ApiStatusMap, ExecutionEngine},
        registry::BulkheadRegistry,
        resolver::ResolverRegistry,
        router::ServiceRouter,
    },
    ports::{
        discovery::EndpointDiscovery, http_client::UpstreamClient,
        persistence::PersistenceProvider,
    },
};

/// One row of the admin status listing.
#[derive(Debug, Clone, Serialize)]
pub struct ApiStatusEntry {
    pub service: String,
    pub api: String,
    pub status: bool,
}

/// One row of the metadata status listing.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub instances: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

pub struct Gateway {
    config: Arc<RevolverConfig>,
    router: Arc<ServiceRouter>,
    registry: Arc<BulkheadRegistry>,
    resolvers: Arc<ResolverRegistry>,
    api_status: Arc<ApiStatusMap>,
    engine: Arc<ExecutionEngine>,
}

impl Gateway {
    /// Assemble a gateway generation from configuration plus injected
    /// providers. Compiles the routing table and seeds every registered API
    /// as enabled.
    pub fn new(
        config: Arc<RevolverConfig>,
        clients: HashMap<String, Arc<dyn UpstreamClient>>,
        persistence: Arc<dyn PersistenceProvider>,
        callback_tx: mpsc::Sender<String>,
        discovery: Option<Arc<dyn EndpointDiscovery>>,
    ) -> Result<Self> {
        let router = Arc::new(ServiceRouter::new());
        router
            .register(&config.services)
            .wrap_err("Failed to compile routing table")?;

        let registry = Arc::new(BulkheadRegistry::new(&config));
        let resolvers = Arc::new(ResolverRegistry::new(&config, discovery.as_ref()));

        let api_status: Arc<ApiStatusMap> = Arc::new(scc::HashMap::new());
        let mut services = HashMap::new();
        for service in &config.services {
            let settings = service.settings();
            services.insert(settings.service.clone(), Arc::new(settings.clone()));
            for api in &settings.apis {
                let _ = api_status.insert(api_key(&settings.service, &api.api), true);
            }
        }

        let engine = Arc::new(ExecutionEngine::new(
            router.clone(),
            registry.clone(),
            resolvers.clone(),
            clients,
            services,
            api_status.clone(),
            persistence,
            callback_tx,
            config.mailbox.ttl_seconds(),
        ));

        Ok(Self {
            config,
            router,
            registry,
            resolvers,
            api_status,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Arc<RevolverConfig> {
        &self.config
    }

    fn settings_for(&self, service: &str) -> Option<&ServiceSettings> {
        self.config
            .services
            .iter()
            .map(|s| s.settings())
            .find(|s| s.service == service)
    }

    /// Current enable flag, or `None` for an unregistered API.
    pub fn api_status_of(&self, service: &str, api: &str) -> Option<bool> {
        self.api_status
            .read(&api_key(service, api), |_, enabled| *enabled)
    }

    /// Flip the enable flag. Returns false when the key is unknown (the
    /// admin surface answers 400 in that case).
    pub fn set_api_enabled(&self, service: &str, api: &str, enabled: bool) -> bool {
        let key = api_key(service, api);
        let updated = self
            .api_status
            .update(&key, |_, status| {
                *status = enabled;
            })
            .is_some();
        if updated {
            tracing::info!(service, api, enabled, "api toggle updated");
        }
        updated
    }

    /// Full admin status listing, ordered by key.
    pub fn api_statuses(&self) -> Vec<ApiStatusEntry> {
        let mut entries = Vec::new();
        self.api_status.scan(|key, enabled| {
            if let Some((service, api)) = key.split_once('.') {
                entries.push(ApiStatusEntry {
                    service: service.to_string(),
                    api: api.to_string(),
                    status: *enabled,
                });
            }
        });
        entries.sort_by(|a, b| (&a.service, &a.api).cmp(&(&b.service, &b.api)));
        entries
    }

    /// Summary of every configured service for `/v1/metadata/status`.
    pub fn metadata_status(&self) -> Vec<ServiceStatusSummary> {
        let mut out = Vec::new();
        for service in &self.config.services {
            let settings = service.settings();
            let summary = self.resolvers.summary(&settings.service);
            let (instances, healthy, unhealthy, unknown) = summary
                .map(|s| (s.instances, s.healthy, s.unhealthy, s.unknown))
                .unwrap_or((0, 0, 0, 0));
            out.push(ServiceStatusSummary {
                name: settings.service.clone(),
                service_type: service.type_name().to_string(),
                instances,
                healthy,
                unhealthy,
                unknown,
            });
        }
        out
    }

    /// Instantiated compartments and their breaker states.
    pub fn compartments(&self) -> Vec<(String, CircuitState)> {
        self.registry.snapshot()
    }

    /// Log the registered service map, one line per API route.
    pub fn log_service_map(&self) {
        tracing::info!("Revolver service map");
        for (service, api, pattern) in self.router.list() {
            let methods = self
                .settings_for(&service)
                .and_then(|s| s.apis.iter().find(|a| a.api == api))
                .map(|a| {
                    let mut names: Vec<&str> = a.methods.iter().map(|m| m.as_str()).collect();
                    names.sort();
                    names.join(",")
                })
                .unwrap_or_default();
            tracing::info!(service = %service, api = %api, methods = %methods, path = %pattern, "registered api");
        }
    }
}

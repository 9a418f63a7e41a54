//! Lazy per-(service, api) bulkhead registry.
//!
//! Bulkheads are created on first use from the effective runtime (per-API
//! override or global default). The registry is owned by the published
//! `Gateway` value, so a config swap replaces the whole registry atomically
//! and old compartments drain as their references are released.
use std::{collections::HashMap, sync::Arc};

use crate::{
    config::models::{api_key, RevolverConfig, RuntimeConfig},
    core::bulkhead::Bulkhead,
};

pub struct BulkheadRegistry {
    bulkheads: scc::HashMap<String, Arc<Bulkhead>>,
    runtimes: HashMap<String, RuntimeConfig>,
    global: RuntimeConfig,
}

impl BulkheadRegistry {
    /// Capture the effective runtime for every registered API up front;
    /// bulkhead construction itself is deferred to first use.
    pub fn new(config: &RevolverConfig) -> Self {
        let mut runtimes = HashMap::new();
        for service in &config.services {
            let settings = service.settings();
            for api in &settings.apis {
                runtimes.insert(api_key(&settings.service, &api.api), config.runtime_for(api));
            }
        }
        Self {
            bulkheads: scc::HashMap::new(),
            runtimes,
            global: config.global.clone(),
        }
    }

    /// Effective runtime for an API (override or global).
    pub fn runtime(&self, service: &str, api: &str) -> &RuntimeConfig {
        self.runtimes
            .get(&api_key(service, api))
            .unwrap_or(&self.global)
    }

    /// Fetch (creating on first use) the compartment for `service.api`.
    pub fn get(&self, service: &str, api: &str) -> Arc<Bulkhead> {
        let key = api_key(service, api);
        if let Some(existing) = self.bulkheads.read(&key, |_, b| b.clone()) {
            return existing;
        }
        let runtime = self.runtimes.get(&key).unwrap_or(&self.global).clone();
        let fresh = Arc::new(Bulkhead::new(key.clone(), &runtime));
        match self.bulkheads.insert(key, fresh.clone()) {
            Ok(()) => fresh,
            // Another caller won the race; use the registered compartment so
            // it stays unique process-wide.
            Err((key, _)) => self
                .bulkheads
                .read(&key, |_, b| b.clone())
                .unwrap_or(fresh),
        }
    }

    /// Snapshot of instantiated compartments and their breaker states.
    pub fn snapshot(&self) -> Vec<(String, crate::core::breaker::CircuitState)> {
        let mut out = Vec::new();
        self.bulkheads.scan(|key, bulkhead| {
            out.push((key.clone(), bulkhead.current_state()));
        });
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

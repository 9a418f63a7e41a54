//! Service name to endpoint resolution.
//!
//! Two variants: a static list walked round-robin, and a live set published
//! by an external discovery driver where selection is uniform-random among
//! healthy members. Resolution is non-blocking in the hot path; watched sets
//! are refreshed out-of-band by the driver.
use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

use arc_swap::ArcSwap;
use rand::Rng;
use serde::Serialize;

use crate::{
    config::models::{EndpointSpec, RevolverConfig},
    ports::discovery::EndpointDiscovery,
};

/// A concrete upstream address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Parse a `host:port` pair.
    pub fn parse(raw: &str, secure: bool) -> Option<Self> {
        let (host, port) = raw.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self {
            host: host.to_string(),
            port,
            secure,
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// Health of one discovered instance as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Live membership snapshot published by a discovery driver.
#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    pub instances: Vec<(Endpoint, InstanceHealth)>,
}

/// Instance counts surfaced by the metadata endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverSummary {
    pub instances: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

enum ResolverKind {
    /// Fixed endpoints, round-robin cursor.
    Static {
        endpoints: Vec<Endpoint>,
        cursor: AtomicUsize,
    },
    /// Driver-published membership, uniform-random over healthy members.
    Watched { live: Arc<ArcSwap<EndpointSet>> },
}

pub struct ServiceResolver {
    kind: ResolverKind,
}

impl ServiceResolver {
    pub fn fixed(endpoints: Vec<Endpoint>) -> Self {
        Self {
            kind: ResolverKind::Static {
                endpoints,
                cursor: AtomicUsize::new(0),
            },
        }
    }

    pub fn watched(live: Arc<ArcSwap<EndpointSet>>) -> Self {
        Self {
            kind: ResolverKind::Watched { live },
        }
    }

    /// Pick an endpoint, or `None` when the service currently has no usable
    /// member. Never blocks.
    pub fn resolve(&self) -> Option<Endpoint> {
        match &self.kind {
            ResolverKind::Static { endpoints, cursor } => {
                if endpoints.is_empty() {
                    return None;
                }
                let index = cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
                endpoints.get(index).cloned()
            }
            ResolverKind::Watched { live } => {
                let set = live.load();
                let healthy: Vec<&Endpoint> = set
                    .instances
                    .iter()
                    .filter(|(_, health)| *health == InstanceHealth::Healthy)
                    .map(|(endpoint, _)| endpoint)
                    .collect();
                if healthy.is_empty() {
                    return None;
                }
                let index = rand::rng().random_range(0..healthy.len());
                healthy.get(index).map(|e| (*e).clone())
            }
        }
    }

    pub fn summary(&self) -> ResolverSummary {
        match &self.kind {
            ResolverKind::Static { endpoints, .. } => ResolverSummary {
                instances: endpoints.len(),
                healthy: 0,
                unhealthy: 0,
                // Static members carry no health signal.
                unknown: endpoints.len(),
            },
            ResolverKind::Watched { live } => {
                let set = live.load();
                let mut summary = ResolverSummary {
                    instances: set.instances.len(),
                    healthy: 0,
                    unhealthy: 0,
                    unknown: 0,
                };
                for (_, health) in &set.instances {
                    match health {
                        InstanceHealth::Healthy => summary.healthy += 1,
                        InstanceHealth::Unhealthy => summary.unhealthy += 1,
                        InstanceHealth::Unknown => summary.unknown += 1,
                    }
                }
                summary
            }
        }
    }
}

/// All per-service resolvers for one published gateway generation.
pub struct ResolverRegistry {
    resolvers: HashMap<String, ServiceResolver>,
}

impl ResolverRegistry {
    /// Build resolvers from config; watched services subscribe to the
    /// discovery driver when one is wired in.
    pub fn new(
        config: &RevolverConfig,
        discovery: Option<&Arc<dyn EndpointDiscovery>>,
    ) -> Self {
        let mut resolvers = HashMap::new();
        for service in &config.services {
            let settings = service.settings();
            let secure = service.is_secure();
            let resolver = match &settings.endpoint {
                EndpointSpec::Simple { endpoints } => {
                    let parsed = endpoints
                        .iter()
                        .filter_map(|raw| Endpoint::parse(raw, secure))
                        .collect();
                    ServiceResolver::fixed(parsed)
                }
                EndpointSpec::Watched { cluster } => match discovery {
                    Some(driver) => ServiceResolver::watched(driver.subscribe(cluster)),
                    None => {
                        tracing::warn!(
                            service = %settings.service,
                            cluster = %cluster,
                            "watched endpoint spec without a discovery driver; service will not resolve"
                        );
                        ServiceResolver::watched(Arc::new(ArcSwap::from_pointee(
                            EndpointSet::default(),
                        )))
                    }
                },
            };
            resolvers.insert(settings.service.clone(), resolver);
        }
        Self { resolvers }
    }

    pub fn resolve(&self, service: &str) -> Option<Endpoint> {
        self.resolvers.get(service).and_then(|r| r.resolve())
    }

    pub fn summary(&self, service: &str) -> Option<ResolverSummary> {
        self.resolvers.get(service).map(|r| r.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            secure: false,
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Endpoint::parse("host:8080", false).is_some());
        assert!(Endpoint::parse("host", false).is_none());
        assert!(Endpoint::parse(":8080", false).is_none());
        assert!(Endpoint::parse("host:notaport", false).is_none());
    }

    #[test]
    fn static_round_robin_cycles() {
        let resolver = ServiceResolver::fixed(vec![ep(1), ep(2), ep(3)]);
        let picks: Vec<u16> = (0..6).filter_map(|_| resolver.resolve()).map(|e| e.port).collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn empty_static_resolves_none() {
        let resolver = ServiceResolver::fixed(Vec::new());
        assert!(resolver.resolve().is_none());
    }

    #[test]
    fn watched_excludes_unhealthy() {
        let live = Arc::new(ArcSwap::from_pointee(EndpointSet {
            instances: vec![
                (ep(1), InstanceHealth::Unhealthy),
                (ep(2), InstanceHealth::Healthy),
                (ep(3), InstanceHealth::Unknown),
            ],
        }));
        let resolver = ServiceResolver::watched(live.clone());
        for _ in 0..20 {
            assert_eq!(resolver.resolve().unwrap().port, 2);
        }

        live.store(Arc::new(EndpointSet {
            instances: vec![(ep(1), InstanceHealth::Unhealthy)],
        }));
        assert!(resolver.resolve().is_none());
    }

    #[test]
    fn summary_counts_by_health() {
        let live = Arc::new(ArcSwap::from_pointee(EndpointSet {
            instances: vec![
                (ep(1), InstanceHealth::Healthy),
                (ep(2), InstanceHealth::Healthy),
                (ep(3), InstanceHealth::Unhealthy),
            ],
        }));
        let resolver = ServiceResolver::watched(live);
        let summary = resolver.summary();
        assert_eq!(summary.instances, 3);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.unhealthy, 1);

        let fixed = ServiceResolver::fixed(vec![ep(1)]);
        let summary = fixed.summary();
        assert_eq!(summary.unknown, 1);
    }
}

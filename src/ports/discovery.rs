use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::core::resolver::EndpointSet;

/// Port for the cluster-watching discovery driver.
///
/// The driver owns the watch machinery and publishes live membership into the
/// returned cell out-of-band; resolvers only ever read it, keeping the
/// request hot path free of discovery I/O.
pub trait EndpointDiscovery: Send + Sync + 'static {
    /// Cell holding the current membership of `cluster`. Repeated calls for
    /// the same cluster must return the same cell.
    fn subscribe(&self, cluster: &str) -> Arc<ArcSwap<EndpointSet>>;
}

/// In-process driver: clusters are seeded and updated programmatically.
/// Useful for tests and for deployments that push membership over an
/// internal API instead of a watcher.
#[derive(Default)]
pub struct StaticSetDiscovery {
    clusters: scc::HashMap<String, Arc<ArcSwap<EndpointSet>>>,
}

impl StaticSetDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published membership for a cluster.
    pub fn publish(&self, cluster: &str, set: EndpointSet) {
        self.subscribe(cluster).store(Arc::new(set));
    }
}

impl EndpointDiscovery for StaticSetDiscovery {
    fn subscribe(&self, cluster: &str) -> Arc<ArcSwap<EndpointSet>> {
        if let Some(cell) = self.clusters.read(cluster, |_, cell| cell.clone()) {
            return cell;
        }
        let cell = Arc::new(ArcSwap::from_pointee(EndpointSet::default()));
        match self.clusters.insert(cluster.to_string(), cell.clone()) {
            Ok(()) => cell,
            Err((key, _)) => self
                .clusters
                .read(&key, |_, cell| cell.clone())
                .unwrap_or(cell),
        }
    }
}

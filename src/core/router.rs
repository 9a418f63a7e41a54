//! Service/API routing table.
//!
//! Path templates are compiled once into anchored regexes and ordered per
//! service by specificity (fewest parameter segments first, compiled
//! expression as the tie-break). The published table is swapped atomically so
//! concurrent lookups always observe a complete table.
use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use regex::Regex;
use thiserror::Error;

use crate::config::models::{ApiConfig, ServiceConfig};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// One compiled API route.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub service: String,
    pub api: Arc<ApiConfig>,
    /// Anchored regex the incoming path is matched against.
    pub pattern: Regex,
    /// Parameter names in template order.
    pub param_names: Vec<String>,
    /// Number of parameter segments; lower sorts first.
    pub param_count: usize,
}

/// Successful lookup: the API plus captured path parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub service: String,
    pub api: Arc<ApiConfig>,
    pub params: Vec<(String, String)>,
}

/// Routing table mapping `(service, path)` to an API. Lookups are lock-free
/// reads of the currently published table; `register` replaces it wholesale.
pub struct ServiceRouter {
    table: ArcSwap<HashMap<String, Vec<CompiledRoute>>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Compile all routes and publish the new table atomically. Readers see
    /// either the previous table or the new one, never a mix.
    pub fn register(&self, services: &[ServiceConfig]) -> Result<(), RouterError> {
        let mut table: HashMap<String, Vec<CompiledRoute>> = HashMap::new();

        for service in services {
            let settings = service.settings();
            let mut routes = Vec::with_capacity(settings.apis.len());
            for api in &settings.apis {
                routes.push(compile_route(&settings.service, api)?);
            }
            routes.sort_by(|a, b| {
                a.param_count
                    .cmp(&b.param_count)
                    .then_with(|| a.pattern.as_str().cmp(b.pattern.as_str()))
            });
            table.insert(settings.service.clone(), routes);
        }

        self.table.store(Arc::new(table));
        Ok(())
    }

    /// First route whose regex matches the incoming path, in specificity
    /// order. Returns `None` for unknown services or unmatched paths.
    pub fn match_route(&self, service: &str, path: &str) -> Option<RouteMatch> {
        let table = self.table.load();
        let routes = table.get(service)?;
        for route in routes {
            if let Some(captures) = route.pattern.captures(path) {
                let params = route
                    .param_names
                    .iter()
                    .enumerate()
                    .filter_map(|(i, name)| {
                        captures
                            .get(i + 1)
                            .map(|m| (name.clone(), m.as_str().to_string()))
                    })
                    .collect();
                return Some(RouteMatch {
                    service: route.service.clone(),
                    api: route.api.clone(),
                    params,
                });
            }
        }
        None
    }

    /// All registered routes in match order, for diagnostics and the startup
    /// banner.
    pub fn list(&self) -> Vec<(String, String, String)> {
        let table = self.table.load();
        let mut out = Vec::new();
        let mut services: Vec<_> = table.keys().collect();
        services.sort();
        for service in services {
            for route in &table[service] {
                out.push((
                    service.clone(),
                    route.api.api.clone(),
                    route.pattern.as_str().to_string(),
                ));
            }
        }
        out
    }
}

impl Default for ServiceRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_route(service: &str, api: &ApiConfig) -> Result<CompiledRoute, RouterError> {
    let template = api.path.as_str();
    if !template.starts_with('/') {
        return Err(RouterError::InvalidTemplate {
            template: template.to_string(),
            reason: "must start with '/'".to_string(),
        });
    }

    let mut pattern = String::from("^");
    let mut param_names = Vec::new();

    for (i, segment) in template.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            if name.is_empty() {
                return Err(RouterError::InvalidTemplate {
                    template: template.to_string(),
                    reason: "empty parameter segment".to_string(),
                });
            }
            if param_names.iter().any(|existing| existing == name) {
                return Err(RouterError::InvalidTemplate {
                    template: template.to_string(),
                    reason: format!("duplicate parameter '{{{name}}}'"),
                });
            }
            param_names.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');

    let compiled = Regex::new(&pattern).map_err(|e| RouterError::InvalidTemplate {
        template: template.to_string(),
        reason: e.to_string(),
    })?;

    Ok(CompiledRoute {
        service: service.to_string(),
        api: Arc::new(api.clone()),
        param_count: param_names.len(),
        param_names,
        pattern: compiled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{ApiMethod, EndpointSpec, ServiceSettings};

    fn api(name: &str, path: &str) -> ApiConfig {
        ApiConfig {
            api: name.to_string(),
            path: path.to_string(),
            methods: [ApiMethod::GET].into_iter().collect(),
            mode: Default::default(),
            runtime: None,
            retry: Default::default(),
            auth_required: false,
            whitelist_request_headers: Vec::new(),
            whitelist_response_headers: Vec::new(),
            fallback_body: None,
            persist_sync: false,
        }
    }

    fn service(name: &str, apis: Vec<ApiConfig>) -> ServiceConfig {
        ServiceConfig::Http {
            settings: ServiceSettings {
                service: name.to_string(),
                endpoint: EndpointSpec::Simple {
                    endpoints: vec!["127.0.0.1:9001".to_string()],
                },
                connection_pool_size: 4,
                keep_alive_ms: 30_000,
                compression: false,
                auth: None,
                tracking_headers: false,
                apis,
            },
        }
    }

    #[test]
    fn literal_beats_parametric() {
        let router = ServiceRouter::new();
        router
            .register(&[service(
                "payments",
                vec![api("order_by_id", "/orders/{id}"), api("latest", "/orders/latest")],
            )])
            .unwrap();

        let hit = router.match_route("payments", "/orders/latest").unwrap();
        assert_eq!(hit.api.api, "latest");
        assert!(hit.params.is_empty());

        let hit = router.match_route("payments", "/orders/42").unwrap();
        assert_eq!(hit.api.api, "order_by_id");
        assert_eq!(hit.params, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn match_is_anchored() {
        let router = ServiceRouter::new();
        router
            .register(&[service("payments", vec![api("orders", "/orders")])])
            .unwrap();

        assert!(router.match_route("payments", "/orders").is_some());
        assert!(router.match_route("payments", "/orders/42").is_none());
        assert!(router.match_route("payments", "/v2/orders").is_none());
    }

    #[test]
    fn unknown_service_is_none() {
        let router = ServiceRouter::new();
        router
            .register(&[service("payments", vec![api("orders", "/orders")])])
            .unwrap();
        assert!(router.match_route("billing", "/orders").is_none());
    }

    #[test]
    fn multi_param_capture() {
        let router = ServiceRouter::new();
        router
            .register(&[service(
                "payments",
                vec![api("item", "/orders/{order_id}/items/{item_id}")],
            )])
            .unwrap();

        let hit = router
            .match_route("payments", "/orders/7/items/11")
            .unwrap();
        assert_eq!(
            hit.params,
            vec![
                ("order_id".to_string(), "7".to_string()),
                ("item_id".to_string(), "11".to_string())
            ]
        );
    }

    #[test]
    fn duplicate_param_rejected() {
        let router = ServiceRouter::new();
        let result = router.register(&[service(
            "payments",
            vec![api("bad", "/orders/{id}/items/{id}")],
        )]);
        assert!(result.is_err());
    }

    #[test]
    fn register_replaces_table() {
        let router = ServiceRouter::new();
        router
            .register(&[service("payments", vec![api("orders", "/orders")])])
            .unwrap();
        assert!(router.match_route("payments", "/orders").is_some());

        router
            .register(&[service("billing", vec![api("invoices", "/invoices")])])
            .unwrap();
        assert!(router.match_route("payments", "/orders").is_none());
        assert!(router.match_route("billing", "/invoices").is_some());
    }

    #[test]
    fn match_is_deterministic() {
        let router = ServiceRouter::new();
        router
            .register(&[service(
                "payments",
                vec![
                    api("a", "/x/{p}"),
                    api("b", "/x/{q}"),
                    api("c", "/x/literal"),
                ],
            )])
            .unwrap();

        // Same table, same path: always the same route. The two parametric
        // templates compile to the same expression; lexicographic tie-break
        // keeps the ordering stable across registrations.
        let first = router.match_route("payments", "/x/anything").unwrap();
        for _ in 0..10 {
            let again = router.match_route("payments", "/x/anything").unwrap();
            assert_eq!(again.api.api, first.api.api);
        }
        assert_eq!(
            router.match_route("payments", "/x/literal").unwrap().api.api,
            "c"
        );
    }
}

//! Upstream HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! One pooled client is built per upstream service so pool sizing, keep-alive
//! and TLS material stay service-scoped. Clients are rebuilt on config swap;
//! the previous generation drains as in-flight requests finish and its Arcs
//! release.
use std::{collections::HashMap, fs::File, io::BufReader, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use http::{header, HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::{
    config::models::{ClientConfig, RevolverConfig, ServiceConfig, TlsMaterial},
    ports::http_client::{UpstreamClient, UpstreamClientError, UpstreamClientResult},
};

/// Pooled client for one upstream service.
pub struct ServiceClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    user_agent: HeaderValue,
    compression: bool,
}

impl ServiceClient {
    /// Build the client for a service definition. TLS material (https
    /// services) is loaded from PEM files; the trust store is the native one
    /// plus an optional configured CA.
    pub fn new(client_config: &ClientConfig, service: &ServiceConfig) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let settings = service.settings();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(Duration::from_millis(
            client_config.connect_timeout_ms,
        )));

        let tls_config = build_tls_config(service.tls())?;

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.connection_pool_size)
            .pool_idle_timeout(Duration::from_millis(settings.keep_alive_ms))
            .build::<_, Full<Bytes>>(https_connector);

        let user_agent = HeaderValue::from_str(&client_config.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("Revolver-Gateway/1.0"));

        tracing::info!(
            service = %settings.service,
            pool_size = settings.connection_pool_size,
            keep_alive_ms = settings.keep_alive_ms,
            secure = service.is_secure(),
            "created upstream client"
        );

        Ok(Self {
            client,
            user_agent,
            compression: settings.compression,
        })
    }

    fn decorate(&self, req: &mut Request<Full<Bytes>>) {
        let headers = req.headers_mut();
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, self.user_agent.clone());
        }
        if self.compression && !headers.contains_key(header::ACCEPT_ENCODING) {
            headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
    }
}

#[async_trait]
impl UpstreamClient for ServiceClient {
    async fn execute(&self, req: Request<Bytes>) -> UpstreamClientResult<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();

        let host_value = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| {
                UpstreamClientError::InvalidRequest("outgoing URI has no authority".to_string())
            })?;
        parts.headers.insert(
            header::HOST,
            HeaderValue::from_str(&host_value)
                .map_err(|e| UpstreamClientError::InvalidRequest(e.to_string()))?,
        );

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let mut outgoing = Request::from_parts(parts, Full::new(body));
        self.decorate(&mut outgoing);

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                // The body is fully buffered, so upstream framing headers no
                // longer describe what we relay.
                parts.headers.remove(header::TRANSFER_ENCODING);
                let collected = body.collect().await.map_err(|e| {
                    UpstreamClientError::ConnectionError(format!(
                        "failed reading upstream body: {e}"
                    ))
                })?;
                Ok(Response::from_parts(parts, collected.to_bytes()))
            }
            Err(e) => {
                tracing::debug!(method = %method, uri = %uri, error = %e, "upstream request failed");
                Err(UpstreamClientError::ConnectionError(format!(
                    "request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}

fn build_tls_config(tls: Option<&TlsMaterial>) -> Result<rustls::ClientConfig> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if root_cert_store.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }

    let Some(tls) = tls else {
        return Ok(rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth());
    };

    if let Some(ca_path) = &tls.ca_path {
        let ca_file =
            File::open(ca_path).with_context(|| format!("failed to open CA file {ca_path}"))?;
        let mut reader = BufReader::new(ca_file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.context("failed parsing CA certificate")?;
            root_cert_store
                .add(cert)
                .context("failed adding CA certificate to trust store")?;
        }
    }

    let cert_file = File::open(&tls.cert_path)
        .with_context(|| format!("failed to open client cert {}", tls.cert_path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("failed parsing client certificate chain")?;

    let key_file = File::open(&tls.key_path)
        .with_context(|| format!("failed to open client key {}", tls.key_path))?;
    let key = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(key_file))
        .next()
        .transpose()
        .context("failed parsing client key")?
        .ok_or_else(|| eyre!("no PKCS#8 private key found in {}", tls.key_path))?;

    rustls::ClientConfig::builder()
        .with_root_certificates(root_cert_store)
        .with_client_auth_cert(certs, key.into())
        .context("failed building client TLS config")
}

/// Build one client per configured service.
pub fn build_service_clients(
    config: &RevolverConfig,
) -> Result<HashMap<String, Arc<dyn UpstreamClient>>> {
    let mut clients: HashMap<String, Arc<dyn UpstreamClient>> = HashMap::new();
    for service in &config.services {
        let client = ServiceClient::new(&config.client, service).with_context(|| {
            format!(
                "failed building client for service '{}'",
                service.settings().service
            )
        })?;
        clients.insert(service.settings().service.clone(), Arc::new(client));
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{EndpointSpec, ServiceSettings};

    fn http_service() -> ServiceConfig {
        ServiceConfig::Http {
            settings: ServiceSettings {
                service: "payments".to_string(),
                endpoint: EndpointSpec::Simple {
                    endpoints: vec!["127.0.0.1:9001".to_string()],
                },
                connection_pool_size: 4,
                keep_alive_ms: 30_000,
                compression: true,
                auth: None,
                tracking_headers: false,
                apis: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn client_creation_succeeds_for_plain_http() {
        let client = ServiceClient::new(&ClientConfig::default(), &http_service());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn decorate_adds_user_agent_and_encoding() {
        let client = ServiceClient::new(&ClientConfig::default(), &http_service()).unwrap();
        let mut req = Request::builder()
            .uri("http://127.0.0.1:9001/x")
            .body(Full::new(Bytes::new()))
            .unwrap();
        client.decorate(&mut req);
        assert_eq!(
            req.headers().get(header::USER_AGENT).unwrap(),
            "Revolver-Gateway/1.0"
        );
        assert_eq!(req.headers().get(header::ACCEPT_ENCODING).unwrap(), "gzip");
    }

    #[tokio::test]
    async fn execute_rejects_uri_without_authority() {
        let client = ServiceClient::new(&ClientConfig::default(), &http_service()).unwrap();
        let req = Request::builder()
            .uri("/relative")
            .body(Bytes::new())
            .unwrap();
        let result = client.execute(req).await;
        assert!(matches!(result, Err(UpstreamClientError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn build_all_creates_one_client_per_service() {
        let config = RevolverConfig {
            services: vec![http_service()],
            ..RevolverConfig::default()
        };
        let clients = build_service_clients(&config).unwrap();
        assert_eq!(clients.len(), 1);
        assert!(clients.contains_key("payments"));
    }
}

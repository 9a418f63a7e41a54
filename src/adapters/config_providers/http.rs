use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::sync::mpsc;

use crate::{
    config::{loader::parse_config_str, models::RevolverConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that fetches from an HTTP URL and polls for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl HttpConfigProvider {
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let provider = Self {
            url: url.clone(),
            client: client.clone(),
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        // Poll the source and signal when the payload digest moves.
        tokio::spawn(async move {
            let mut last_digest: Option<u64> = None;
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                match Self::fetch_raw(&client, &url).await {
                    Ok(raw) => {
                        let digest = hash_payload(&raw);
                        match last_digest {
                            Some(last) if last == digest => {}
                            Some(_) => {
                                tracing::info!("Remote configuration changed");
                                let _ = tx.try_send(());
                                last_digest = Some(digest);
                            }
                            None => {
                                last_digest = Some(digest);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to poll remote config: {}", e);
                    }
                }
            }
        });

        provider
    }

    async fn fetch_raw(client: &Client, url: &str) -> Result<String> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        resp.text().await.context("Failed to read config payload")
    }
}

fn hash_payload(raw: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<RevolverConfig> {
        let raw = Self::fetch_raw(&self.client, &self.url).await?;
        parse_config_str(&raw)
    }

    async fn digest(&self) -> Result<u64> {
        let raw = Self::fetch_raw(&self.client, &self.url).await?;
        Ok(hash_payload(&raw))
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        self.update_rx
            .lock()
            .expect("failed to lock update_rx mutex")
            .take()
            .expect("Watch can only be called once")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_http_config_provider() -> Result<()> {
        // Shared state to update config dynamically
        let payload = Arc::new(Mutex::new(
            "listen_addr: \"127.0.0.1:8080\"\n".to_string(),
        ));

        let state = payload.clone();
        let app = Router::new().route(
            "/config",
            get(move || async move { state.lock().unwrap().clone() }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{}/config", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Create provider with short poll interval
        let provider = HttpConfigProvider::new(url, Duration::from_millis(100));

        // Initial load
        let config = provider.load_config().await?;
        assert_eq!(config.listen_addr, "127.0.0.1:8080");

        // Watch for changes
        let mut rx = provider.watch();

        // Wait for the background task to perform its initial fetch
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Update mock server config
        {
            let mut lock = payload.lock().unwrap();
            *lock = "listen_addr: \"127.0.0.1:9090\"\n".to_string();
        }

        // Wait for notification
        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for config update");
        assert!(
            notification.unwrap().is_some(),
            "Channel closed unexpectedly"
        );

        // Verify new config loads
        let config = provider.load_config().await?;
        assert_eq!(config.listen_addr, "127.0.0.1:9090");

        Ok(())
    }

    #[tokio::test]
    async fn digest_is_stable_for_same_payload() {
        let app = Router::new().route("/config", get(|| async { "listen_addr: \"127.0.0.1:1\"\n" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider =
            HttpConfigProvider::new(format!("http://{addr}/config"), Duration::from_secs(600));
        let a = provider.digest().await.unwrap();
        let b = provider.digest().await.unwrap();
        assert_eq!(a, b);
    }
}

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::RevolverConfig;

/// Trait for configuration providers that can load and watch for configuration changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<RevolverConfig>;

    /// Content digest of the last loaded configuration, used to detect
    /// no-op reloads.
    async fn digest(&self) -> Result<u64>;

    /// Return a channel that signals when the configuration has changed.
    /// The receiver should trigger a reload by calling `load_config`.
    fn watch(&self) -> mpsc::Receiver<()>;
}

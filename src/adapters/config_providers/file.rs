use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::RevolverConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches for changes.
pub struct FileConfigProvider {
    path: PathBuf,
    // We keep the watcher alive by storing it, even though we don't access it directly after init
    _watcher: Option<notify::RecommendedWatcher>,
    // The channel receiver is moved out in `watch()`, so we store the sender to clone for the watcher
    update_tx: mpsc::Sender<()>,
    // We store the receiver in an Option so we can take it once
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path,
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let config_path = self.path.clone();
        let config_filename = config_path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path"))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::debug!("Config file changed: {:?}", event.kind);
                            // Try to send update signal, ignore if channel full or closed
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", watch_dir.display()))?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<RevolverConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", self.path.display()))?;
        load_config(path).await
    }

    async fn digest(&self) -> Result<u64> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        Ok(hasher.finish())
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        self.update_rx
            .lock()
            .expect("failed to lock update_rx mutex")
            .take()
            .expect("Watch can only be called once")
    }
}

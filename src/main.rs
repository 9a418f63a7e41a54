use std::{path::Path, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use clap::Parser;
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use revolver::{
    adapters::{
        build_service_clients, CallbackDispatcher, FileConfigProvider, GatewayHandler,
        HttpConfigProvider, InMemoryPersistenceProvider, RedisPersistenceProvider,
    },
    config::{
        load_config,
        models::{MailboxConfig, RevolverConfig},
        ConfigValidator,
    },
    core::Gateway,
    metrics,
    ports::{config_provider::ConfigProvider, persistence::PersistenceProvider},
    tracing_setup,
    utils::GracefulShutdown,
};
use tokio::sync::mpsc;
use tower_http::compression::CompressionLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

fn create_config_provider(config_path: &str) -> Result<Arc<dyn ConfigProvider>> {
    if config_path.starts_with("http://") || config_path.starts_with("https://") {
        Ok(Arc::new(HttpConfigProvider::new(
            config_path.to_string(),
            Duration::from_secs(10),
        )))
    } else {
        Ok(Arc::new(FileConfigProvider::new(config_path)?))
    }
}

async fn build_persistence(
    config: &RevolverConfig,
) -> Result<(Arc<dyn PersistenceProvider>, Option<tokio::task::JoinHandle<()>>)> {
    match &config.mailbox {
        MailboxConfig::InMemory {
            ttl_seconds,
            sweep_interval_seconds,
        } => {
            let provider = Arc::new(InMemoryPersistenceProvider::new(*ttl_seconds));
            let sweeper = InMemoryPersistenceProvider::spawn_sweeper(
                provider.clone(),
                Duration::from_secs((*sweep_interval_seconds).max(1)),
            );
            Ok((provider, Some(sweeper)))
        }
        MailboxConfig::Redis { url, ttl_seconds } => {
            let provider = RedisPersistenceProvider::connect(url, *ttl_seconds)
                .await
                .map_err(|e| eyre!("failed connecting redis mailbox: {e}"))?;
            Ok((Arc::new(provider), None))
        }
    }
}

fn build_gateway(
    config: Arc<RevolverConfig>,
    persistence: Arc<dyn PersistenceProvider>,
    callback_tx: mpsc::Sender<String>,
) -> Result<Gateway> {
    let clients = build_service_clients(&config).context("Failed building upstream clients")?;
    Gateway::new(config, clients, persistence, callback_tx, None)
        .context("Failed assembling gateway")
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path).await;
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal server startup
        }
        _ => unreachable!(),
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default reported an error: {:?}. \
            This can happen if a provider was already installed.",
            e
        );
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics();

    tracing::info!("Loading initial configuration from {config_path}");

    let config_provider =
        create_config_provider(&config_path).context("Failed to create config provider")?;

    let initial_config = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ConfigValidator::validate(&initial_config)
        .map_err(|e| eyre!("Invalid configuration: {e}"))?;

    let initial_config = Arc::new(initial_config);

    let (persistence, sweeper_handle) = build_persistence(&initial_config).await?;

    let dispatcher = Arc::new(CallbackDispatcher::new(
        persistence.clone(),
        initial_config.callback_timeout_ms(),
        initial_config.callback.max_attempts,
    ));
    let (callback_tx, dispatcher_handles) = dispatcher.spawn(
        initial_config.callback.queue_depth,
        initial_config.callback.workers,
    );

    let gateway = build_gateway(
        initial_config.clone(),
        persistence.clone(),
        callback_tx.clone(),
    )?;
    gateway.log_service_map();
    let gateway_holder = Arc::new(ArcSwap::from_pointee(gateway));

    // Reload source: the dynamic config URL when enabled, else the initial
    // provider (file watch or the CLI-supplied URL).
    let reload_provider: Arc<dyn ConfigProvider> = if initial_config.dynamic_config {
        match &initial_config.dynamic_config_url {
            Some(url) => Arc::new(HttpConfigProvider::new(
                url.clone(),
                Duration::from_secs(initial_config.config_poll_interval_seconds.max(1)),
            )),
            None => config_provider.clone(),
        }
    } else {
        config_provider.clone()
    };

    // Config watcher task: validate, rebuild and swap on real changes.
    {
        let gateway_holder = gateway_holder.clone();
        let persistence = persistence.clone();
        let callback_tx = callback_tx.clone();
        let reload_provider_task = reload_provider.clone();
        let mut notify_rx = reload_provider.watch();

        tokio::spawn(async move {
            tracing::info!("Config watcher task started");
            let mut last_digest = reload_provider_task.digest().await.ok();
            while notify_rx.recv().await.is_some() {
                match reload_provider_task.digest().await {
                    Ok(digest) if last_digest == Some(digest) => {
                        tracing::info!("Configuration digest unchanged, skipping rebuild");
                        continue;
                    }
                    Ok(digest) => last_digest = Some(digest),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed computing config digest");
                    }
                }

                let new_config = match reload_provider_task.load_config().await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(error = %e, "failed loading new configuration, keeping old");
                        continue;
                    }
                };
                if let Err(e) = ConfigValidator::validate(&new_config) {
                    tracing::error!(error = %e, "new configuration invalid, keeping old");
                    continue;
                }

                match build_gateway(
                    Arc::new(new_config),
                    persistence.clone(),
                    callback_tx.clone(),
                ) {
                    Ok(gateway) => {
                        gateway.log_service_map();
                        gateway_holder.store(Arc::new(gateway));
                        tracing::info!("Configuration reloaded, gateway swapped");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed rebuilding gateway, keeping old");
                    }
                }
            }
            tracing::info!("Config watcher task is shutting down");
        });
    }

    let graceful_shutdown = Arc::new(GracefulShutdown::new(Duration::from_secs(
        initial_config.shutdown_grace_seconds,
    )));
    {
        let signal_handler_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    let handler = Arc::new(GatewayHandler::new(
        gateway_holder.clone(),
        persistence.clone(),
        callback_tx.clone(),
    ));
    let app = GatewayHandler::router(handler.clone()).layer(CompressionLayer::new());

    let addr: std::net::SocketAddr = initial_config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Revolver gateway listening on {} ({} services registered)",
        addr,
        initial_config.services.len()
    );

    let server_result = tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("Server error")
        }
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", reason);
            // Stop accepting, then drain in-flight requests up to the grace.
            graceful_shutdown.drain(|| handler.active_requests()).await;
            Ok(())
        }
    };

    for handle in dispatcher_handles {
        handle.abort();
    }
    if let Some(sweeper) = sweeper_handle {
        sweeper.abort();
    }
    tracing::info!("Revolver gateway stopped");

    server_result
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Summary:");
            println!("   Listen address: {}", config.listen_addr);
            println!("   Services: {}", config.services.len());
            let api_count: usize = config
                .services
                .iter()
                .map(|s| s.settings().apis.len())
                .sum();
            println!("   APIs: {api_count}");
            println!("   Callback timeout: {}ms", config.callback_timeout_ms());
            println!("   Dynamic config: {}", config.dynamic_config);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("Common fixes:");
            println!("   - Every service needs at least one API");
            println!("   - Path templates must start with '/' and use unique {{param}} names");
            println!("   - Verify listen address format (e.g., '127.0.0.1:8080')");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Revolver gateway configuration

listen_addr: "127.0.0.1:8080"

global:
  timeout_ms: 1000
  concurrency: 8
  circuit:
    error_threshold_percent: 50
    request_volume: 20
    sleep_window_ms: 5000

mailbox:
  type: in_memory
  ttl_seconds: 3600

callback_timeout_ms: 3000

services:
  - type: http
    service: payments
    endpoint:
      type: simple
      endpoints:
        - "127.0.0.1:9001"
    apis:
      - api: orders
        path: "/orders/{id}"
        methods: [GET]
      - api: create_order
        path: "/orders"
        methods: [POST]
        mode: polling
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'revolver serve --config {config_path}' to start the gateway");
    Ok(())
}

//! Revolver - a resilient HTTP gateway for fleets of upstream services.
//!
//! Clients address upstreams by logical service and API name; the gateway
//! resolves an endpoint, pushes the call through a per-API isolation
//! compartment (concurrency cap, time budget, circuit breaker, optional
//! fallback) and supports three interaction modes over one wire contract:
//! synchronous, asynchronous-polled and asynchronous-callback. Async requests
//! are persisted in a TTL-bound mailbox keyed by a client-supplied request id,
//! and completed callback-mode responses are POSTed back to the caller with
//! bounded retries.
//!
//! # Quick Example
//! ```no_run
//! use std::{collections::HashMap, sync::Arc};
//!
//! use revolver::{
//!     adapters::{build_service_clients, InMemoryPersistenceProvider},
//!     config::load_config,
//!     core::Gateway,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config("config.yaml").await?);
//! let clients = build_service_clients(&config)?;
//! let persistence = Arc::new(InMemoryPersistenceProvider::new(3600));
//! let (callback_tx, _callback_rx) = tokio::sync::mpsc::channel(1024);
//! let gateway = Gateway::new(config, clients, persistence, callback_tx, None)?;
//! # let _ = gateway; Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations)
//! while keeping business logic inside `core`. The process owns one `Gateway`
//! value behind an `ArcSwap`; dynamic config reloads build a fresh generation
//! and swap it atomically.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error type
//! (`GatewayError`, `BulkheadError`, `PersistenceError`).
//!
//! # Concurrency & Data Structures
//! Shared mutable maps use `scc::HashMap`; published read-mostly state (the
//! routing table, the gateway generation) is swapped via `arc-swap`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{CallbackDispatcher, GatewayHandler},
    core::{Gateway, GatewayError},
    ports::persistence::PersistenceProvider,
    utils::GracefulShutdown,
};

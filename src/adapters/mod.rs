pub mod callback;
pub mod config_providers;
pub mod http_client;
pub mod http_handler;
pub mod memory_store;
pub mod redis_store;

pub use callback::CallbackDispatcher;
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use http_client::{build_service_clients, ServiceClient};
pub use http_handler::GatewayHandler;
pub use memory_store::InMemoryPersistenceProvider;
pub use redis_store::RedisPersistenceProvider;

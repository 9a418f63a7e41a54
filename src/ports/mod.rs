pub mod config_provider;
pub mod discovery;
pub mod http_client;
pub mod persistence;

pub mod breaker;
pub mod bulkhead;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod router;

pub use breaker::{CircuitBreaker, CircuitState};
pub use bulkhead::Bulkhead;
pub use engine::ExecutionEngine;
pub use error::GatewayError;
pub use gateway::Gateway;
pub use router::ServiceRouter;

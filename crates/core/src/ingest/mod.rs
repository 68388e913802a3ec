pub mod circuit_breaker;
pub mod enrich;
pub mod error;
pub mod interrupt;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod types;

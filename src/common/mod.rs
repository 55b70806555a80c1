//! Shared fault-tolerance helpers

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerConfig, BreakerState, FetchBreaker};

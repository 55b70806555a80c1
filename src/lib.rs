//! Crypto Price Alerts
//!
//! A stateful alert engine for a single instrument's price stream: volatility
//! adjusted multi-timeframe spikes, regime breakouts and compressions, trend
//! shifts and anchor take-profit / max-loss bands, with cooldowns, hourly
//! caps and a throttle/coalescing layer for secondary alerts.

pub mod anchor;
pub mod clock;
pub mod common;
pub mod config;
pub mod data;
pub mod detector;
pub mod engine;
pub mod feed;
pub mod history;
pub mod indicators;
pub mod notify;
pub mod regime;
pub mod service;
pub mod trend;
pub mod types;
pub mod volatility;

pub use config::Settings;
pub use engine::{AlertEngine, EngineStats};
pub use service::{AlertService, ServiceHandle};
pub use types::*;

//! Configuration for the lending engine.
//!
//! - Engine runtime configuration (profiles, monitor cadence, fetch limits)
//! - Price freshness and routing tolerance

mod engine;

pub use engine::{EngineConfig, MonitorConfig, PriceConfig};

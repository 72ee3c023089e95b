//! Tiered request gateway.
//!
//! Routes inbound HTTP traffic to registered backend services across two
//! tiers (edge functions and containers), with per-instance health
//! probing, per-service circuit breaking, round-robin load balancing, and
//! a bidirectional relay for upgraded streaming connections.

pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod store;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use proxy::Gateway;

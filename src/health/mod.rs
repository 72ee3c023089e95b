//! Health monitoring for registered services.
//!
//! Keeps per-instance health state updated by periodic probe tasks,
//! with threshold-based transitions read by the load balancer and the
//! routing decision engine.

mod monitor;
mod status;

pub use monitor::MonitorSet;
pub use status::{HealthStatus, HealthStore, InstanceHealth};

//! Service registrations and their lifecycle.

mod registry;
mod service_store;

pub use registry::Registry;
pub use service_store::{
    HealthCheckConfig, InstanceEndpoint, Middleware, ServiceRegistration, ServiceStore, Tier,
};

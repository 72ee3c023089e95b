//! Request-path components: routing decisions, instance selection, circuit
//! breaking, forwarding, and stream relay, wired together by the gateway.

pub mod breaker;
pub mod forward;
pub mod gateway;
pub mod router;
pub mod stream;
pub mod upstream;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitState};
pub use forward::Forwarder;
pub use gateway::Gateway;
pub use router::{
    RequestProfile, RoutingDecision, RoutingEngine, RoutingRule, RoutingStrategy, TierHealth,
};
pub use stream::StreamProxy;
pub use upstream::LoadBalancer;

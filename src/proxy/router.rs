//! Tier routing decisions for incoming HTTP requests.
//!
//! Evaluates an ordered rule list top-to-bottom (first match wins), then
//! falls back to the configured strategy. The `intelligent` strategy is a
//! fixed priority tree over request characteristics, so routing stays
//! deterministic for a given request shape.

use hyper::{HeaderMap, Method};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::Tier;

/// Payload size above which the intelligent strategy routes to the
/// container tier.
const MAX_EDGE_PAYLOAD_BYTES: u64 = 1024 * 1024;

/// Path segments that suggest an authentication flow (edge-friendly).
const AUTH_SEGMENTS: &[&str] = &["auth", "login", "logout", "token", "session", "oauth"];

/// Path segments that suggest heavy compute (container-bound).
const COMPUTE_SEGMENTS: &[&str] = &[
    "compute", "process", "transform", "render", "batch", "convert", "analyze",
];

/// A single routing rule matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleMatcher {
    /// Path prefix with segment-boundary semantics; a trailing `*` turns
    /// the pattern into a plain prefix wildcard.
    Path { pattern: String },
    /// Any of the listed methods (case-insensitive).
    Method { methods: Vec<String> },
    /// Exact header equality.
    Header { name: String, value: String },
    /// Presence of a query parameter.
    QueryParam { name: String },
}

impl RuleMatcher {
    /// Matcher kind used in decision reason codes.
    pub fn kind(&self) -> &'static str {
        match self {
            RuleMatcher::Path { .. } => "path",
            RuleMatcher::Method { .. } => "method",
            RuleMatcher::Header { .. } => "header",
            RuleMatcher::QueryParam { .. } => "query-param",
        }
    }

    fn matches(&self, profile: &RequestProfile) -> bool {
        match self {
            RuleMatcher::Path { pattern } => path_matches(pattern, &profile.path),
            RuleMatcher::Method { methods } => methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(profile.method.as_str())),
            RuleMatcher::Header { name, value } => profile
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v == value)
                .unwrap_or(false),
            RuleMatcher::QueryParam { name } => query_has_param(profile.query.as_deref(), name),
        }
    }
}

/// One routing rule: a matcher and a destination tier.
///
/// Immutable after load; the rule list is evaluated in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "match")]
    pub matcher: RuleMatcher,
    pub tier: Tier,
}

/// Strategy applied when no rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RoutingStrategy {
    EdgeFirst,
    ContainerFirst,
    /// Pseudo-random split, independent per request.
    Split {
        #[serde(default = "default_edge_percent")]
        edge_percent: u8,
    },
    /// Deterministic decision tree over request characteristics.
    Intelligent,
}

fn default_edge_percent() -> u8 {
    50
}

/// Request characteristics the engine decides on, computed once per request.
#[derive(Debug, Clone)]
pub struct RequestProfile {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub content_length: u64,
}

/// Aggregate selectable fraction per tier, read from the health store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierHealth {
    pub edge: f64,
    pub container: f64,
}

/// Ephemeral per-request routing outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub tier: Tier,
    /// Human-readable reason code for observability.
    pub reason: String,
    /// Index of the matched rule, when a rule decided.
    pub rule_index: Option<usize>,
}

impl RoutingDecision {
    fn strategy(tier: Tier, reason: &str) -> Self {
        Self {
            tier,
            reason: reason.to_string(),
            rule_index: None,
        }
    }
}

/// Evaluates rules and strategy to pick a destination tier.
pub struct RoutingEngine {
    rules: Vec<RoutingRule>,
    strategy: RoutingStrategy,
}

impl RoutingEngine {
    pub fn new(rules: Vec<RoutingRule>, strategy: RoutingStrategy) -> Self {
        Self { rules, strategy }
    }

    /// Picks a destination tier for the request.
    ///
    /// Rules are evaluated top-to-bottom and the first match wins; only
    /// when none matches does the configured strategy run.
    pub fn decide(&self, profile: &RequestProfile, tier_health: TierHealth) -> RoutingDecision {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matcher.matches(profile) {
                return RoutingDecision {
                    tier: rule.tier,
                    reason: format!("rule-match:{}", rule.matcher.kind()),
                    rule_index: Some(index),
                };
            }
        }

        match &self.strategy {
            RoutingStrategy::EdgeFirst => {
                RoutingDecision::strategy(Tier::Edge, "strategy:edge-first")
            }
            RoutingStrategy::ContainerFirst => {
                RoutingDecision::strategy(Tier::Container, "strategy:container-first")
            }
            RoutingStrategy::Split { edge_percent } => {
                let draw: u8 = rand::thread_rng().gen_range(0..100);
                if draw < *edge_percent {
                    RoutingDecision::strategy(Tier::Edge, "split:edge")
                } else {
                    RoutingDecision::strategy(Tier::Container, "split:container")
                }
            }
            RoutingStrategy::Intelligent => intelligent_decision(profile, tier_health),
        }
    }
}

/// Fixed priority tree; ties break by evaluation order, never randomness.
fn intelligent_decision(profile: &RequestProfile, tier_health: TierHealth) -> RoutingDecision {
    if profile.content_length > MAX_EDGE_PAYLOAD_BYTES {
        return RoutingDecision::strategy(Tier::Container, "large-payload");
    }
    if is_mutating(&profile.method) {
        return RoutingDecision::strategy(Tier::Container, "mutating-method");
    }
    let cacheable_method = profile.method == Method::GET || profile.method == Method::HEAD;
    let has_private_headers = profile.headers.contains_key(hyper::header::AUTHORIZATION)
        || profile.headers.contains_key(hyper::header::COOKIE);
    if cacheable_method && !has_private_headers {
        return RoutingDecision::strategy(Tier::Edge, "cacheable-get");
    }
    if path_has_segment(&profile.path, AUTH_SEGMENTS) {
        return RoutingDecision::strategy(Tier::Edge, "auth-path");
    }
    if path_has_segment(&profile.path, COMPUTE_SEGMENTS) {
        return RoutingDecision::strategy(Tier::Container, "compute-path");
    }
    // Fall back to comparative tier health: prefer the less degraded pool.
    if tier_health.container < tier_health.edge {
        RoutingDecision::strategy(Tier::Edge, "tier-health:edge")
    } else if tier_health.edge < tier_health.container {
        RoutingDecision::strategy(Tier::Container, "tier-health:container")
    } else {
        RoutingDecision::strategy(Tier::Edge, "tier-health:balanced")
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Prefix matching respecting segment boundaries.
/// `/api` matches `/api`, `/api/`, `/api/users` but NOT `/apikeys`.
/// A trailing `*` makes the remainder a plain prefix: `/api/v*`.
fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    if path == pattern {
        return true;
    }
    if path.starts_with(pattern) {
        if pattern.ends_with('/') {
            return true;
        }
        return path[pattern.len()..].starts_with('/');
    }
    false
}

fn path_has_segment(path: &str, keywords: &[&str]) -> bool {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .any(|segment| keywords.iter().any(|k| segment.contains(k)))
}

fn query_has_param(query: Option<&str>, name: &str) -> bool {
    let Some(query) = query else {
        return false;
    };
    query
        .split('&')
        .map(|pair| pair.split_once('=').map(|(k, _)| k).unwrap_or(pair))
        .any(|key| key == name)
}

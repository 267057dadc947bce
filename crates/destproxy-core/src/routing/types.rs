//! Routing decision types.

use serde::{Deserialize, Serialize};

/// How a request will be forwarded. Assigned once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutingStrategy {
    /// Resolve the destination, inject auth, forward.
    Proxy,
    /// Forward without auth injection.
    Passthrough,
    /// No route could be determined.
    Unknown,
}

/// What to do when the incoming request names no destination or URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPolicy {
    /// Forward unmodified to the override URL, if any.
    #[default]
    Passthrough,
    /// Fall back to overrides; mark the request unroutable if they are empty too.
    Reject,
}

/// Process-level routing overrides (CLI flags or config file).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOverrides {
    /// Destination to use regardless of request headers.
    #[serde(default)]
    pub destination: Option<String>,
    /// Target URL to use regardless of request headers.
    #[serde(default)]
    pub mcp_url: Option<String>,
}

/// Immutable per-request routing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    strategy: RoutingStrategy,
    destination: Option<String>,
    explicit_target_url: Option<String>,
    reason: String,
}

impl RoutingDecision {
    /// A proxied route. Returns `Unknown` if both targets are missing, so a
    /// `Proxy` decision always carries at least one of them.
    pub fn proxy(
        destination: Option<String>,
        explicit_target_url: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        if destination.is_none() && explicit_target_url.is_none() {
            return Self::unknown("no destination or target URL available");
        }
        Self {
            strategy: RoutingStrategy::Proxy,
            destination,
            explicit_target_url,
            reason: reason.into(),
        }
    }

    /// A passthrough route, optionally pinned to an override URL.
    pub fn passthrough(explicit_target_url: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            strategy: RoutingStrategy::Passthrough,
            destination: None,
            explicit_target_url,
            reason: reason.into(),
        }
    }

    /// An unroutable request.
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            strategy: RoutingStrategy::Unknown,
            destination: None,
            explicit_target_url: None,
            reason: reason.into(),
        }
    }

    /// Forwarding strategy.
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Destination name, present only for `Proxy`.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// URL that overrides the destination's service URL.
    pub fn explicit_target_url(&self) -> Option<&str> {
        self.explicit_target_url.as_deref()
    }

    /// Diagnostic justification.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

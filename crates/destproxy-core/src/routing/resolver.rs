//! Header + override resolution into a [`RoutingDecision`].

use super::types::{RoutingDecision, RoutingOverrides, RoutingPolicy};
use http::HeaderMap;
use tracing::debug;

/// Header naming the destination.
pub const DESTINATION_HEADER: &str = "x-btp-destination";
/// Alternate destination header accepted for compatibility.
pub const DESTINATION_HEADER_ALIAS: &str = "x-mcp-destination";
/// Header carrying an explicit target URL.
pub const TARGET_URL_HEADER: &str = "x-mcp-url";

/// First value of a header, trimmed; empty values count as absent.
pub fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(name)
        .iter()
        .next()
        .and_then(|value| value.to_str().ok())
        .and_then(non_empty)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Turns request headers and process overrides into a routing decision.
#[derive(Debug, Clone, Default)]
pub struct RoutingResolver {
    overrides: RoutingOverrides,
    policy: RoutingPolicy,
}

impl RoutingResolver {
    /// Create a resolver with the given overrides and missing-route policy.
    pub fn new(overrides: RoutingOverrides, policy: RoutingPolicy) -> Self {
        let overrides = RoutingOverrides {
            destination: overrides.destination.as_deref().and_then(non_empty),
            mcp_url: overrides.mcp_url.as_deref().and_then(non_empty),
        };
        Self { overrides, policy }
    }

    /// Process-level overrides in effect.
    pub fn overrides(&self) -> &RoutingOverrides {
        &self.overrides
    }

    /// Classify one request. Pure and infallible.
    pub fn resolve(&self, headers: &HeaderMap) -> RoutingDecision {
        let header_destination = header_value(headers, DESTINATION_HEADER)
            .or_else(|| header_value(headers, DESTINATION_HEADER_ALIAS));
        let header_url = header_value(headers, TARGET_URL_HEADER);
        let in_request = header_destination.is_some() || header_url.is_some();

        let destination = self.overrides.destination.clone().or(header_destination);
        let target_url = self.overrides.mcp_url.clone().or(header_url);

        let decision = if in_request {
            let reason = match (&destination, &target_url) {
                (Some(_), Some(_)) => "destination with explicit target URL",
                (Some(_), None) => "destination from request",
                _ => "explicit target URL without destination",
            };
            RoutingDecision::proxy(destination, target_url, reason)
        } else {
            match self.policy {
                RoutingPolicy::Passthrough => RoutingDecision::passthrough(
                    self.overrides.mcp_url.clone(),
                    "no routing information in request",
                ),
                RoutingPolicy::Reject => {
                    if destination.is_some() || target_url.is_some() {
                        RoutingDecision::proxy(destination, target_url, "routing from overrides")
                    } else {
                        RoutingDecision::unknown("no destination in request or overrides")
                    }
                }
            }
        };

        debug!(
            strategy = ?decision.strategy(),
            destination = ?decision.destination(),
            target_url = ?decision.explicit_target_url(),
            reason = decision.reason(),
            "Resolved routing decision"
        );
        decision
    }
}

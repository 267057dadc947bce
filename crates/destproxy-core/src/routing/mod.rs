//! Request routing: decides whether a request is proxied with injected auth,
//! passed through, or unroutable.

pub mod resolver;
pub mod types;

pub use resolver::{
    DESTINATION_HEADER, DESTINATION_HEADER_ALIAS, RoutingResolver, TARGET_URL_HEADER, header_value,
};
pub use types::{RoutingDecision, RoutingOverrides, RoutingPolicy, RoutingStrategy};

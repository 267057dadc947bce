//! Authenticated forwarding: JSON-RPC envelopes, request construction, the
//! upstream send seam and the orchestrating entry point.

pub mod builder;
pub mod messages;
pub mod orchestrator;
pub mod redact;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_support;

pub use builder::{InboundContext, OutboundRequest, RequestBuilder, join_url, streaming_endpoint};
pub use messages::{
    CIRCUIT_OPEN_CODE, GENERIC_ERROR_CODE, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR_CODE,
};
pub use orchestrator::{ProxyOrchestrator, decode_body};
pub use redact::{redact_headers, redact_json};
pub use upstream::{DEFAULT_REQUEST_TIMEOUT, HttpUpstream, UpstreamClient, UpstreamResponse};

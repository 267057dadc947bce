//! Destination authentication: broker seam, broker registry, token cache and
//! the service-key broker.

pub mod broker;
pub mod key_paths;
pub mod registry;
pub mod service_key;
pub mod token_cache;

pub use broker::{AuthBroker, AuthBrokerFactory, BrokerError, ConnectionConfig, SessionSeed};
pub use key_paths::{default_service_key_dirs, describe_broker_failure, service_key_file_name};
pub use registry::AuthBrokerRegistry;
pub use service_key::{DestinationKind, ServiceKey, ServiceKeyBroker, ServiceKeyBrokerFactory};
pub use token_cache::{DEFAULT_TOKEN_TTL, TokenCache, TokenCacheEntry};

//! Routes API requests that the local server cannot serve to a peer server
//! that can, based on a cluster-wide catalog of which server decodes which
//! resource versions.

pub mod catalog;
pub mod endpoints;
pub mod errors;
pub mod forward;
pub mod handler;
pub mod index;
pub mod metrics_defs;
pub mod selector;

pub use catalog::{CatalogConfig, CatalogEvent, CatalogWatcher};
pub use endpoints::{EndpointResolver, StaticEndpoints};
pub use errors::{ProxyError, SyncError};
pub use forward::{DEFAULT_PEER_SERVER_NAME, PEER_PROXIED_HEADER, PeerTlsConfig, PeerTransport};
pub use handler::{PeerProxy, PeerProxyBuilder, PeerProxyService};
pub use index::{Serviceability, ServiceabilityIndex};
pub use selector::{PeerSelector, RandomSelector, RoundRobinSelector};

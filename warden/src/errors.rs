use crate::config::ConfigError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum WardenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not start authorization: {0}")]
    Resolver(#[from] authz::ResolverError),
    #[error("invalid authorization config: {0}")]
    AuthzConfig(#[from] authz::ConfigError),
    #[error("could not set up peer proxy: {0}")]
    Proxy(#[from] peer_proxy::ProxyError),
    #[error("could not set up catalog watcher: {0}")]
    Catalog(#[from] peer_proxy::catalog::CatalogError),
    #[error("invalid local backend URL: {0}")]
    InvalidBackend(#[from] http::uri::InvalidUri),
    #[error("local backend URL needs a scheme and an authority: {0}")]
    IncompleteBackend(String),
    #[error("could not initialize telemetry: {0}")]
    Telemetry(String),
}

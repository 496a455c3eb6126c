use std::collections::HashMap;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EndpointError {
    #[error("no endpoint known for server {0}")]
    Unknown(String),
    #[error("endpoint {endpoint:?} of server {server} is not host:port")]
    Invalid { server: String, endpoint: String },
}

/// Maps a server identity to the `host:port` its peers should dial.
pub trait EndpointResolver: Send + Sync {
    fn endpoint(&self, server_id: &str) -> Result<String, EndpointError>;
}

/// Endpoints fixed at startup from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticEndpoints {
    endpoints: HashMap<String, String>,
}

impl StaticEndpoints {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self { endpoints }
    }
}

impl EndpointResolver for StaticEndpoints {
    fn endpoint(&self, server_id: &str) -> Result<String, EndpointError> {
        self.endpoints
            .get(server_id)
            .cloned()
            .ok_or_else(|| EndpointError::Unknown(server_id.to_string()))
    }
}

/// Accepts `host:port` and `[v6]:port` with a non-empty host.
pub fn is_host_port(endpoint: &str) -> bool {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return false;
    };
    let host = match host.strip_prefix('[') {
        Some(v6) => match v6.strip_suffix(']') {
            Some(v6) => v6,
            None => return false,
        },
        // a bare IPv6 address needs brackets
        None if host.contains(':') => return false,
        None => host,
    };
    !host.is_empty() && port.parse::<u16>().is_ok()
}

/// Resolves and validates, treating malformed endpoints like unknown ones.
pub(crate) fn resolve(resolver: &dyn EndpointResolver, server_id: &str) -> Result<String, EndpointError> {
    let endpoint = resolver.endpoint(server_id)?;
    if !is_host_port(&endpoint) {
        return Err(EndpointError::Invalid {
            server: server_id.to_string(),
            endpoint,
        });
    }
    Ok(endpoint)
}

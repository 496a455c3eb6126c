use authz::WebhookRetryBackoff;
use peer_proxy::endpoints::is_host_port;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("server_id cannot be empty")]
    EmptyServerId,
    #[error("{0} must be greater than 0")]
    ZeroInterval(&'static str),
    #[error("client_cert_file, client_key_file and peer_ca_file must be set together")]
    IncompletePeerTls,
    #[error("peer endpoint {endpoint:?} of server {server} is not host:port")]
    InvalidPeerEndpoint { server: String, endpoint: String },
    #[error("invalid {field} URL: {url}")]
    InvalidUrl { field: &'static str, url: String },
    #[error("invalid sentry DSN")]
    InvalidSentryDsn,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_listener() -> Listener {
    Listener {
        host: "0.0.0.0".into(),
        port: 6443,
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 9090,
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

fn default_reload_interval_secs() -> u64 {
    60
}

fn default_privileged_groups() -> Vec<String> {
    vec![authz::builtin::SYSTEM_PRIVILEGED_GROUP.to_string()]
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct AuthorizationConfig {
    /// Structured authorization configuration, watched for changes.
    pub config_file: PathBuf,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// Authorizer types every version of the file must contain.
    #[serde(default)]
    pub required_types: Vec<String>,
    #[serde(default = "default_privileged_groups")]
    pub privileged_groups: Vec<String>,
    #[serde(default)]
    pub webhook_retry_backoff: WebhookRetryBackoff,
}

fn default_relist_interval_secs() -> u64 {
    10
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct CatalogSettings {
    pub url: String,
    #[serde(default = "default_relist_interval_secs")]
    pub relist_interval_secs: u64,
    #[serde(default = "default_catalog_timeout_secs")]
    pub request_timeout_secs: u64,
    pub bearer_token_file: Option<PathBuf>,
}

fn default_catalog_timeout_secs() -> u64 {
    30
}

fn default_server_name() -> String {
    peer_proxy::DEFAULT_PEER_SERVER_NAME.to_string()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PeerProxyConfig {
    /// Without a client identity peers are dialed over plain TCP.
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    pub peer_ca_file: Option<PathBuf>,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    pub catalog: CatalogSettings,
    /// Server id -> `host:port`.
    #[serde(default)]
    pub peer_endpoints: HashMap<String, String>,
    /// Source addresses allowed to mark requests as already proxied, on top
    /// of the IP addresses in `peer_endpoints`.
    #[serde(default)]
    pub trusted_peer_addresses: Vec<IpAddr>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LocalBackendConfig {
    pub url: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct Config {
    pub server_id: String,
    #[serde(default = "default_listener")]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    pub authorization: AuthorizationConfig,
    pub peer_proxy: PeerProxyConfig,
    pub local_backend: LocalBackendConfig,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

fn validate_url(field: &'static str, url: &str) -> Result<(), ValidationError> {
    Url::parse(url).map(|_| ()).map_err(|_| ValidationError::InvalidUrl {
        field,
        url: url.to_string(),
    })
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.server_id.is_empty() {
            return Err(ValidationError::EmptyServerId);
        }
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.authorization.reload_interval_secs == 0 {
            return Err(ValidationError::ZeroInterval("reload_interval_secs"));
        }

        let peer = &self.peer_proxy;
        let tls_files = [
            peer.client_cert_file.is_some(),
            peer.client_key_file.is_some(),
            peer.peer_ca_file.is_some(),
        ];
        if tls_files.contains(&true) && tls_files.contains(&false) {
            return Err(ValidationError::IncompletePeerTls);
        }
        if peer.catalog.relist_interval_secs == 0 {
            return Err(ValidationError::ZeroInterval("relist_interval_secs"));
        }
        if peer.catalog.request_timeout_secs == 0 {
            return Err(ValidationError::ZeroInterval("request_timeout_secs"));
        }
        validate_url("catalog", &peer.catalog.url)?;
        for (server, endpoint) in &peer.peer_endpoints {
            if !is_host_port(endpoint) {
                return Err(ValidationError::InvalidPeerEndpoint {
                    server: server.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }

        validate_url("local_backend", &self.local_backend.url)?;

        if let Some(dsn) = self.logging.as_ref().and_then(|l| l.sentry_dsn.as_deref()) {
            dsn.parse::<sentry::types::Dsn>()
                .map_err(|_| ValidationError::InvalidSentryDsn)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");
        tmp
    }

    const MINIMAL: &str = r#"
server_id: apiserver-a
authorization:
  config_file: /etc/warden/authz.yaml
peer_proxy:
  catalog:
    url: https://127.0.0.1:6443
local_backend:
  url: http://127.0.0.1:8080
"#;

    #[test]
    fn test_defaults() {
        let tmp = write_tmp_file(MINIMAL);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.listener, default_listener());
        assert_eq!(config.admin_listener.port, 9090);
        assert_eq!(config.authorization.reload_interval_secs, 60);
        assert_eq!(config.authorization.privileged_groups, vec!["system:masters"]);
        assert_eq!(
            config.authorization.webhook_retry_backoff,
            WebhookRetryBackoff::default()
        );
        assert_eq!(config.peer_proxy.server_name, "kubernetes.default.svc");
        assert_eq!(config.peer_proxy.catalog.relist_interval_secs, 10);
        assert_eq!(config.peer_proxy.catalog.request_timeout_secs, 30);
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server_id: apiserver-a
listener:
  host: 0.0.0.0
  port: 8443
admin_listener:
  host: 127.0.0.1
  port: 8081
authorization:
  config_file: /etc/warden/authz.yaml
  reload_interval_secs: 5
  required_types: [RBAC]
  privileged_groups: [system:masters, ops]
  webhook_retry_backoff:
    initial_delay_ms: 100
    factor: 2.0
    steps: 3
peer_proxy:
  client_cert_file: /etc/warden/proxy.crt
  client_key_file: /etc/warden/proxy.key
  peer_ca_file: /etc/warden/ca.crt
  server_name: apiserver.internal
  catalog:
    url: https://127.0.0.1:6443
    relist_interval_secs: 30
    bearer_token_file: /var/run/secrets/token
  peer_endpoints:
    apiserver-b: 10.0.0.2:6443
  trusted_peer_addresses: [10.0.0.3, "fd00::3"]
local_backend:
  url: http://127.0.0.1:8080
metrics:
  statsd_host: 127.0.0.1
  statsd_port: 8125
logging:
  sentry_dsn: https://key@sentry.example.com/1
"#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.authorization.required_types, vec!["RBAC"]);
        assert_eq!(config.authorization.webhook_retry_backoff.steps, 3);
        assert_eq!(config.peer_proxy.peer_endpoints["apiserver-b"], "10.0.0.2:6443");
        assert_eq!(
            config.peer_proxy.trusted_peer_addresses,
            vec![
                "10.0.0.3".parse::<IpAddr>().unwrap(),
                "fd00::3".parse::<IpAddr>().unwrap()
            ]
        );
        assert_eq!(config.metrics.unwrap().statsd_port, 8125);
    }

    #[test]
    fn test_validation() {
        let base: Config = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(base.validate(), Ok(()));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.admin_listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.peer_proxy.client_cert_file = Some("/tmp/cert.pem".into());
        assert_eq!(config.validate(), Err(ValidationError::IncompletePeerTls));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config
            .peer_proxy
            .peer_endpoints
            .insert("b".into(), "10.0.0.2".into());
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidPeerEndpoint { .. })
        ));

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.authorization.reload_interval_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroInterval("reload_interval_secs"))
        );

        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.local_backend.url = "not a url".into();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidUrl { field: "local_backend", .. })
        ));
    }
}

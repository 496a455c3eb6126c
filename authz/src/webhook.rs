//! Authorizer that delegates to a remote service speaking the
//! `SubjectAccessReview` protocol.

use crate::authorizer::{
    Attributes, AuthzError, Authorizer, Decision, RuleResolver, RulesOutcome, Verdict,
};
use crate::config::{ConnectionInfoType, WebhookConfiguration};
use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::request_info::UserInfo;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const CACHE_SIZE: u64 = 10_000;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(thiserror::Error, Debug)]
pub enum WebhookError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid kubeconfig {path}: {message}")]
    KubeConfig { path: PathBuf, message: String },
    #[error("in-cluster configuration unavailable: {0}")]
    InCluster(String),
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("webhook returned {0}")]
    Status(StatusCode),
    #[error("webhook unavailable after {0} attempts")]
    RetriesExceeded(u32),
}

/// Process-level retry schedule for webhook calls.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookRetryBackoff {
    pub initial_delay_ms: u64,
    pub factor: f64,
    pub steps: u32,
}

impl Default for WebhookRetryBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            factor: 1.5,
            steps: 5,
        }
    }
}

impl WebhookRetryBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay_ms as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(millis as u64)
    }
}

/// Where to reach the webhook and how to authenticate to it.
#[derive(Debug)]
struct Connection {
    url: Url,
    ca_pem: Option<Vec<u8>>,
    token: Option<String>,
}

#[derive(Deserialize)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    current_context: String,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Deserialize)]
struct Cluster {
    server: String,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<PathBuf>,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    user: AuthInfo,
}

#[derive(Deserialize)]
struct AuthInfo {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Deserialize)]
struct Context {
    cluster: String,
    #[serde(default)]
    user: String,
}

fn read(path: &Path) -> Result<Vec<u8>, WebhookError> {
    std::fs::read(path).map_err(|source| WebhookError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_token(path: &Path) -> Result<String, WebhookError> {
    let raw = read(path)?;
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}

impl Connection {
    fn from_kubeconfig(path: &Path) -> Result<Self, WebhookError> {
        let invalid = |message: String| WebhookError::KubeConfig {
            path: path.to_path_buf(),
            message,
        };

        let config: KubeConfig =
            serde_yaml::from_slice(&read(path)?).map_err(|e| invalid(e.to_string()))?;

        let context = config
            .contexts
            .iter()
            .find(|c| c.name == config.current_context)
            .map(|c| &c.context);

        let cluster = match context {
            Some(ctx) => config.clusters.iter().find(|c| c.name == ctx.cluster),
            None => config.clusters.first(),
        }
        .ok_or_else(|| invalid("no cluster found".to_string()))?;

        let user = match context {
            Some(ctx) => config.users.iter().find(|u| u.name == ctx.user),
            None => config.users.first(),
        };

        let token = match user.map(|u| &u.user) {
            Some(AuthInfo {
                token: Some(token), ..
            }) => Some(token.clone()),
            Some(AuthInfo {
                token_file: Some(file),
                ..
            }) => Some(read_token(file)?),
            _ => None,
        };

        let ca_pem = match &cluster.cluster.certificate_authority {
            Some(ca) => Some(read(ca)?),
            None => None,
        };

        let url = Url::parse(&cluster.cluster.server)
            .map_err(|e| WebhookError::InvalidUrl(format!("{}: {e}", cluster.cluster.server)))?;

        Ok(Connection { url, ca_pem, token })
    }

    fn in_cluster() -> Result<Self, WebhookError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| WebhookError::InCluster("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| WebhookError::InCluster("KUBERNETES_SERVICE_PORT is not set".into()))?;
        // IPv6 literals need brackets in a URL authority.
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let url = Url::parse(&format!("https://{host}:{port}"))
            .map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;

        Ok(Connection {
            url,
            ca_pem: Some(read(Path::new(SERVICE_ACCOUNT_CA))?),
            token: Some(read_token(Path::new(SERVICE_ACCOUNT_TOKEN))?),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceAttributes {
    namespace: String,
    verb: String,
    group: String,
    version: String,
    resource: String,
    subresource: String,
    name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct NonResourceAttributes {
    path: String,
    verb: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_attributes: Option<ResourceAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    non_resource_attributes: Option<NonResourceAttributes>,
    user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    uid: String,
    groups: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra: BTreeMap<String, Vec<String>>,
}

impl From<&Attributes> for ReviewSpec {
    fn from(attrs: &Attributes) -> Self {
        let mut spec = ReviewSpec {
            user: attrs.user.name.clone(),
            uid: attrs.user.uid.clone(),
            groups: attrs.user.groups.clone(),
            extra: attrs.user.extra.clone(),
            ..Default::default()
        };
        if attrs.resource_request {
            spec.resource_attributes = Some(ResourceAttributes {
                namespace: attrs.namespace.clone(),
                verb: attrs.verb.clone(),
                group: attrs.api_group.clone(),
                version: attrs.api_version.clone(),
                resource: attrs.resource.clone(),
                subresource: attrs.subresource.clone(),
                name: attrs.name.clone(),
            });
        } else {
            spec.non_resource_attributes = Some(NonResourceAttributes {
                path: attrs.path.clone(),
                verb: attrs.verb.clone(),
            });
        }
        spec
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAccessReview<'a> {
    api_version: String,
    kind: &'static str,
    spec: &'a ReviewSpec,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReviewStatus {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    denied: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    evaluation_error: String,
}

#[derive(Deserialize)]
struct ReviewResponse {
    #[serde(default)]
    status: ReviewStatus,
}

impl ReviewStatus {
    fn into_verdict(self) -> Verdict {
        if !self.evaluation_error.is_empty() {
            tracing::debug!(error = %self.evaluation_error, "webhook reported an evaluation error");
        }
        if self.allowed {
            Verdict::allow(self.reason)
        } else if self.denied {
            Verdict::deny(self.reason)
        } else {
            Verdict::no_opinion(self.reason)
        }
    }
}

pub struct WebhookAuthorizer {
    name: String,
    client: reqwest::Client,
    connection: Connection,
    api_version: String,
    backoff: WebhookRetryBackoff,
    decision_on_error: Decision,
    authorized: Option<Cache<String, Verdict>>,
    unauthorized: Option<Cache<String, Verdict>>,
}

fn ttl_cache(ttl: Duration) -> Option<Cache<String, Verdict>> {
    if ttl.is_zero() {
        return None;
    }
    Some(
        Cache::builder()
            .max_capacity(CACHE_SIZE)
            .time_to_live(ttl)
            .build(),
    )
}

impl WebhookAuthorizer {
    /// `decision_on_error` is what a failed call answers with: `Deny` turns
    /// failures into denials, `NoOpinion` surfaces them as errors so the
    /// chain moves on.
    pub fn new(
        name: &str,
        config: &WebhookConfiguration,
        backoff: WebhookRetryBackoff,
        decision_on_error: Decision,
    ) -> Result<Self, WebhookError> {
        let connection = match config.connection_info.r#type {
            ConnectionInfoType::KubeConfigFile => {
                let path = config.connection_info.kube_config_file.as_deref().ok_or_else(|| {
                    WebhookError::KubeConfig {
                        path: PathBuf::new(),
                        message: "kubeConfigFile is required".into(),
                    }
                })?;
                Connection::from_kubeconfig(path)?
            }
            ConnectionInfoType::InClusterConfig => Connection::in_cluster()?,
        };

        let mut builder = reqwest::Client::builder().timeout(config.timeout.as_duration());
        if let Some(pem) = &connection.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            name: name.to_string(),
            client: builder.build()?,
            connection,
            api_version: format!(
                "authorization.k8s.io/{}",
                config.subject_access_review_version
            ),
            backoff,
            decision_on_error,
            authorized: ttl_cache(config.authorized_ttl.as_duration()),
            unauthorized: ttl_cache(config.unauthorized_ttl.as_duration()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn cached(&self, key: &str) -> Option<Verdict> {
        self.authorized
            .iter()
            .chain(self.unauthorized.iter())
            .find_map(|cache| cache.get(key))
    }

    fn remember(&self, key: String, verdict: &Verdict) {
        let cache = match verdict.decision {
            Decision::Allow => &self.authorized,
            Decision::Deny | Decision::NoOpinion => &self.unauthorized,
        };
        if let Some(cache) = cache {
            cache.insert(key, verdict.clone());
        }
    }

    async fn review(&self, spec: &ReviewSpec) -> Result<ReviewStatus, WebhookError> {
        let body = SubjectAccessReview {
            api_version: self.api_version.clone(),
            kind: "SubjectAccessReview",
            spec,
        };

        let mut attempt = 0;
        loop {
            let mut request = self.client.post(self.connection.url.clone()).json(&body);
            if let Some(token) = &self.connection.token {
                request = request.bearer_auth(token);
            }

            let retriable = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let review: ReviewResponse = response.json().await?;
                    return Ok(review.status);
                }
                Ok(response) if RETRIABLE_STATUS_CODES.contains(&response.status()) => {
                    WebhookError::Status(response.status())
                }
                Ok(response) => return Err(WebhookError::Status(response.status())),
                Err(err) if err.is_connect() || err.is_timeout() || err.is_request() => {
                    WebhookError::Client(err)
                }
                Err(err) => return Err(err.into()),
            };

            attempt += 1;
            if attempt >= self.backoff.steps {
                tracing::warn!(webhook = %self.name, error = %retriable, "giving up on webhook");
                return Err(WebhookError::RetriesExceeded(attempt));
            }
            tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
        }
    }
}

#[async_trait]
impl Authorizer for WebhookAuthorizer {
    async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError> {
        let spec = ReviewSpec::from(attrs);
        let key = serde_json::to_string(&spec).map_err(|e| AuthzError::Webhook {
            name: self.name.clone(),
            message: e.to_string(),
        })?;

        if let Some(verdict) = self.cached(&key) {
            return Ok(verdict);
        }

        match self.review(&spec).await {
            Ok(status) => {
                let verdict = status.into_verdict();
                self.remember(key, &verdict);
                Ok(verdict)
            }
            Err(err) => {
                tracing::error!(webhook = %self.name, error = %err, "failed calling authorization webhook");
                match self.decision_on_error {
                    Decision::Deny => Ok(Verdict::deny(format!(
                        "webhook {} failed: {err}",
                        self.name
                    ))),
                    _ => Err(AuthzError::Webhook {
                        name: self.name.clone(),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }
}

impl RuleResolver for WebhookAuthorizer {
    fn rules_for(&self, _user: &UserInfo, _namespace: &str) -> RulesOutcome {
        RulesOutcome::failed(AuthzError::RuleResolutionUnsupported)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{FailurePolicy, WebhookConnectionInfo};
    use crate::duration::GoDuration;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use std::convert::Infallible;
    use std::io::Write;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    /// Replies with `(status, body)` chosen per call number; records the
    /// bodies it received.
    pub(crate) async fn start_review_server(
        reply: fn(usize, &serde_json::Value) -> (u16, String),
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let counter = counter.clone();
                let svc = service_fn(move |req: Request<Incoming>| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let review: serde_json::Value = serde_json::from_slice(&body).unwrap();
                        let (status, reply_body) = reply(n, &review);
                        let mut response = Response::new(Full::new(Bytes::from(reply_body)));
                        *response.status_mut() = StatusCode::from_u16(status).unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                tokio::spawn(async move {
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });

        (addr, calls)
    }

    pub(crate) fn write_kubeconfig(addr: SocketAddr) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
apiVersion: v1
kind: Config
current-context: webhook
clusters:
  - name: authz
    cluster:
      server: http://{addr}/authorize
users:
  - name: apiserver
    user:
      token: secret-token
contexts:
  - name: webhook
    context:
      cluster: authz
      user: apiserver
"#
        )
        .unwrap();
        file
    }

    pub(crate) fn webhook_config(kubeconfig: &Path, authorized_ttl: Duration) -> WebhookConfiguration {
        WebhookConfiguration {
            timeout: GoDuration::from_duration(Duration::from_secs(2)),
            authorized_ttl: GoDuration::from_duration(authorized_ttl),
            unauthorized_ttl: GoDuration::from_duration(Duration::ZERO),
            subject_access_review_version: "v1".into(),
            match_condition_subject_access_review_version: "v1".into(),
            failure_policy: FailurePolicy::NoOpinion,
            connection_info: WebhookConnectionInfo {
                r#type: ConnectionInfoType::KubeConfigFile,
                kube_config_file: Some(kubeconfig.to_path_buf()),
            },
            match_conditions: vec![],
        }
    }

    fn fast_backoff() -> WebhookRetryBackoff {
        WebhookRetryBackoff {
            initial_delay_ms: 1,
            factor: 2.0,
            steps: 3,
        }
    }

    fn pod_get() -> Attributes {
        Attributes {
            user: UserInfo::new("alice", vec!["dev".into()]),
            verb: "get".into(),
            namespace: "default".into(),
            api_version: "v1".into(),
            resource: "pods".into(),
            name: "web-0".into(),
            resource_request: true,
            path: "/api/v1/namespaces/default/pods/web-0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allowed_and_cached() {
        let (addr, calls) = start_review_server(|_, review| {
            assert_eq!(review["kind"], "SubjectAccessReview");
            assert_eq!(review["apiVersion"], "authorization.k8s.io/v1");
            assert_eq!(review["spec"]["user"], "alice");
            assert_eq!(review["spec"]["resourceAttributes"]["resource"], "pods");
            (200, r#"{"status":{"allowed":true,"reason":"dev can read"}}"#.into())
        })
        .await;
        let kubeconfig = write_kubeconfig(addr);
        let webhook = WebhookAuthorizer::new(
            "authz-hook",
            &webhook_config(kubeconfig.path(), Duration::from_secs(60)),
            fast_backoff(),
            Decision::NoOpinion,
        )
        .unwrap();

        let verdict = webhook.authorize(&pod_get()).await.unwrap();
        assert_eq!(verdict, Verdict::allow("dev can read"));
        let verdict = webhook.authorize(&pod_get()).await.unwrap();
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_and_no_opinion() {
        let (addr, _) = start_review_server(|n, _| match n {
            0 => (200, r#"{"status":{"allowed":false,"denied":true,"reason":"no"}}"#.into()),
            _ => (200, r#"{"status":{"allowed":false}}"#.into()),
        })
        .await;
        let kubeconfig = write_kubeconfig(addr);
        let webhook = WebhookAuthorizer::new(
            "authz-hook",
            &webhook_config(kubeconfig.path(), Duration::ZERO),
            fast_backoff(),
            Decision::NoOpinion,
        )
        .unwrap();

        assert_eq!(webhook.authorize(&pod_get()).await.unwrap(), Verdict::deny("no"));
        assert_eq!(
            webhook.authorize(&pod_get()).await.unwrap().decision,
            Decision::NoOpinion
        );
    }

    #[tokio::test]
    async fn test_retries_then_failure_policy() {
        let (addr, calls) = start_review_server(|_, _| (503, String::new())).await;
        let kubeconfig = write_kubeconfig(addr);
        let config = webhook_config(kubeconfig.path(), Duration::ZERO);

        let no_opinion =
            WebhookAuthorizer::new("hook", &config, fast_backoff(), Decision::NoOpinion).unwrap();
        let err = no_opinion.authorize(&pod_get()).await.unwrap_err();
        assert!(matches!(err, AuthzError::Webhook { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let deny = WebhookAuthorizer::new("hook", &config, fast_backoff(), Decision::Deny).unwrap();
        let verdict = deny.authorize(&pod_get()).await.unwrap();
        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reason.contains("webhook hook failed"));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (addr, calls) = start_review_server(|_, _| (400, String::new())).await;
        let kubeconfig = write_kubeconfig(addr);
        let webhook = WebhookAuthorizer::new(
            "hook",
            &webhook_config(kubeconfig.path(), Duration::ZERO),
            fast_backoff(),
            Decision::NoOpinion,
        )
        .unwrap();

        assert!(webhook.authorize(&pod_get()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rules_unsupported() {
        let kubeconfig = write_kubeconfig("127.0.0.1:1".parse().unwrap());
        let webhook = WebhookAuthorizer::new(
            "hook",
            &webhook_config(kubeconfig.path(), Duration::ZERO),
            fast_backoff(),
            Decision::NoOpinion,
        )
        .unwrap();
        let outcome = webhook.rules_for(&UserInfo::default(), "");
        assert!(outcome.rules.incomplete);
        assert!(matches!(
            outcome.error,
            Some(AuthzError::RuleResolutionUnsupported)
        ));
    }

    #[test]
    fn test_missing_kubeconfig() {
        let config = webhook_config(Path::new("/nonexistent/kubeconfig"), Duration::ZERO);
        let err = WebhookAuthorizer::new("hook", &config, fast_backoff(), Decision::NoOpinion)
            .err()
            .unwrap();
        assert!(matches!(err, WebhookError::Read { .. }));
    }
}

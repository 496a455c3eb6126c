//! The reloadable authorization chain.
//!
//! Requests read the current [`Snapshot`] through an `ArcSwap` and never
//! block on reloads. Reloads are serialized by a mutex and triggered both by
//! file events and by a periodic poll; a reload that fails at any stage
//! leaves the previous snapshot in place.

use crate::authorizer::{
    Attributes, AuthorizerAndResolver, AuthzError, Authorizer, Decision, RuleResolver,
    RulesOutcome, Verdict,
};
use crate::builtin::{AlwaysAllow, AlwaysDeny, PrivilegedGroups, SYSTEM_PRIVILEGED_GROUP};
use crate::config::{
    AuthorizationConfiguration, AuthorizerType, ConfigError, FailurePolicy, load_and_validate,
};
use crate::metrics_defs::{DECISIONS, RELOAD_FAILURE, RELOAD_LAST_TIMESTAMP, RELOAD_SUCCESS};
use crate::union::{ChainLink, UnionAuthorizer, UnionRuleResolver};
use crate::watch::{FileEvent, FileWatcher};
use crate::webhook::{WebhookAuthorizer, WebhookError, WebhookRetryBackoff};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::metrics_defs::MetricDef;
use shared::request_info::UserInfo;
use shared::{counter, gauge};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct ResolverConfig {
    /// Identifies this server in reload metrics (hashed).
    pub api_server_id: String,
    pub reload_file: Option<PathBuf>,
    pub reload_interval: Duration,
    pub required_types: HashSet<AuthorizerType>,
    /// Webhook authorizers cannot be built without it.
    pub webhook_retry_backoff: Option<WebhookRetryBackoff>,
    pub privileged_groups: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_server_id: String::new(),
            reload_file: None,
            reload_interval: Duration::from_secs(60),
            required_types: HashSet::new(),
            webhook_retry_backoff: Some(WebhookRetryBackoff::default()),
            privileged_groups: vec![SYSTEM_PRIVILEGED_GROUP.to_string()],
        }
    }
}

/// Backends that are wired once at startup and shared by every chain built
/// afterwards.
#[derive(Clone, Default)]
pub struct Dependencies {
    pub node: Option<Arc<dyn AuthorizerAndResolver>>,
    pub rbac: Option<Arc<dyn AuthorizerAndResolver>>,
    pub abac: Option<Arc<dyn AuthorizerAndResolver>>,
}

pub struct Snapshot {
    pub authorizer: Arc<dyn Authorizer>,
    pub rule_resolver: Arc<dyn RuleResolver>,
}

#[derive(Default)]
struct ReloadState {
    last_read_bytes: Vec<u8>,
    last_parsed_config: Option<AuthorizationConfiguration>,
}

/// Which step a call to [`Resolver::check_file`] stopped at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    NotConfigured,
    ReadFailed,
    Unchanged,
    InvalidConfig,
    SemanticallyUnchanged,
    BuildFailed,
    Reloaded,
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("at least one authorization mode must be passed")]
    NoAuthorizers,
    #[error("authorization mode {0} requires a {0} authorizer, but none was provided")]
    MissingDependency(AuthorizerType),
    #[error("retry backoff parameters for authorization webhook have not been specified")]
    MissingWebhookBackoff,
    #[error("authorizer {0} has no webhook configuration")]
    MissingWebhookConfig(String),
    #[error("unknown failurePolicy {0:?}")]
    UnknownFailurePolicy(String),
    #[error("webhook {name}: {source}")]
    Webhook {
        name: String,
        #[source]
        source: WebhookError,
    },
    #[error("unknown authorization mode {0} specified")]
    UnknownMode(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ResolverError {
    #[error("no authorization config file configured")]
    MissingFile,
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("no authorization config file configured")]
    MissingFile,
    #[error("could not create file watcher: {0}")]
    Create(#[source] io::Error),
    #[error("could not watch {path}: {source}")]
    Add {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file watcher failed: {0}")]
    Watcher(#[source] io::Error),
    #[error("file watcher closed")]
    Closed,
}

struct ResolverInner {
    config: ResolverConfig,
    dependencies: Dependencies,
    api_server_id_hash: String,
    state: Mutex<ReloadState>,
    current: ArcSwap<Snapshot>,
    generation: AtomicU64,
}

/// Handle to the reloadable chain. Cheap to clone.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    /// Builds the first chain from an already validated configuration.
    /// Unlike reloads, a failure here is returned to the caller.
    pub fn new(
        config: ResolverConfig,
        dependencies: Dependencies,
        initial: AuthorizationConfiguration,
    ) -> Result<Self, BuildError> {
        let snapshot = build_snapshot(&config, &dependencies, &initial)?;
        let api_server_id_hash = format!(
            "sha256:{:x}",
            Sha256::digest(config.api_server_id.as_bytes())
        );

        Ok(Self {
            inner: Arc::new(ResolverInner {
                config,
                dependencies,
                api_server_id_hash,
                state: Mutex::new(ReloadState {
                    last_read_bytes: Vec::new(),
                    last_parsed_config: Some(initial),
                }),
                current: ArcSwap::from_pointee(snapshot),
                generation: AtomicU64::new(1),
            }),
        })
    }

    /// Reads, validates and builds from `config.reload_file`.
    pub async fn from_file(
        config: ResolverConfig,
        dependencies: Dependencies,
    ) -> Result<Self, ResolverError> {
        let path = config.reload_file.clone().ok_or(ResolverError::MissingFile)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| ResolverError::Read { path, source })?;
        let initial = load_and_validate(&data, &config.required_types)?;

        let resolver = Self::new(config, dependencies, initial)?;
        resolver.inner.state.lock().await.last_read_bytes = data;
        Ok(resolver)
    }

    /// Number of chains published so far, starting at 1.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.load_full()
    }

    /// Re-reads the config file and publishes a new chain if it changed in
    /// meaning and builds cleanly. Safe to call from any number of tasks.
    pub async fn check_file(&self) -> ReloadOutcome {
        let Some(path) = &self.inner.config.reload_file else {
            return ReloadOutcome::NotConfigured;
        };
        let mut state = self.inner.state.lock().await;

        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "failed to read authorization config file");
                self.record(RELOAD_FAILURE, "failure");
                return ReloadOutcome::ReadFailed;
            }
        };

        if data == state.last_read_bytes {
            return ReloadOutcome::Unchanged;
        }
        // Remembered before parsing, so a broken file is only parsed once
        // per distinct content.
        state.last_read_bytes = data;

        let config = match load_and_validate(&state.last_read_bytes, &self.inner.config.required_types)
        {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "reloading authorization config");
                self.record(RELOAD_FAILURE, "failure");
                return ReloadOutcome::InvalidConfig;
            }
        };

        if state.last_parsed_config.as_ref() == Some(&config) {
            return ReloadOutcome::SemanticallyUnchanged;
        }

        let snapshot = build_snapshot(&self.inner.config, &self.inner.dependencies, &config);
        state.last_parsed_config = Some(config);

        match snapshot {
            Ok(snapshot) => {
                self.inner.current.store(Arc::new(snapshot));
                let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::info!(path = %path.display(), generation, "reloaded authorization config");
                self.record(RELOAD_SUCCESS, "success");
                ReloadOutcome::Reloaded
            }
            Err(error) => {
                tracing::error!(path = %path.display(), %error, "reloading authorization config");
                self.record(RELOAD_FAILURE, "failure");
                ReloadOutcome::BuildFailed
            }
        }
    }

    fn record(&self, def: MetricDef, status: &'static str) {
        let hash = self.inner.api_server_id_hash.clone();
        counter!(def, "apiserver_id_hash" => hash.clone()).increment(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        gauge!(RELOAD_LAST_TIMESTAMP, "apiserver_id_hash" => hash, "status" => status).set(now);
    }

    /// Runs `check_file` on every change notification until cancelled.
    /// Returns an error when the watch cannot be (re-)established; the poll
    /// loop in [`Resolver::run_reload`] keeps reloading in that case.
    pub async fn watch_file(&self, shutdown: &CancellationToken) -> Result<(), WatchError> {
        let path = self
            .inner
            .config
            .reload_file
            .clone()
            .ok_or(WatchError::MissingFile)?;

        let mut watcher = FileWatcher::new().map_err(WatchError::Create)?;
        watcher.add(&path).map_err(|source| WatchError::Add {
            path: path.clone(),
            source,
        })?;

        // Catch changes made between startup and the watch being armed.
        self.check_file().await;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = watcher.next_event() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(err)) => return Err(WatchError::Watcher(err)),
                None => return Err(WatchError::Closed),
            };
            if shutdown.is_cancelled() {
                return Ok(());
            }

            tracing::debug!(path = %path.display(), kind = ?event.kind, "authorization config file event");
            let rearmed = rearm(&mut watcher, &path, &event);
            self.check_file().await;
            rearmed?;
        }
    }

    /// Keeps the chain in sync with the config file until `shutdown` fires.
    pub async fn run_reload(&self, shutdown: CancellationToken) {
        if self.inner.config.reload_file.is_none() {
            return;
        }
        self.record(RELOAD_SUCCESS, "success");

        let watch = {
            let resolver = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(error) = resolver.watch_file(&shutdown).await {
                    if !shutdown.is_cancelled() {
                        tracing::error!(%error, "watching authorization config file, falling back to polling");
                    }
                }
            })
        };

        let interval = self.inner.config.reload_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_file().await;
                }
            }
        }

        let _ = watch.await;
    }
}

fn rearm(watcher: &mut FileWatcher, path: &Path, event: &FileEvent) -> Result<(), WatchError> {
    if !event.replaces_file() {
        return Ok(());
    }
    let _ = watcher.remove();
    watcher.add(path).map_err(|source| WatchError::Add {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl Authorizer for Resolver {
    async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError> {
        let snapshot = self.inner.current.load_full();
        let result = snapshot.authorizer.authorize(attrs).await;
        if let Ok(verdict) = &result {
            counter!(DECISIONS, "decision" => verdict.decision.to_string()).increment(1);
        }
        result
    }
}

impl RuleResolver for Resolver {
    fn rules_for(&self, user: &UserInfo, namespace: &str) -> RulesOutcome {
        self.inner.current.load().rule_resolver.rules_for(user, namespace)
    }
}

fn dependency(
    backend: &Option<Arc<dyn AuthorizerAndResolver>>,
    mode: AuthorizerType,
) -> Result<Arc<dyn AuthorizerAndResolver>, BuildError> {
    backend.clone().ok_or(BuildError::MissingDependency(mode))
}

fn build_snapshot(
    config: &ResolverConfig,
    dependencies: &Dependencies,
    authz: &AuthorizationConfiguration,
) -> Result<Snapshot, BuildError> {
    if authz.authorizers.is_empty() {
        return Err(BuildError::NoAuthorizers);
    }

    let mut links = vec![ChainLink::PrivilegedGroups(PrivilegedGroups::new(
        config.privileged_groups.iter().cloned(),
    ))];

    for entry in &authz.authorizers {
        let link = match &entry.r#type {
            AuthorizerType::Node => {
                ChainLink::Node(dependency(&dependencies.node, AuthorizerType::Node)?)
            }
            AuthorizerType::Rbac => {
                ChainLink::Rbac(dependency(&dependencies.rbac, AuthorizerType::Rbac)?)
            }
            AuthorizerType::Abac => {
                ChainLink::Abac(dependency(&dependencies.abac, AuthorizerType::Abac)?)
            }
            AuthorizerType::AlwaysAllow => ChainLink::AlwaysAllow(AlwaysAllow),
            AuthorizerType::AlwaysDeny => ChainLink::AlwaysDeny(AlwaysDeny),
            AuthorizerType::Webhook => {
                let backoff = config
                    .webhook_retry_backoff
                    .clone()
                    .ok_or(BuildError::MissingWebhookBackoff)?;
                let webhook = entry
                    .webhook
                    .as_ref()
                    .ok_or_else(|| BuildError::MissingWebhookConfig(entry.name.clone()))?;
                let decision_on_error = match &webhook.failure_policy {
                    FailurePolicy::NoOpinion => Decision::NoOpinion,
                    FailurePolicy::Deny => Decision::Deny,
                    FailurePolicy::Unknown(policy) => {
                        return Err(BuildError::UnknownFailurePolicy(policy.clone()));
                    }
                };
                let authorizer =
                    WebhookAuthorizer::new(&entry.name, webhook, backoff, decision_on_error)
                        .map_err(|source| BuildError::Webhook {
                            name: entry.name.clone(),
                            source,
                        })?;
                ChainLink::Webhook(Arc::new(authorizer))
            }
            AuthorizerType::Unknown(mode) => return Err(BuildError::UnknownMode(mode.clone())),
        };
        links.push(link);
    }

    Ok(Snapshot {
        authorizer: Arc::new(UnionAuthorizer::new(links.clone())),
        rule_resolver: Arc::new(UnionRuleResolver::new(links)),
    })
}

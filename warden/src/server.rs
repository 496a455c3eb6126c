//! Startup wiring: authorization chain, peer routing, listeners.

use crate::config::Config;
use crate::errors::WardenError;
use crate::pipeline::{Authorization, LocalBackend, RequestContext};
use authz::{AuthorizerType, Dependencies, Resolver, ResolverConfig};
use peer_proxy::catalog::{CatalogConfig, CatalogWatcher};
use peer_proxy::{PeerProxy, PeerTlsConfig, PeerTransport, StaticEndpoints};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CATALOG_CHANNEL_SIZE: usize = 256;

pub fn resolver_config(config: &Config) -> ResolverConfig {
    let authz = &config.authorization;
    ResolverConfig {
        api_server_id: config.server_id.clone(),
        reload_file: Some(authz.config_file.clone()),
        reload_interval: Duration::from_secs(authz.reload_interval_secs),
        required_types: authz
            .required_types
            .iter()
            .cloned()
            .map(AuthorizerType::from)
            .collect(),
        webhook_retry_backoff: Some(authz.webhook_retry_backoff.clone()),
        privileged_groups: authz.privileged_groups.clone(),
    }
}

pub fn build_peer_proxy(config: &Config) -> Result<PeerProxy, WardenError> {
    let settings = &config.peer_proxy;
    let transport = match (
        &settings.client_cert_file,
        &settings.client_key_file,
        &settings.peer_ca_file,
    ) {
        (Some(cert), Some(key), Some(ca)) => PeerTransport::tls(&PeerTlsConfig {
            client_cert_file: cert.clone(),
            client_key_file: key.clone(),
            peer_ca_file: ca.clone(),
            server_name: settings.server_name.clone(),
        })?,
        _ => {
            tracing::warn!("no peer client identity configured, dialing peers without TLS");
            PeerTransport::Plain
        }
    };

    let endpoints = Arc::new(StaticEndpoints::new(settings.peer_endpoints.clone()));
    Ok(PeerProxy::builder(config.server_id.clone(), endpoints)
        .transport(transport)
        .build())
}

/// Addresses whose `peer-proxied` marker is honored: the configured extras
/// plus every peer endpoint given as an IP literal.
pub fn trusted_peer_addresses(config: &Config) -> HashSet<IpAddr> {
    let settings = &config.peer_proxy;
    let endpoint_ips = settings
        .peer_endpoints
        .values()
        .filter_map(|endpoint| endpoint.parse::<SocketAddr>().ok())
        .map(|addr| addr.ip());
    settings
        .trusted_peer_addresses
        .iter()
        .copied()
        .chain(endpoint_ips)
        .collect()
}

pub async fn run(config: Config) -> Result<(), WardenError> {
    let shutdown = CancellationToken::new();

    // Startup is fail-fast: a broken authorization file stops the process
    // here, later edits are only ever applied if they build.
    let resolver = Resolver::from_file(resolver_config(&config), Dependencies::default()).await?;
    tracing::info!(
        file = %config.authorization.config_file.display(),
        "authorization chain built"
    );

    let proxy = build_peer_proxy(&config)?;
    let catalog = CatalogWatcher::new(CatalogConfig {
        url: config.peer_proxy.catalog.url.clone(),
        relist_interval: Duration::from_secs(config.peer_proxy.catalog.relist_interval_secs),
        request_timeout: Duration::from_secs(config.peer_proxy.catalog.request_timeout_secs),
        bearer_token_file: config.peer_proxy.catalog.bearer_token_file.clone(),
    })?;
    let local = LocalBackend::new(&config.local_backend.url)?;

    let reload = tokio::spawn({
        let resolver = resolver.clone();
        let shutdown = shutdown.clone();
        async move { resolver.run_reload(shutdown).await }
    });

    let (events_tx, events_rx) = mpsc::channel(CATALOG_CHANNEL_SIZE);
    tokio::spawn(catalog.run(events_tx, shutdown.clone()));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.run_catalog_events(events_rx).await }
    });
    tokio::spawn({
        let proxy = proxy.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(error) = proxy.wait_for_cache_sync(&shutdown).await {
                tracing::warn!(%error, "peer proxy never synced");
            }
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutting down"),
                Err(error) => tracing::error!(%error, "could not listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    let service = RequestContext::new(proxy.handle(Authorization::new(
        Arc::new(resolver),
        local,
    )))
    .with_trusted_peers(trusted_peer_addresses(&config));
    let admin = AdminService::new({
        let proxy = proxy.clone();
        move || proxy.has_finished_sync()
    });

    let served = tokio::try_join!(
        run_http_service(
            &config.listener.host,
            config.listener.port,
            service,
            shutdown.clone()
        ),
        run_http_service(
            &config.admin_listener.host,
            config.admin_listener.port,
            admin,
            shutdown.clone()
        ),
    );

    shutdown.cancel();
    let _ = reload.await;
    served?;
    Ok(())
}

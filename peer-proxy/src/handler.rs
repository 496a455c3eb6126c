use crate::catalog::CatalogEvent;
use crate::endpoints::{self, EndpointResolver};
use crate::errors::SyncError;
use crate::forward::{self, PEER_PROXIED_HEADER, PeerTransport};
use crate::index::{Serviceability, ServiceabilityIndex};
use crate::metrics_defs::{CATALOG_EVENTS, INDEX_SIZE};
use crate::selector::{PeerSelector, RandomSelector};
use http::{Request, Response};
use hyper::body::Body;
use hyper::service::Service;
use shared::http::ResponseBody;
use shared::request_info::{RequestInfo, UserInfo};
use shared::status::Status;
use shared::{counter, gauge};
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct Inner {
    server_id: String,
    index: ServiceabilityIndex,
    endpoints: Arc<dyn EndpointResolver>,
    selector: Arc<dyn PeerSelector>,
    transport: PeerTransport,
    catalog_synced: watch::Sender<bool>,
    versions_published: Option<watch::Receiver<bool>>,
    finished_sync: AtomicBool,
}

/// Routes resource requests this server cannot serve to a peer that can.
#[derive(Clone)]
pub struct PeerProxy {
    inner: Arc<Inner>,
}

pub struct PeerProxyBuilder {
    server_id: String,
    endpoints: Arc<dyn EndpointResolver>,
    selector: Arc<dyn PeerSelector>,
    transport: PeerTransport,
    versions_published: Option<watch::Receiver<bool>>,
}

impl PeerProxyBuilder {
    pub fn new(server_id: impl Into<String>, endpoints: Arc<dyn EndpointResolver>) -> Self {
        Self {
            server_id: server_id.into(),
            endpoints,
            selector: Arc::new(RandomSelector),
            transport: PeerTransport::Plain,
            versions_published: None,
        }
    }

    pub fn selector(mut self, selector: Arc<dyn PeerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn transport(mut self, transport: PeerTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Extra condition for [`PeerProxy::wait_for_cache_sync`]: the local
    /// server has published its own storage versions.
    pub fn versions_published(mut self, published: watch::Receiver<bool>) -> Self {
        self.versions_published = Some(published);
        self
    }

    pub fn build(self) -> PeerProxy {
        let (catalog_synced, _) = watch::channel(false);
        PeerProxy {
            inner: Arc::new(Inner {
                server_id: self.server_id,
                index: ServiceabilityIndex::new(),
                endpoints: self.endpoints,
                selector: self.selector,
                transport: self.transport,
                catalog_synced,
                versions_published: self.versions_published,
                finished_sync: AtomicBool::new(false),
            }),
        }
    }
}

enum RouteDecision {
    Local,
    Peer(String),
    Respond(Response<ResponseBody>),
}

impl PeerProxy {
    pub fn builder(
        server_id: impl Into<String>,
        endpoints: Arc<dyn EndpointResolver>,
    ) -> PeerProxyBuilder {
        PeerProxyBuilder::new(server_id, endpoints)
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn index(&self) -> &ServiceabilityIndex {
        &self.inner.index
    }

    /// Wraps `next`, the local handler chain.
    pub fn handle<S>(&self, next: S) -> PeerProxyService<S> {
        PeerProxyService {
            proxy: self.clone(),
            next: Arc::new(next),
        }
    }

    pub fn apply(&self, event: &CatalogEvent) {
        counter!(CATALOG_EVENTS, "event" => event.kind()).increment(1);
        match event {
            CatalogEvent::Synced => {
                self.inner.catalog_synced.send_replace(true);
            }
            event => self.inner.index.apply(event),
        }
        gauge!(INDEX_SIZE).set(self.inner.index.len() as f64);
    }

    /// Applies catalog events in order until the sender goes away.
    pub async fn run_catalog_events(&self, mut events: mpsc::Receiver<CatalogEvent>) {
        while let Some(event) = events.recv().await {
            self.apply(&event);
        }
        tracing::info!("catalog event stream ended");
    }

    /// Waits for the first catalog listing and, if configured, for the
    /// local storage versions to be published. Until then every request is
    /// served locally.
    pub async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> Result<(), SyncError> {
        let mut catalog = self.inner.catalog_synced.subscribe();
        wait_for_true(&mut catalog, shutdown).await?;

        if let Some(published) = &self.inner.versions_published {
            let mut published = published.clone();
            wait_for_true(&mut published, shutdown).await?;
        }

        tracing::info!("peer proxy finished cache sync");
        self.inner.finished_sync.store(true, Ordering::Release);
        Ok(())
    }

    pub fn has_finished_sync(&self) -> bool {
        self.inner.finished_sync.load(Ordering::Acquire)
    }

    fn route<B>(&self, req: &Request<B>) -> RouteDecision {
        let Some(info) = req.extensions().get::<RequestInfo>() else {
            tracing::error!(path = req.uri().path(), "no RequestInfo found for request");
            return RouteDecision::Respond(
                Status::internal_error("no RequestInfo found in the context")
                    .to_response(req.headers()),
            );
        };

        if !info.resource_request {
            return RouteDecision::Local;
        }
        if req
            .headers()
            .get(PEER_PROXIED_HEADER)
            .is_some_and(|v| v == "true")
        {
            tracing::debug!("already proxied once, serving locally");
            return RouteDecision::Local;
        }
        if !self.has_finished_sync() {
            return RouteDecision::Local;
        }

        let mut gvr = info.gvr();
        if gvr.group.is_empty() {
            gvr.group = "core".to_string();
        }

        let peers = match self.inner.index.serviceability(&gvr, &self.inner.server_id) {
            None => {
                tracing::debug!(%gvr, "no catalog entry, serving locally");
                return RouteDecision::Local;
            }
            Some(Serviceability::Local) => return RouteDecision::Local,
            Some(Serviceability::Peers(peers)) => peers,
        };

        let candidates: Vec<String> = peers
            .iter()
            .filter_map(|id| match endpoints::resolve(&*self.inner.endpoints, id) {
                Ok(endpoint) => Some(endpoint),
                Err(error) => {
                    tracing::warn!(%error, "skipping peer");
                    None
                }
            })
            .collect();

        match self.inner.selector.select(&candidates) {
            Some(endpoint) => RouteDecision::Peer(endpoint.clone()),
            None => {
                tracing::error!(%gvr, "no reachable peer can serve the request");
                RouteDecision::Respond(
                    Status::service_unavailable(format!(
                        "no reachable peer is able to serve {gvr}"
                    ))
                    .to_response(req.headers()),
                )
            }
        }
    }

    async fn proxy<B>(&self, req: Request<B>, authority: &str) -> Response<ResponseBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let Some(user) = req.extensions().get::<UserInfo>().cloned() else {
            tracing::error!("no user found for request, refusing to proxy");
            return Status::internal_error("no user found for request").to_response(req.headers());
        };
        forward::forward(&self.inner.transport, authority, req, &user).await
    }
}

async fn wait_for_true(
    rx: &mut watch::Receiver<bool>,
    shutdown: &CancellationToken,
) -> Result<(), SyncError> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(SyncError::Cancelled),
        synced = async { rx.wait_for(|value| *value).await.map(|_| ()) } => {
            synced.map_err(|_| SyncError::Closed)
        }
    }
}

pub struct PeerProxyService<S> {
    proxy: PeerProxy,
    next: Arc<S>,
}

impl<S, B> Service<Request<B>> for PeerProxyService<S>
where
    S: Service<Request<B>, Response = Response<ResponseBody>> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    type Response = Response<ResponseBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        match self.proxy.route(&req) {
            RouteDecision::Local => {
                let fut = self.next.call(req);
                Box::pin(fut)
            }
            RouteDecision::Respond(response) => {
                Box::pin(async move { Ok::<_, S::Error>(response) })
            }
            RouteDecision::Peer(authority) => {
                let proxy = self.proxy.clone();
                Box::pin(async move { Ok::<_, S::Error>(proxy.proxy(req, &authority).await) })
            }
        }
    }
}

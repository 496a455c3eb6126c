//! The request pipeline behind the main listener:
//! [`RequestContext`] -> peer proxy -> [`Authorization`] -> [`LocalBackend`].

use crate::errors::WardenError;
use authz::{Attributes, Authorizer, Decision};
use http::header::HeaderMap;
use http::uri::{Authority, Scheme};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use peer_proxy::PEER_PROXIED_HEADER;
use shared::headers::{add_via_header, filter_hop_by_hop};
use shared::http::{RemoteAddr, ResponseBody, make_error_response};
use shared::request_info::{RequestInfo, RequestInfoResolver, UserInfo};
use shared::status::Status;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

pub const REMOTE_USER_HEADER: &str = "x-remote-user";
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";
pub const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

const ANONYMOUS_USER: &str = "system:anonymous";
const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Reads the caller identity from the front-proxy headers. Requests without
/// a user header are anonymous.
pub fn user_from_headers(headers: &HeaderMap) -> UserInfo {
    let Some(name) = headers
        .get(REMOTE_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|name| !name.is_empty())
    else {
        return UserInfo::new(ANONYMOUS_USER, vec![UNAUTHENTICATED_GROUP.to_string()]);
    };

    let mut user = UserInfo::new(
        name,
        headers
            .get_all(REMOTE_GROUP_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect(),
    );
    if !user.groups.iter().any(|g| g == AUTHENTICATED_GROUP) {
        user.groups.push(AUTHENTICATED_GROUP.to_string());
    }

    for (header, value) in headers {
        let Some(key) = header.as_str().strip_prefix(REMOTE_EXTRA_PREFIX) else {
            continue;
        };
        if let Ok(value) = value.to_str() {
            user.extra
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    user
}

/// Attaches [`RequestInfo`] and [`UserInfo`] to every request.
///
/// The `peer-proxied` marker is only kept on requests arriving from a
/// trusted peer address. Anyone else could use it to skip peer routing.
pub struct RequestContext<S> {
    resolver: RequestInfoResolver,
    trusted_peers: HashSet<IpAddr>,
    next: Arc<S>,
}

impl<S> RequestContext<S> {
    pub fn new(next: S) -> Self {
        Self {
            resolver: RequestInfoResolver::default(),
            trusted_peers: HashSet::new(),
            next: Arc::new(next),
        }
    }

    pub fn with_trusted_peers(mut self, peers: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_peers = peers.into_iter().map(|ip| ip.to_canonical()).collect();
        self
    }

    fn from_trusted_peer<B>(&self, req: &Request<B>) -> bool {
        req.extensions()
            .get::<RemoteAddr>()
            .is_some_and(|addr| self.trusted_peers.contains(&addr.0.ip().to_canonical()))
    }
}

impl<S, B> Service<Request<B>> for RequestContext<S>
where
    S: Service<Request<B>, Response = Response<ResponseBody>> + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn call(&self, mut req: Request<B>) -> Self::Future {
        let info = match self.resolver.resolve(req.method(), req.uri()) {
            Ok(info) => info,
            Err(error) => {
                tracing::debug!(%error, "could not classify request");
                let response = Status::not_found(error.to_string()).to_response(req.headers());
                return Box::pin(async move { Ok::<_, S::Error>(response) });
            }
        };
        if req.headers().contains_key(PEER_PROXIED_HEADER) && !self.from_trusted_peer(&req) {
            tracing::debug!("dropping peer-proxied marker from untrusted caller");
            req.headers_mut().remove(PEER_PROXIED_HEADER);
        }
        let user = user_from_headers(req.headers());
        req.extensions_mut().insert(info);
        req.extensions_mut().insert(user);
        Box::pin(self.next.call(req))
    }
}

/// Rejects requests the authorization chain does not allow.
pub struct Authorization<S> {
    authorizer: Arc<dyn Authorizer>,
    next: Arc<S>,
}

impl<S> Authorization<S> {
    pub fn new(authorizer: Arc<dyn Authorizer>, next: S) -> Self {
        Self {
            authorizer,
            next: Arc::new(next),
        }
    }
}

fn forbidden_message(attrs: &Attributes, reason: &str) -> String {
    let mut message = if attrs.resource_request {
        let mut resource = attrs.resource.clone();
        if !attrs.subresource.is_empty() {
            resource = format!("{resource}/{}", attrs.subresource);
        }
        let mut message = format!(
            "User {:?} cannot {} resource {:?} in API group {:?}",
            attrs.user.name, attrs.verb, resource, attrs.api_group
        );
        if attrs.namespace.is_empty() {
            message.push_str(" at the cluster scope");
        } else {
            message.push_str(&format!(" in the namespace {:?}", attrs.namespace));
        }
        message
    } else {
        format!(
            "User {:?} cannot {} path {:?}",
            attrs.user.name, attrs.verb, attrs.path
        )
    };
    if !reason.is_empty() {
        message.push_str(": ");
        message.push_str(reason);
    }
    message
}

impl<S, B> Service<Request<B>> for Authorization<S>
where
    S: Service<Request<B>, Response = Response<ResponseBody>> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let authorizer = self.authorizer.clone();
        let next = self.next.clone();

        Box::pin(async move {
            let (Some(info), Some(user)) = (
                req.extensions().get::<RequestInfo>(),
                req.extensions().get::<UserInfo>(),
            ) else {
                tracing::error!("request reached authorization without context");
                return Ok(Status::internal_error("no request context found")
                    .to_response(req.headers()));
            };
            let attrs = Attributes::new(user.clone(), info);

            match authorizer.authorize(&attrs).await {
                Ok(verdict) if verdict.decision == Decision::Allow => {
                    tracing::debug!(user = %attrs.user.name, verb = %attrs.verb, path = %attrs.path, "allowed");
                    next.call(req).await
                }
                Ok(verdict) => {
                    tracing::info!(
                        user = %attrs.user.name,
                        verb = %attrs.verb,
                        path = %attrs.path,
                        decision = %verdict.decision,
                        reason = %verdict.reason,
                        "forbidden"
                    );
                    Ok(Status::forbidden(forbidden_message(&attrs, &verdict.reason))
                        .to_response(req.headers()))
                }
                Err(error) => {
                    tracing::error!(
                        user = %attrs.user.name,
                        path = %attrs.path,
                        reason = error.reason(),
                        %error,
                        "authorization failed"
                    );
                    Ok(Status::internal_error(error.to_string()).to_response(req.headers()))
                }
            }
        })
    }
}

/// Streams requests to the local API server over plain HTTP.
pub struct LocalBackend {
    client: Client<HttpConnector, Incoming>,
    scheme: Scheme,
    authority: Authority,
}

impl LocalBackend {
    pub fn new(url: &str) -> Result<Self, WardenError> {
        let uri: Uri = url.parse()?;
        let (Some(scheme), Some(authority)) = (uri.scheme().cloned(), uri.authority().cloned())
        else {
            return Err(WardenError::IncompleteBackend(url.to_string()));
        };

        let conn = HttpConnector::new();
        let client: Client<_, Incoming> = Client::builder(TokioExecutor::new())
            .http2_adaptive_window(true)
            .build(conn);

        Ok(Self {
            client,
            scheme,
            authority,
        })
    }
}

impl Service<Request<Incoming>> for LocalBackend {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let client = self.client.clone();
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build();

        Box::pin(async move {
            parts.uri = match uri {
                Ok(uri) => uri,
                Err(error) => {
                    tracing::warn!(%error, "could not build backend URI");
                    return Ok(make_error_response(StatusCode::BAD_REQUEST));
                }
            };
            filter_hop_by_hop(&mut parts.headers, parts.version);
            add_via_header(&mut parts.headers, parts.version);
            parts.version = Version::HTTP_11;

            match client.request(Request::from_parts(parts, body)).await {
                Ok(response) => {
                    let (mut parts, body) = response.into_parts();
                    filter_hop_by_hop(&mut parts.headers, parts.version);
                    Ok(Response::from_parts(parts, body.boxed()))
                }
                Err(error) => {
                    tracing::error!(%error, "local backend request failed");
                    Ok(make_error_response(StatusCode::BAD_GATEWAY))
                }
            }
        })
    }
}

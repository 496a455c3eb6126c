//! Forwarding a request to a peer server and streaming its response back.

use crate::errors::ProxyError;
use crate::metrics_defs::PROXIED_REQUESTS;
use http::header::{HOST, HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use shared::counter;
use shared::headers::{
    add_via_header, filter_hop_by_hop, filter_hop_by_hop_keep_upgrade, is_upgrade_request,
};
use shared::http::{ResponseBody, make_text_response};
use shared::request_info::UserInfo;
use std::error::Error as StdError;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub const PEER_PROXIED_HEADER: &str = "peer-proxied";
pub const DEFAULT_PEER_SERVER_NAME: &str = "kubernetes.default.svc";

const REMOTE_USER_HEADER: &str = "x-remote-user";
const REMOTE_GROUP_HEADER: &str = "x-remote-group";
const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The client identity used towards peers and the trust anchors for their
/// serving certificates.
#[derive(Clone, Debug)]
pub struct PeerTlsConfig {
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
    pub peer_ca_file: PathBuf,
    /// Name checked against the peer's serving certificate. Peers are dialed
    /// by address, so this is pinned rather than taken from the endpoint.
    pub server_name: String,
}

trait PeerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerIo for T {}

#[derive(Clone)]
pub enum PeerTransport {
    /// Plain TCP. Only meant for tests and loopback setups.
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem_error = |source| ProxyError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(pem_error)?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let pem_error = |source| ProxyError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(pem_error)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(pem_error)?
        .ok_or_else(|| ProxyError::MissingPrivateKey(path.to_path_buf()))
}

impl PeerTransport {
    pub fn tls(config: &PeerTlsConfig) -> Result<Self, ProxyError> {
        let certs = load_certs(&config.client_cert_file)?;
        let key = load_key(&config.client_key_file)?;

        let mut roots = RootCertStore::empty();
        for ca in load_certs(&config.peer_ca_file)? {
            roots.add(ca)?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;
        client_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| ProxyError::InvalidServerName(config.server_name.clone()))?;

        Ok(PeerTransport::Tls {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    async fn connect(&self, authority: &str) -> Result<Box<dyn PeerIo>, ProxyError> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(authority))
            .await
            .map_err(|_| ProxyError::ConnectTimeout(authority.to_string()))??;
        if let Err(error) = tcp.set_nodelay(true) {
            tracing::debug!(peer = authority, %error, "could not set TCP_NODELAY");
        }

        match self {
            PeerTransport::Plain => Ok(Box::new(tcp)),
            PeerTransport::Tls {
                connector,
                server_name,
            } => {
                let tls = connector.connect(server_name.clone(), tcp).await?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Replaces whatever identity headers the client sent with the caller's.
fn set_identity_headers(headers: &mut HeaderMap, user: &UserInfo) -> Result<(), ProxyError> {
    let stale: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == REMOTE_USER_HEADER
                || name == REMOTE_GROUP_HEADER
                || name.starts_with(REMOTE_EXTRA_PREFIX)
        })
        .cloned()
        .collect();
    for name in stale {
        headers.remove(&name);
    }

    headers.insert(REMOTE_USER_HEADER, HeaderValue::from_str(&user.name)?);
    for group in &user.groups {
        headers.append(REMOTE_GROUP_HEADER, HeaderValue::from_str(group)?);
    }
    for (key, values) in &user.extra {
        let Ok(name) = HeaderName::from_bytes(format!("{REMOTE_EXTRA_PREFIX}{key}").as_bytes())
        else {
            tracing::warn!(%key, "skipping user extra that is not a valid header name");
            continue;
        };
        for value in values {
            headers.append(name.clone(), HeaderValue::from_str(value)?);
        }
    }
    Ok(())
}

fn peer_request<B>(
    req: Request<B>,
    authority: &str,
    user: &UserInfo,
) -> Result<Request<B>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = Uri::builder().path_and_query(path_and_query).build()?;

    if is_upgrade_request(&parts.headers) {
        filter_hop_by_hop_keep_upgrade(&mut parts.headers, parts.version);
    } else {
        filter_hop_by_hop(&mut parts.headers, parts.version);
    }
    add_via_header(&mut parts.headers, parts.version);
    parts.headers.insert(HOST, HeaderValue::from_str(authority)?);
    set_identity_headers(&mut parts.headers, user)?;
    parts
        .headers
        .insert(PEER_PROXIED_HEADER, HeaderValue::from_static("true"));

    parts.version = Version::HTTP_11;
    parts.extensions = Extensions::new();
    Ok(Request::from_parts(parts, body))
}

async fn send<B>(
    transport: &PeerTransport,
    authority: &str,
    mut req: Request<B>,
    user: &UserInfo,
) -> Result<Response<ResponseBody>, ProxyError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let client_upgrade = is_upgrade_request(req.headers()).then(|| hyper::upgrade::on(&mut req));
    let req = peer_request(req, authority, user)?;

    let io = transport.connect(authority).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            tracing::debug!(%error, "peer connection closed with error");
        }
    });

    let mut response = sender.send_request(req).await?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let peer_upgrade = hyper::upgrade::on(&mut response);
            let peer = authority.to_string();
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, peer_upgrade) {
                    Ok((client, upstream)) => {
                        let mut client = TokioIo::new(client);
                        let mut upstream = TokioIo::new(upstream);
                        if let Err(error) =
                            tokio::io::copy_bidirectional(&mut client, &mut upstream).await
                        {
                            tracing::debug!(%peer, %error, "upgraded stream ended with error");
                        }
                    }
                    Err(error) => tracing::warn!(%peer, %error, "protocol upgrade failed"),
                }
            });
        }
        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop_keep_upgrade(&mut parts.headers, parts.version);
        add_via_header(&mut parts.headers, parts.version);
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    let (mut parts, body) = response.into_parts();
    filter_hop_by_hop(&mut parts.headers, parts.version);
    add_via_header(&mut parts.headers, parts.version);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Proxies `req` to the peer at `authority` on behalf of `user`. Failures to
/// reach the peer become a 503 with the error as text.
pub async fn forward<B>(
    transport: &PeerTransport,
    authority: &str,
    req: Request<B>,
    user: &UserInfo,
) -> Response<ResponseBody>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let response = match send(transport, authority, req, user).await {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(peer = authority, %error, "error while proxying request to peer");
            make_text_response(StatusCode::SERVICE_UNAVAILABLE, format!("{error}\n"))
        }
    };

    counter!(PROXIED_REQUESTS, "status" => response.status().as_str().to_string()).increment(1);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, UPGRADE};
    use http_body_util::{Empty, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use std::convert::Infallible;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_peer_request_headers() {
        let req = Request::builder()
            .uri("https://front.example/api/v1/namespaces/default/pods?watch=1")
            .header("connection", "keep-alive, x-trace")
            .header("x-trace", "1")
            .header("x-remote-user", "mallory")
            .header("x-remote-group", "system:masters")
            .header("x-remote-extra-scopes", "all")
            .header(PEER_PROXIED_HEADER, "false")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let mut user = UserInfo::new("alice", vec!["dev".into(), "ops".into()]);
        user.extra.insert("team".into(), vec!["storage".into()]);

        let out = peer_request(req, "10.0.0.2:6443", &user).unwrap();
        assert_eq!(out.uri(), "/api/v1/namespaces/default/pods?watch=1");
        assert_eq!(out.version(), Version::HTTP_11);

        let headers = out.headers();
        assert_eq!(headers["host"], "10.0.0.2:6443");
        assert_eq!(headers[PEER_PROXIED_HEADER], "true");
        assert_eq!(headers["x-remote-user"], "alice");
        let groups: Vec<_> = headers.get_all("x-remote-group").iter().collect();
        assert_eq!(groups, vec!["dev", "ops"]);
        assert_eq!(headers["x-remote-extra-team"], "storage");
        assert!(!headers.contains_key("x-remote-extra-scopes"));
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("x-trace"));
        assert_eq!(headers["via"], "1.1 warden");
    }

    #[test]
    fn test_peer_request_keeps_upgrade() {
        let req = Request::builder()
            .uri("/api/v1/namespaces/default/pods/web/exec?command=sh")
            .header("connection", "Upgrade")
            .header("upgrade", "SPDY/3.1")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let out = peer_request(req, "10.0.0.2:6443", &UserInfo::new("alice", vec![])).unwrap();
        assert_eq!(out.headers()["connection"], "upgrade");
        assert_eq!(out.headers()["upgrade"], "SPDY/3.1");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_503() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .uri("/api/v1/pods")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = forward(
            &PeerTransport::Plain,
            &addr.to_string(),
            req,
            &UserInfo::new("alice", vec![]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn upgrading_peer(mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        assert_eq!(req.headers()[UPGRADE], "echo");
        assert_eq!(req.headers()[PEER_PROXIED_HEADER], "true");
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = upgrade.await else {
                return;
            };
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 64];
            while let Ok(n) = io.read(&mut buf).await {
                if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("echo"));
        Ok(response)
    }

    #[tokio::test]
    async fn test_upgrade_is_relayed() {
        let shutdown = CancellationToken::new();

        let peer_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_listener.local_addr().unwrap().to_string();
        tokio::spawn(shared::http::serve(
            peer_listener,
            service_fn(upgrading_peer),
            shutdown.clone(),
        ));

        let front_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front_listener.local_addr().unwrap();
        tokio::spawn(shared::http::serve(
            front_listener,
            service_fn(move |req: Request<Incoming>| {
                let peer = peer_addr.clone();
                async move {
                    let user = UserInfo::new("alice", vec![]);
                    Ok::<_, Infallible>(forward(&PeerTransport::Plain, &peer, req, &user).await)
                }
            }),
            shutdown.clone(),
        ));

        let mut client = tokio::net::TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(
                b"GET /api/v1/namespaces/default/pods/web/exec HTTP/1.1\r\n\
                  Host: front\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            timeout(Duration::from_secs(5), client.read_exact(&mut byte))
                .await
                .unwrap()
                .unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
        assert!(head.to_ascii_lowercase().contains("upgrade: echo"), "{head}");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");

        shutdown.cancel();
    }

    #[test]
    fn test_tls_config_errors() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let config = PeerTlsConfig {
            client_cert_file: dir.path().join("missing.pem"),
            client_key_file: empty.clone(),
            peer_ca_file: empty.clone(),
            server_name: DEFAULT_PEER_SERVER_NAME.into(),
        };
        assert!(matches!(
            PeerTransport::tls(&config),
            Err(ProxyError::Pem { .. })
        ));

        let config = PeerTlsConfig {
            client_cert_file: empty.clone(),
            ..config
        };
        assert!(matches!(
            PeerTransport::tls(&config),
            Err(ProxyError::MissingPrivateKey(path)) if path == empty
        ));
    }
}

use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("could not read PEM file {path}: {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no private key found in {0}")]
    MissingPrivateKey(PathBuf),
    #[error("could not build peer request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SyncError {
    #[error("shut down before the catalog was synced")]
    Cancelled,
    #[error("sync signal dropped before the catalog was synced")]
    Closed,
}

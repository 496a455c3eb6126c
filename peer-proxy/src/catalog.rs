//! The cluster-wide catalog of which server can decode which resource
//! versions, and a relisting source that turns it into change events.

use crate::metrics_defs::CATALOG_LIST_FAILURES;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const STORAGE_VERSIONS_PATH: &str = "/apis/internal.apiserver.k8s.io/v1alpha1/storageversions";

const BASE_DELAY_MS: u64 = 500;
const MAX_RETRIES: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
}

/// One catalog object, named `<group>.<resource>`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVersion {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: StorageVersionStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionStatus {
    #[serde(default)]
    pub storage_versions: Vec<ServerStorageVersion>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStorageVersion {
    #[serde(rename = "apiServerID")]
    pub api_server_id: String,
    #[serde(default)]
    pub encoding_version: String,
    #[serde(default)]
    pub decodable_versions: Vec<String>,
    #[serde(default)]
    pub served_versions: Vec<String>,
}

impl StorageVersion {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Deserialize)]
struct StorageVersionList {
    #[serde(default)]
    items: Vec<StorageVersion>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogEvent {
    Added(StorageVersion),
    Updated {
        old: StorageVersion,
        new: StorageVersion,
    },
    Deleted(StorageVersion),
    /// The first complete listing has been delivered.
    Synced,
}

impl CatalogEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CatalogEvent::Added(_) => "added",
            CatalogEvent::Updated { .. } => "updated",
            CatalogEvent::Deleted(_) => "deleted",
            CatalogEvent::Synced => "synced",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid catalog URL: {0}")]
    InvalidUrl(String),
    #[error("could not read bearer token {path}: {source}")]
    Token {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog unavailable")]
    RetriesExceeded,
    #[error("catalog consumer went away")]
    ChannelClosed,
}

#[derive(Clone, Debug)]
pub struct CatalogConfig {
    /// Base URL of the API server serving the catalog.
    pub url: String,
    pub relist_interval: Duration,
    /// Upper bound for one list request, connect included.
    pub request_timeout: Duration,
    pub bearer_token_file: Option<PathBuf>,
}

/// Periodically lists the catalog and emits the differences from the
/// previous listing. Objects are compared whole, keyed by name.
pub struct CatalogWatcher {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
    relist_interval: Duration,
    known: BTreeMap<String, StorageVersion>,
    synced: bool,
}

impl CatalogWatcher {
    pub fn new(config: CatalogConfig) -> Result<Self, CatalogError> {
        let base = Url::parse(&config.url).map_err(|e| CatalogError::InvalidUrl(e.to_string()))?;
        let url = base
            .join(STORAGE_VERSIONS_PATH)
            .map_err(|e| CatalogError::InvalidUrl(e.to_string()))?;

        let token = match &config.bearer_token_file {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|source| CatalogError::Token {
                        path: path.clone(),
                        source,
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(config.request_timeout))
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            url,
            token,
            relist_interval: config.relist_interval,
            known: BTreeMap::new(),
            synced: false,
        })
    }

    /// Relists until cancelled or until the receiving side is dropped.
    /// Cancellation also interrupts a listing in flight and its retries.
    pub async fn run(mut self, tx: mpsc::Sender<CatalogEvent>, shutdown: CancellationToken) {
        loop {
            let listed = tokio::select! {
                _ = shutdown.cancelled() => return,
                listed = self.list() => listed,
            };
            match listed {
                Ok(items) => {
                    let published = tokio::select! {
                        _ = shutdown.cancelled() => return,
                        published = self.publish(items, &tx) => published,
                    };
                    if let Err(error) = published {
                        tracing::warn!(%error, "stopping catalog watcher");
                        return;
                    }
                }
                Err(error) => {
                    counter!(CATALOG_LIST_FAILURES).increment(1);
                    tracing::error!(%error, "failed to list catalog, keeping previous state");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.relist_interval) => {}
            }
        }
    }

    async fn publish(
        &mut self,
        items: Vec<StorageVersion>,
        tx: &mpsc::Sender<CatalogEvent>,
    ) -> Result<(), CatalogError> {
        for event in self.diff(items) {
            tx.send(event).await.map_err(|_| CatalogError::ChannelClosed)?;
        }
        if !self.synced {
            self.synced = true;
            tx.send(CatalogEvent::Synced)
                .await
                .map_err(|_| CatalogError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StorageVersion>, CatalogError> {
        let mut retries = 0;
        loop {
            let mut request = self.client.get(self.url.clone());
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let list: StorageVersionList = response.json().await?;
                    return Ok(list.items);
                }
                Ok(response) => format!("status {}", response.status()),
                Err(err) => err.to_string(),
            };

            if retries >= MAX_RETRIES {
                tracing::warn!(url = %self.url, error = %failure, "catalog listing retries exhausted");
                return Err(CatalogError::RetriesExceeded);
            }
            let retry_millis = BASE_DELAY_MS * 2_u64.pow(retries);
            tokio::time::sleep(Duration::from_millis(retry_millis)).await;
            retries += 1;
        }
    }

    /// Events that take the known state to `items`: updates and deletions of
    /// known objects first, then additions, each in name order.
    fn diff(&mut self, items: Vec<StorageVersion>) -> Vec<CatalogEvent> {
        let mut listed: BTreeMap<String, StorageVersion> = items
            .into_iter()
            .map(|sv| (sv.metadata.name.clone(), sv))
            .collect();
        let mut events = Vec::new();

        let previous = std::mem::take(&mut self.known);
        for (name, old) in previous {
            match listed.remove(&name) {
                None => events.push(CatalogEvent::Deleted(old)),
                Some(new) if new != old => {
                    self.known.insert(name, new.clone());
                    events.push(CatalogEvent::Updated { old, new });
                }
                Some(same) => {
                    self.known.insert(name, same);
                }
            }
        }
        for (name, new) in listed {
            self.known.insert(name, new.clone());
            events.push(CatalogEvent::Added(new));
        }

        events
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One `(server id, decodable version)` entry per tuple.
    pub(crate) fn storage_version(name: &str, entries: &[(&str, &str)]) -> StorageVersion {
        StorageVersion {
            metadata: ObjectMeta { name: name.into() },
            status: StorageVersionStatus {
                storage_versions: entries
                    .iter()
                    .map(|(id, version)| ServerStorageVersion {
                        api_server_id: id.to_string(),
                        encoding_version: version.to_string(),
                        decodable_versions: vec![version.to_string()],
                        served_versions: vec![version.to_string()],
                    })
                    .collect(),
            },
        }
    }

    fn watcher() -> CatalogWatcher {
        CatalogWatcher::new(CatalogConfig {
            url: "http://127.0.0.1:1".into(),
            relist_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            bearer_token_file: None,
        })
        .unwrap()
    }

    #[test]
    fn test_decode_k8s_shape() {
        let json = r#"{"kind":"StorageVersionList","items":[{"metadata":{"name":"apps.deployments","uid":"x"},
            "status":{"storageVersions":[{"apiServerID":"a","encodingVersion":"apps/v1",
            "decodableVersions":["apps/v1"],"servedVersions":["apps/v1"]}],"commonEncodingVersion":"apps/v1"}}]}"#;
        let list: StorageVersionList = serde_json::from_str(json).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].name(), "apps.deployments");
        assert_eq!(list.items[0].status.storage_versions[0].api_server_id, "a");
    }

    #[test]
    fn test_diff_events() {
        let mut watcher = watcher();
        assert_eq!(watcher.url.path(), STORAGE_VERSIONS_PATH);

        let deployments = storage_version("apps.deployments", &[("a", "apps/v1")]);
        let pods = storage_version("core.pods", &[("a", "v1")]);
        let events = watcher.diff(vec![pods.clone(), deployments.clone()]);
        assert_eq!(
            events,
            vec![
                CatalogEvent::Added(deployments.clone()),
                CatalogEvent::Added(pods.clone())
            ]
        );

        assert!(watcher.diff(vec![deployments.clone(), pods.clone()]).is_empty());

        let moved = storage_version("apps.deployments", &[("b", "apps/v1")]);
        let events = watcher.diff(vec![moved.clone()]);
        assert_eq!(
            events,
            vec![
                CatalogEvent::Updated {
                    old: deployments,
                    new: moved
                },
                CatalogEvent::Deleted(pods),
            ]
        );
    }

    #[tokio::test]
    async fn test_synced_follows_first_listing() {
        let mut watcher = watcher();
        let (tx, mut rx) = mpsc::channel(8);
        watcher
            .publish(vec![storage_version("core.pods", &[("a", "v1")])], &tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "added");
        assert_eq!(rx.recv().await.unwrap(), CatalogEvent::Synced);

        watcher.publish(vec![], &tx).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind(), "deleted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_list() {
        // accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let watcher = CatalogWatcher::new(CatalogConfig {
            url: format!("http://{addr}"),
            relist_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            bearer_token_file: None,
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(tx, shutdown.clone()));

        let (_socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher stops while the listing hangs")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_timeout_bounds_a_listing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let watcher = CatalogWatcher::new(CatalogConfig {
            url: format!("http://{addr}"),
            relist_interval: Duration::from_secs(60),
            request_timeout: Duration::from_millis(100),
            bearer_token_file: None,
        })
        .unwrap();

        let listed = tokio::time::timeout(Duration::from_secs(30), watcher.list()).await;
        assert!(matches!(listed, Ok(Err(CatalogError::RetriesExceeded))));
    }
}

use crate::catalog::{CatalogEvent, StorageVersion};
use dashmap::{DashMap, DashSet};
use shared::request_info::Gvr;

/// Who can serve a resource version, as seen by one server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Serviceability {
    /// Some catalog entry names the local server.
    Local,
    /// Only peers can serve it. May be empty.
    Peers(Vec<String>),
}

/// GVR -> ids of the servers able to decode it, built from catalog events.
/// Keys absent from the index are resources the catalog does not track at
/// all (aggregated APIs, custom resources).
#[derive(Debug, Default)]
pub struct ServiceabilityIndex {
    servers: DashMap<Gvr, DashSet<String>>,
}

fn split_name(name: &str) -> Option<(&str, &str)> {
    let (group, resource) = name.rsplit_once('.')?;
    if resource.is_empty() {
        return None;
    }
    Some((group, resource))
}

// Catalog versions sometimes carry their group (`apps/v1`).
fn bare_version(version: &str) -> &str {
    match version.split_once('/') {
        Some((_, bare)) if !bare.contains('/') => bare,
        _ => version,
    }
}

/// Every `(gvr, server id)` pair an object contributes.
fn entries(sv: &StorageVersion) -> Vec<(Gvr, &str)> {
    let Some((group, resource)) = split_name(sv.name()) else {
        tracing::warn!(name = sv.name(), "ignoring catalog object with malformed name");
        return Vec::new();
    };

    sv.status
        .storage_versions
        .iter()
        .flat_map(|server| {
            server.decodable_versions.iter().map(move |version| {
                (
                    Gvr::new(group, bare_version(version), resource),
                    server.api_server_id.as_str(),
                )
            })
        })
        .collect()
}

impl ServiceabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sv: &StorageVersion) {
        for (gvr, server) in entries(sv) {
            self.servers.entry(gvr).or_default().insert(server.to_string());
        }
    }

    /// Drops every GVR the object contributes, including entries other
    /// objects added for the same GVR.
    pub fn remove(&self, sv: &StorageVersion) {
        for (gvr, _) in entries(sv) {
            self.servers.remove(&gvr);
        }
    }

    pub fn update(&self, old: &StorageVersion, new: &StorageVersion) {
        self.remove(old);
        self.add(new);
    }

    /// Applies one catalog change. `Synced` carries no data.
    pub fn apply(&self, event: &CatalogEvent) {
        match event {
            CatalogEvent::Added(sv) => self.add(sv),
            CatalogEvent::Updated { old, new } => self.update(old, new),
            CatalogEvent::Deleted(sv) => self.remove(sv),
            CatalogEvent::Synced => {}
        }
    }

    /// `None` when the GVR is untracked.
    pub fn serviceability(&self, gvr: &Gvr, local_id: &str) -> Option<Serviceability> {
        let servers = self.servers.get(gvr)?;
        if servers.contains(local_id) {
            return Some(Serviceability::Local);
        }
        let mut peers: Vec<String> = servers.iter().map(|id| id.key().clone()).collect();
        peers.sort();
        Some(Serviceability::Peers(peers))
    }

    pub fn contains(&self, gvr: &Gvr, server: &str) -> bool {
        self.servers
            .get(gvr)
            .is_some_and(|servers| servers.contains(server))
    }

    pub fn servers(&self, gvr: &Gvr) -> Option<Vec<String>> {
        let servers = self.servers.get(gvr)?;
        let mut ids: Vec<String> = servers.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        Some(ids)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::storage_version;

    fn deployments(version: &str) -> Gvr {
        Gvr::new("apps", version, "deployments")
    }

    #[test]
    fn test_add_normalizes_versions() {
        let index = ServiceabilityIndex::new();
        index.add(&storage_version(
            "apps.deployments",
            &[("a", "apps/v1"), ("a", "apps/v1beta2"), ("b", "v1")],
        ));

        assert_eq!(index.servers(&deployments("v1")).unwrap(), vec!["a", "b"]);
        assert_eq!(index.servers(&deployments("v1beta2")).unwrap(), vec!["a"]);
        assert!(index.servers(&deployments("apps/v1")).is_none());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_group_split_at_last_dot() {
        let index = ServiceabilityIndex::new();
        index.add(&storage_version(
            "networking.k8s.io.ingresses",
            &[("a", "networking.k8s.io/v1")],
        ));
        index.add(&storage_version("core.pods", &[("a", "v1")]));

        assert!(index.contains(&Gvr::new("networking.k8s.io", "v1", "ingresses"), "a"));
        assert!(index.contains(&Gvr::new("core", "v1", "pods"), "a"));
    }

    #[test]
    fn test_malformed_names_are_ignored() {
        let index = ServiceabilityIndex::new();
        index.add(&storage_version("pods", &[("a", "v1")]));
        index.add(&storage_version("apps.", &[("a", "v1")]));
        assert!(index.is_empty());
        index.remove(&storage_version("pods", &[("a", "v1")]));
    }

    #[test]
    fn test_update_replaces_and_delete_clears() {
        let index = ServiceabilityIndex::new();
        let old = storage_version("apps.deployments", &[("a", "apps/v1")]);
        let new = storage_version("apps.deployments", &[("b", "apps/v1"), ("c", "apps/v2")]);

        index.apply(&CatalogEvent::Added(old.clone()));
        index.apply(&CatalogEvent::Updated {
            old,
            new: new.clone(),
        });
        assert_eq!(index.servers(&deployments("v1")).unwrap(), vec!["b"]);
        assert_eq!(index.servers(&deployments("v2")).unwrap(), vec!["c"]);

        index.apply(&CatalogEvent::Deleted(new));
        assert!(index.is_empty());
    }

    #[test]
    fn test_serviceability() {
        let index = ServiceabilityIndex::new();
        index.add(&storage_version("apps.deployments", &[("a", "apps/v1"), ("b", "apps/v1")]));

        assert_eq!(
            index.serviceability(&deployments("v1"), "c"),
            Some(Serviceability::Peers(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            index.serviceability(&deployments("v1"), "b"),
            Some(Serviceability::Local)
        );
        assert_eq!(index.serviceability(&deployments("v9"), "c"), None);
    }

    #[test]
    fn test_concurrent_writers() {
        let index = std::sync::Arc::new(ServiceabilityIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let index = index.clone();
                std::thread::spawn(move || {
                    let id = format!("server-{i}");
                    for _ in 0..100 {
                        index.add(&storage_version("core.pods", &[(id.as_str(), "v1")]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.servers(&Gvr::new("core", "v1", "pods")).unwrap().len(), 8);
    }
}

//! Request classification for the API path grammar, plus the caller identity
//! that travels with a request through the pipeline.
//!
//! Resource paths look like
//! `/api/v1/namespaces/{ns}/{resource}/{name}/{subresource}` for the legacy
//! core group and `/apis/{group}/{version}/...` for everything else. Anything
//! else is a non-resource request (`/healthz`, `/version`, `/apis`, ...).

use http::{Method, Uri};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Group, version and resource of an API collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

/// The authenticated caller. Stored as a request extension.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            name: name.into(),
            groups,
            ..Default::default()
        }
    }
}

/// What a request is trying to do. Stored as a request extension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub resource_request: bool,
    pub path: String,
    /// Lowercased HTTP method for non-resource requests, the API verb
    /// (`get`, `list`, `watch`, `create`, ...) otherwise.
    pub verb: String,
    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub parts: Vec<String>,
}

impl RequestInfo {
    pub fn gvr(&self) -> Gvr {
        Gvr::new(&self.api_group, &self.api_version, &self.resource)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestInfoError {
    #[error("unable to determine kind and namespace from url {0}")]
    MissingResource(String),
}

pub struct RequestInfoResolver {
    api_prefixes: HashSet<String>,
    groupless_api_prefixes: HashSet<String>,
}

impl Default for RequestInfoResolver {
    fn default() -> Self {
        Self {
            api_prefixes: ["api", "apis"].into_iter().map(String::from).collect(),
            groupless_api_prefixes: ["api"].into_iter().map(String::from).collect(),
        }
    }
}

// Verbs that can appear as a path segment before the resource.
const SPECIAL_VERBS: &[&str] = &["proxy", "watch"];
// Verbs whose trailing path is not a subresource.
const SPECIAL_VERBS_NO_SUBRESOURCES: &[&str] = &["proxy"];
// Subresources of a namespace that are addressed below /namespaces/{name}.
const NAMESPACE_SUBRESOURCES: &[&str] = &["status", "finalize"];

impl RequestInfoResolver {
    pub fn resolve(&self, method: &Method, uri: &Uri) -> Result<RequestInfo, RequestInfoError> {
        let path = uri.path();
        let mut info = RequestInfo {
            resource_request: false,
            path: path.to_string(),
            verb: method.as_str().to_ascii_lowercase(),
            ..Default::default()
        };

        let mut parts: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();

        if parts.is_empty() || !self.api_prefixes.contains(&parts[0]) {
            return Ok(info);
        }
        info.api_prefix = parts.remove(0);

        if !self.groupless_api_prefixes.contains(&info.api_prefix) {
            // /apis/{group} with nothing after it is discovery.
            if parts.len() < 2 {
                return Ok(info);
            }
            info.api_group = parts.remove(0);
        }

        if parts.is_empty() {
            return Ok(info);
        }
        info.api_version = parts.remove(0);

        if parts.is_empty() {
            return Ok(info);
        }

        info.resource_request = true;

        if SPECIAL_VERBS.contains(&parts[0].as_str()) {
            if parts.len() < 2 {
                return Err(RequestInfoError::MissingResource(path.to_string()));
            }
            info.verb = parts.remove(0);
        } else {
            info.verb = match *method {
                Method::POST => "create",
                Method::GET | Method::HEAD => "get",
                Method::PUT => "update",
                Method::PATCH => "patch",
                Method::DELETE => "delete",
                _ => "",
            }
            .to_string();
        }

        if parts[0] == "namespaces" {
            if parts.len() > 1 {
                info.namespace = parts[1].clone();
                // /namespaces/{ns}/{resource}... addresses a namespaced
                // resource; /namespaces/{ns}/status is the namespace itself.
                if parts.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&parts[2].as_str()) {
                    parts.drain(..2);
                }
            }
        }

        if parts.len() >= 3 && !SPECIAL_VERBS_NO_SUBRESOURCES.contains(&info.verb.as_str()) {
            info.subresource = parts[2].clone();
        }
        if parts.len() >= 2 {
            info.name = parts[1].clone();
        }
        info.resource = parts[0].clone();

        if info.name.is_empty() && info.verb == "get" {
            info.verb = if is_watch(uri) { "watch" } else { "list" }.to_string();
        }
        if info.name.is_empty() && info.verb == "delete" {
            info.verb = "deletecollection".to_string();
        }

        info.parts = parts;
        Ok(info)
    }
}

fn is_watch(uri: &Uri) -> bool {
    let Some(query) = uri.query() else {
        return false;
    };
    url::form_urlencoded::parse(query.as_bytes())
        .any(|(key, value)| key == "watch" && matches!(value.as_ref(), "true" | "1"))
}

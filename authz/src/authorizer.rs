use async_trait::async_trait;
use shared::request_info::{RequestInfo, UserInfo};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
    NoOpinion,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::NoOpinion => "no-opinion",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn no_opinion(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::NoOpinion,
            reason: reason.into(),
        }
    }
}

/// Everything an authorizer gets to look at for one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub user: UserInfo,
    pub verb: String,
    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub resource_request: bool,
    pub path: String,
}

impl Attributes {
    pub fn new(user: UserInfo, info: &RequestInfo) -> Self {
        Self {
            user,
            verb: info.verb.clone(),
            namespace: info.namespace.clone(),
            api_group: info.api_group.clone(),
            api_version: info.api_version.clone(),
            resource: info.resource.clone(),
            subresource: info.subresource.clone(),
            name: info.name.clone(),
            resource_request: info.resource_request,
            path: info.path.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceRuleInfo {
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub resource_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NonResourceRuleInfo {
    pub verbs: Vec<String>,
    pub non_resource_urls: Vec<String>,
}

/// Rules a user holds in a namespace. `incomplete` means some source could
/// not be evaluated and the user may hold more than what is listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub resource_rules: Vec<ResourceRuleInfo>,
    pub non_resource_rules: Vec<NonResourceRuleInfo>,
    pub incomplete: bool,
}

#[derive(Debug, Default)]
pub struct RulesOutcome {
    pub rules: RuleSet,
    pub error: Option<AuthzError>,
}

impl RulesOutcome {
    pub fn complete(rules: RuleSet) -> Self {
        Self { rules, error: None }
    }

    pub fn failed(error: AuthzError) -> Self {
        Self {
            rules: RuleSet {
                incomplete: true,
                ..Default::default()
            },
            error: Some(error),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AuthzError {
    #[error("webhook {name} failed: {message}")]
    Webhook { name: String, message: String },
    #[error("webhook authorizer does not support user rule resolution")]
    RuleResolutionUnsupported,
    #[error("{0}")]
    Backend(String),
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<AuthzError>),
    /// No link decided and some failed. `reason` joins the NoOpinion reasons
    /// of the links that answered.
    #[error("{source}")]
    Undecided {
        reason: String,
        #[source]
        source: Box<AuthzError>,
    },
}

fn format_aggregate(errors: &[AuthzError]) -> String {
    match errors {
        [] => String::new(),
        [only] => only.to_string(),
        many => {
            let joined: Vec<String> = many.iter().map(ToString::to_string).collect();
            format!("[{}]", joined.join(", "))
        }
    }
}

impl AuthzError {
    /// Collapses collected errors: none, the single error, or an aggregate.
    pub fn aggregate(mut errors: Vec<AuthzError>) -> Option<AuthzError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(AuthzError::Aggregate(errors)),
        }
    }

    /// NoOpinion reasons collected alongside the failure, if any.
    pub fn reason(&self) -> &str {
        match self {
            AuthzError::Undecided { reason, .. } => reason,
            _ => "",
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError>;
}

pub trait RuleResolver: Send + Sync {
    fn rules_for(&self, user: &UserInfo, namespace: &str) -> RulesOutcome;
}

/// Pre-wired backends (node, RBAC, ABAC) provide both capabilities.
pub trait AuthorizerAndResolver: Authorizer + RuleResolver {}

impl<T: Authorizer + RuleResolver> AuthorizerAndResolver for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_formatting() {
        assert!(AuthzError::aggregate(vec![]).is_none());

        let single = AuthzError::aggregate(vec![AuthzError::Backend("boom".into())]).unwrap();
        assert_eq!(single.to_string(), "boom");

        let many = AuthzError::aggregate(vec![
            AuthzError::Backend("a".into()),
            AuthzError::RuleResolutionUnsupported,
        ])
        .unwrap();
        assert_eq!(
            many.to_string(),
            "[a, webhook authorizer does not support user rule resolution]"
        );
    }

    #[test]
    fn test_attributes_from_request() {
        let info = RequestInfo {
            resource_request: true,
            verb: "list".into(),
            api_group: "apps".into(),
            api_version: "v1".into(),
            resource: "deployments".into(),
            ..Default::default()
        };
        let attrs = Attributes::new(UserInfo::new("alice", vec![]), &info);
        assert_eq!(attrs.verb, "list");
        assert_eq!(attrs.api_group, "apps");
        assert_eq!(attrs.user.name, "alice");
    }
}

use crate::authorizer::{
    Attributes, AuthzError, Authorizer, NonResourceRuleInfo, ResourceRuleInfo, RuleResolver,
    RuleSet, RulesOutcome, Verdict,
};
use async_trait::async_trait;
use shared::request_info::UserInfo;
use std::collections::HashSet;

pub const SYSTEM_PRIVILEGED_GROUP: &str = "system:masters";

/// Allows any user in one of the configured groups. Always the first link
/// in the chain, so a superuser never depends on the rest of the chain.
#[derive(Clone, Debug)]
pub struct PrivilegedGroups {
    groups: HashSet<String>,
}

impl PrivilegedGroups {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PrivilegedGroups {
    fn default() -> Self {
        Self::new([SYSTEM_PRIVILEGED_GROUP])
    }
}

#[async_trait]
impl Authorizer for PrivilegedGroups {
    async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError> {
        if attrs.user.groups.iter().any(|g| self.groups.contains(g)) {
            return Ok(Verdict::allow(""));
        }
        Ok(Verdict::no_opinion(""))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAllow;

#[async_trait]
impl Authorizer for AlwaysAllow {
    async fn authorize(&self, _attrs: &Attributes) -> Result<Verdict, AuthzError> {
        Ok(Verdict::allow(""))
    }
}

impl RuleResolver for AlwaysAllow {
    fn rules_for(&self, _user: &UserInfo, _namespace: &str) -> RulesOutcome {
        let star = || vec!["*".to_string()];
        RulesOutcome::complete(RuleSet {
            resource_rules: vec![ResourceRuleInfo {
                verbs: star(),
                api_groups: star(),
                resources: star(),
                resource_names: Vec::new(),
            }],
            non_resource_rules: vec![NonResourceRuleInfo {
                verbs: star(),
                non_resource_urls: star(),
            }],
            incomplete: false,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysDeny;

#[async_trait]
impl Authorizer for AlwaysDeny {
    async fn authorize(&self, _attrs: &Attributes) -> Result<Verdict, AuthzError> {
        Ok(Verdict::deny("Everything is forbidden."))
    }
}

impl RuleResolver for AlwaysDeny {
    fn rules_for(&self, _user: &UserInfo, _namespace: &str) -> RulesOutcome {
        RulesOutcome::complete(RuleSet::default())
    }
}

use crate::authorizer::{
    Attributes, AuthorizerAndResolver, AuthzError, Authorizer, Decision, RuleResolver,
    RulesOutcome, Verdict,
};
use crate::builtin::{AlwaysAllow, AlwaysDeny, PrivilegedGroups};
use crate::webhook::WebhookAuthorizer;
use async_trait::async_trait;
use shared::request_info::UserInfo;
use std::sync::Arc;

/// One link of an authorization chain. The set of kinds is closed; each kind
/// exposes the authorizer capability and, except for the superuser bypass,
/// the rule resolver capability.
#[derive(Clone)]
pub enum ChainLink {
    PrivilegedGroups(PrivilegedGroups),
    AlwaysAllow(AlwaysAllow),
    AlwaysDeny(AlwaysDeny),
    Webhook(Arc<WebhookAuthorizer>),
    Node(Arc<dyn AuthorizerAndResolver>),
    Rbac(Arc<dyn AuthorizerAndResolver>),
    Abac(Arc<dyn AuthorizerAndResolver>),
}

impl ChainLink {
    pub fn name(&self) -> &str {
        match self {
            ChainLink::PrivilegedGroups(_) => "privileged-groups",
            ChainLink::AlwaysAllow(_) => "always-allow",
            ChainLink::AlwaysDeny(_) => "always-deny",
            ChainLink::Webhook(webhook) => webhook.name(),
            ChainLink::Node(_) => "node",
            ChainLink::Rbac(_) => "rbac",
            ChainLink::Abac(_) => "abac",
        }
    }

    pub async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError> {
        match self {
            ChainLink::PrivilegedGroups(a) => a.authorize(attrs).await,
            ChainLink::AlwaysAllow(a) => a.authorize(attrs).await,
            ChainLink::AlwaysDeny(a) => a.authorize(attrs).await,
            ChainLink::Webhook(a) => a.authorize(attrs).await,
            ChainLink::Node(a) | ChainLink::Rbac(a) | ChainLink::Abac(a) => {
                a.authorize(attrs).await
            }
        }
    }

    /// `None` for links that do not resolve rules.
    pub fn rules_for(&self, user: &UserInfo, namespace: &str) -> Option<RulesOutcome> {
        Some(match self {
            ChainLink::PrivilegedGroups(_) => return None,
            ChainLink::AlwaysAllow(r) => r.rules_for(user, namespace),
            ChainLink::AlwaysDeny(r) => r.rules_for(user, namespace),
            ChainLink::Webhook(r) => r.rules_for(user, namespace),
            ChainLink::Node(r) | ChainLink::Rbac(r) | ChainLink::Abac(r) => {
                r.rules_for(user, namespace)
            }
        })
    }
}

/// Asks each link in order. The first Allow or Deny wins; errors are
/// remembered and the next link is consulted.
pub struct UnionAuthorizer {
    links: Vec<ChainLink>,
}

impl UnionAuthorizer {
    pub fn new(links: Vec<ChainLink>) -> Self {
        Self { links }
    }
}

#[async_trait]
impl Authorizer for UnionAuthorizer {
    async fn authorize(&self, attrs: &Attributes) -> Result<Verdict, AuthzError> {
        let mut errors = Vec::new();
        let mut reasons = Vec::new();

        for link in &self.links {
            match link.authorize(attrs).await {
                Ok(verdict) => match verdict.decision {
                    Decision::Allow | Decision::Deny => return Ok(verdict),
                    Decision::NoOpinion => {
                        if !verdict.reason.is_empty() {
                            reasons.push(verdict.reason);
                        }
                    }
                },
                Err(err) => {
                    tracing::debug!(authorizer = link.name(), error = %err, "authorizer failed");
                    errors.push(err);
                }
            }
        }

        let reason = reasons.join("\n");
        match AuthzError::aggregate(errors) {
            None => Ok(Verdict::no_opinion(reason)),
            Some(err) if reason.is_empty() => Err(err),
            Some(err) => Err(AuthzError::Undecided {
                reason,
                source: Box::new(err),
            }),
        }
    }
}

/// Concatenates the rules of every link. A failing link marks the result
/// incomplete without discarding what the others returned.
pub struct UnionRuleResolver {
    links: Vec<ChainLink>,
}

impl UnionRuleResolver {
    pub fn new(links: Vec<ChainLink>) -> Self {
        Self { links }
    }
}

impl RuleResolver for UnionRuleResolver {
    fn rules_for(&self, user: &UserInfo, namespace: &str) -> RulesOutcome {
        let mut outcome = RulesOutcome::default();
        let mut errors = Vec::new();

        for link in &self.links {
            let Some(part) = link.rules_for(user, namespace) else {
                continue;
            };
            outcome.rules.resource_rules.extend(part.rules.resource_rules);
            outcome
                .rules
                .non_resource_rules
                .extend(part.rules.non_resource_rules);
            if part.rules.incomplete {
                outcome.rules.incomplete = true;
            }
            if let Some(err) = part.error {
                outcome.rules.incomplete = true;
                errors.push(err);
            }
        }

        outcome.error = AuthzError::aggregate(errors);
        outcome
    }
}

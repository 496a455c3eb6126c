//! The structured authorization configuration file and its validation.

use crate::duration::GoDuration;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const SUPPORTED_API_VERSIONS: &[&str] = &[
    "apiserver.config.k8s.io/v1",
    "apiserver.config.k8s.io/v1beta1",
    "apiserver.config.k8s.io/v1alpha1",
];
const KIND: &str = "AuthorizationConfiguration";
const SUPPORTED_SAR_VERSIONS: &[&str] = &["v1", "v1beta1"];
const MAX_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AuthorizerType {
    Webhook,
    Node,
    Rbac,
    Abac,
    AlwaysAllow,
    AlwaysDeny,
    Unknown(String),
}

impl AuthorizerType {
    pub fn as_str(&self) -> &str {
        match self {
            AuthorizerType::Webhook => "Webhook",
            AuthorizerType::Node => "Node",
            AuthorizerType::Rbac => "RBAC",
            AuthorizerType::Abac => "ABAC",
            AuthorizerType::AlwaysAllow => "AlwaysAllow",
            AuthorizerType::AlwaysDeny => "AlwaysDeny",
            AuthorizerType::Unknown(name) => name,
        }
    }
}

impl From<String> for AuthorizerType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Webhook" => AuthorizerType::Webhook,
            "Node" => AuthorizerType::Node,
            "RBAC" => AuthorizerType::Rbac,
            "ABAC" => AuthorizerType::Abac,
            "AlwaysAllow" => AuthorizerType::AlwaysAllow,
            "AlwaysDeny" => AuthorizerType::AlwaysDeny,
            _ => AuthorizerType::Unknown(value),
        }
    }
}

impl<'de> Deserialize<'de> for AuthorizerType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl fmt::Display for AuthorizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FailurePolicy {
    NoOpinion,
    Deny,
    Unknown(String),
}

impl From<String> for FailurePolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "NoOpinion" => FailurePolicy::NoOpinion,
            "Deny" => FailurePolicy::Deny,
            _ => FailurePolicy::Unknown(value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ConnectionInfoType {
    KubeConfigFile,
    InClusterConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthorizationConfiguration {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub authorizers: Vec<AuthorizerConfiguration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizerConfiguration {
    #[serde(rename = "type")]
    pub r#type: AuthorizerType,
    pub name: String,
    #[serde(default)]
    pub webhook: Option<WebhookConfiguration>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebhookConfiguration {
    pub timeout: GoDuration,
    #[serde(rename = "authorizedTTL")]
    pub authorized_ttl: GoDuration,
    #[serde(rename = "unauthorizedTTL")]
    pub unauthorized_ttl: GoDuration,
    pub subject_access_review_version: String,
    #[serde(default)]
    pub match_condition_subject_access_review_version: String,
    pub failure_policy: FailurePolicy,
    pub connection_info: WebhookConnectionInfo,
    #[serde(default)]
    pub match_conditions: Vec<WebhookMatchCondition>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebhookConnectionInfo {
    #[serde(rename = "type")]
    pub r#type: ConnectionInfoType,
    #[serde(default)]
    pub kube_config_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookMatchCondition {
    pub expression: String,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("unsupported apiVersion {0:?}")]
    UnsupportedApiVersion(String),
    #[error("unexpected kind {0:?}, expected {KIND}")]
    UnexpectedKind(String),
    #[error("authorizers: at least one authorization mode must be defined")]
    NoAuthorizers,
    #[error("authorizers[{0}].name: Required value")]
    EmptyName(usize),
    #[error("authorizers[{index}].name: {name:?} must be a lowercase DNS-1123 name")]
    InvalidName { index: usize, name: String },
    #[error("authorizers[{index}].name: Duplicate value {name:?}")]
    DuplicateName { index: usize, name: String },
    #[error("authorizers[{index}].type: Unsupported value {value:?}")]
    UnsupportedType { index: usize, value: String },
    #[error("authorizers[{index}].type: Duplicate value {value:?}")]
    DuplicateType { index: usize, value: String },
    #[error("authorizers[{0}].webhook: Required value when type=Webhook")]
    MissingWebhookConfig(usize),
    #[error("authorizers[{index}].webhook: Invalid value, non-null only when type=Webhook, got type={value:?}")]
    UnexpectedWebhookConfig { index: usize, value: String },
    #[error("authorizers[{index}].webhook.timeout: must be greater than 0s and at most 30s, got {value}")]
    InvalidTimeout { index: usize, value: GoDuration },
    #[error("authorizers[{index}].webhook.{field}: must not be negative")]
    NegativeTtl { index: usize, field: &'static str },
    #[error("authorizers[{index}].webhook.subjectAccessReviewVersion: Unsupported value {value:?}")]
    UnsupportedSarVersion { index: usize, value: String },
    #[error("authorizers[{0}].webhook.connectionInfo.kubeConfigFile: Required value when type=KubeConfigFile")]
    MissingKubeConfigFile(usize),
    #[error("authorizers[{0}].webhook.connectionInfo.kubeConfigFile: must be empty when type=InClusterConfig")]
    UnexpectedKubeConfigFile(usize),
    #[error("authorizers[{0}].webhook.matchConditions: match conditions are not supported")]
    MatchConditionsUnsupported(usize),
    #[error("authorizers: required authorizer type {0} is missing")]
    RequiredTypeMissing(AuthorizerType),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not parse authorization config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid authorization config: {0}")]
    Validation(#[from] ValidationError),
}

fn is_dns_name(name: &str) -> bool {
    name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

impl AuthorizationConfiguration {
    pub fn validate(&self, required_types: &HashSet<AuthorizerType>) -> Result<(), ValidationError> {
        if !SUPPORTED_API_VERSIONS.contains(&self.api_version.as_str()) {
            return Err(ValidationError::UnsupportedApiVersion(self.api_version.clone()));
        }
        if self.kind != KIND {
            return Err(ValidationError::UnexpectedKind(self.kind.clone()));
        }
        if self.authorizers.is_empty() {
            return Err(ValidationError::NoAuthorizers);
        }

        let mut seen_names = HashSet::new();
        let mut seen_types = HashSet::new();

        for (index, authorizer) in self.authorizers.iter().enumerate() {
            authorizer.validate(index)?;

            if !seen_names.insert(authorizer.name.as_str()) {
                return Err(ValidationError::DuplicateName {
                    index,
                    name: authorizer.name.clone(),
                });
            }
            if authorizer.r#type != AuthorizerType::Webhook
                && !seen_types.insert(&authorizer.r#type)
            {
                return Err(ValidationError::DuplicateType {
                    index,
                    value: authorizer.r#type.to_string(),
                });
            }
        }

        for required in required_types {
            if !self.authorizers.iter().any(|a| &a.r#type == required) {
                return Err(ValidationError::RequiredTypeMissing(required.clone()));
            }
        }

        Ok(())
    }

    pub fn types(&self) -> impl Iterator<Item = &AuthorizerType> {
        self.authorizers.iter().map(|a| &a.r#type)
    }
}

impl AuthorizerConfiguration {
    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName(index));
        }
        if !is_dns_name(&self.name) {
            return Err(ValidationError::InvalidName {
                index,
                name: self.name.clone(),
            });
        }

        match (&self.r#type, &self.webhook) {
            (AuthorizerType::Unknown(value), _) => Err(ValidationError::UnsupportedType {
                index,
                value: value.clone(),
            }),
            (AuthorizerType::Webhook, None) => Err(ValidationError::MissingWebhookConfig(index)),
            (AuthorizerType::Webhook, Some(webhook)) => webhook.validate(index),
            (other, Some(_)) => Err(ValidationError::UnexpectedWebhookConfig {
                index,
                value: other.to_string(),
            }),
            (_, None) => Ok(()),
        }
    }
}

impl WebhookConfiguration {
    fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.timeout.is_negative()
            || self.timeout.is_zero()
            || self.timeout.as_duration() > MAX_WEBHOOK_TIMEOUT
        {
            return Err(ValidationError::InvalidTimeout {
                index,
                value: self.timeout,
            });
        }
        if self.authorized_ttl.is_negative() {
            return Err(ValidationError::NegativeTtl {
                index,
                field: "authorizedTTL",
            });
        }
        if self.unauthorized_ttl.is_negative() {
            return Err(ValidationError::NegativeTtl {
                index,
                field: "unauthorizedTTL",
            });
        }
        if !SUPPORTED_SAR_VERSIONS.contains(&self.subject_access_review_version.as_str()) {
            return Err(ValidationError::UnsupportedSarVersion {
                index,
                value: self.subject_access_review_version.clone(),
            });
        }
        match (self.connection_info.r#type, &self.connection_info.kube_config_file) {
            (ConnectionInfoType::KubeConfigFile, None) => {
                return Err(ValidationError::MissingKubeConfigFile(index));
            }
            (ConnectionInfoType::InClusterConfig, Some(_)) => {
                return Err(ValidationError::UnexpectedKubeConfigFile(index));
            }
            _ => {}
        }
        // CEL is not evaluated here, so a non-empty list would silently widen
        // what the webhook sees.
        if !self.match_conditions.is_empty() {
            return Err(ValidationError::MatchConditionsUnsupported(index));
        }
        Ok(())
    }
}

/// Parses a YAML or JSON document and validates it.
pub fn load_and_validate(
    data: &[u8],
    required_types: &HashSet<AuthorizerType>,
) -> Result<AuthorizationConfiguration, ConfigError> {
    let config: AuthorizationConfiguration = serde_yaml::from_slice(data)?;
    config.validate(required_types)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEBHOOK_THEN_RBAC: &str = r#"
apiVersion: apiserver.config.k8s.io/v1
kind: AuthorizationConfiguration
authorizers:
  - type: Webhook
    name: webhook
    webhook:
      timeout: 3s
      subjectAccessReviewVersion: v1
      matchConditionSubjectAccessReviewVersion: v1
      failurePolicy: NoOpinion
      authorizedTTL: 5m
      unauthorizedTTL: 30s
      connectionInfo:
        type: KubeConfigFile
        kubeConfigFile: /etc/kubernetes/authz-webhook.yaml
  - type: Node
    name: node
  - type: RBAC
    name: rbac
"#;

    fn none() -> HashSet<AuthorizerType> {
        HashSet::new()
    }

    fn with_authorizers(body: &str) -> String {
        format!(
            "apiVersion: apiserver.config.k8s.io/v1\nkind: AuthorizationConfiguration\nauthorizers:\n{body}"
        )
    }

    #[test]
    fn test_parse_full_config() {
        let config = load_and_validate(WEBHOOK_THEN_RBAC.as_bytes(), &none()).unwrap();
        let types: Vec<_> = config.types().cloned().collect();
        assert_eq!(
            types,
            vec![AuthorizerType::Webhook, AuthorizerType::Node, AuthorizerType::Rbac]
        );

        let webhook = config.authorizers[0].webhook.as_ref().unwrap();
        assert_eq!(webhook.timeout.as_duration(), Duration::from_secs(3));
        assert_eq!(webhook.authorized_ttl.as_duration(), Duration::from_secs(300));
        assert_eq!(webhook.failure_policy, FailurePolicy::NoOpinion);
        assert_eq!(webhook.connection_info.r#type, ConnectionInfoType::KubeConfigFile);
    }

    #[test]
    fn test_json_is_accepted() {
        let json = r#"{"apiVersion":"apiserver.config.k8s.io/v1","kind":"AuthorizationConfiguration",
            "authorizers":[{"type":"AlwaysAllow","name":"allow"}]}"#;
        let config = load_and_validate(json.as_bytes(), &none()).unwrap();
        assert_eq!(config.authorizers[0].r#type, AuthorizerType::AlwaysAllow);
    }

    #[test]
    fn test_semantic_equality_ignores_formatting() {
        let reformatted = WEBHOOK_THEN_RBAC.replace("  - type: Node\n    name: node\n", "  - name: node\n    type: Node\n");
        let a = load_and_validate(WEBHOOK_THEN_RBAC.as_bytes(), &none()).unwrap();
        let b = load_and_validate(format!("# comment\n{reformatted}").as_bytes(), &none()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_validation_errors() {
        let cases: &[(&str, ValidationError)] = &[
            ("[]", ValidationError::NoAuthorizers),
            (
                "  - type: Magic\n    name: magic\n",
                ValidationError::UnsupportedType {
                    index: 0,
                    value: "Magic".into(),
                },
            ),
            (
                "  - type: RBAC\n    name: rbac\n  - type: RBAC\n    name: rbac2\n",
                ValidationError::DuplicateType {
                    index: 1,
                    value: "RBAC".into(),
                },
            ),
            (
                "  - type: RBAC\n    name: a\n  - type: Node\n    name: a\n",
                ValidationError::DuplicateName {
                    index: 1,
                    name: "a".into(),
                },
            ),
            (
                "  - type: RBAC\n    name: Bad_Name\n",
                ValidationError::InvalidName {
                    index: 0,
                    name: "Bad_Name".into(),
                },
            ),
            (
                "  - type: Webhook\n    name: hook\n",
                ValidationError::MissingWebhookConfig(0),
            ),
        ];

        for (authorizers, expected) in cases {
            let doc = if *authorizers == "[]" {
                "apiVersion: apiserver.config.k8s.io/v1\nkind: AuthorizationConfiguration\nauthorizers: []\n".to_string()
            } else {
                with_authorizers(authorizers)
            };
            match load_and_validate(doc.as_bytes(), &none()) {
                Err(ConfigError::Validation(err)) => assert_eq!(&err, expected, "{authorizers}"),
                other => panic!("expected validation error for {authorizers}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_webhook_field_validation() {
        let hook = |extra: &str, connection: &str| {
            with_authorizers(&format!(
                "  - type: Webhook\n    name: hook\n    webhook:\n      timeout: {extra}\n      subjectAccessReviewVersion: v1\n      failurePolicy: Deny\n      authorizedTTL: 1m\n      unauthorizedTTL: 1m\n      connectionInfo:\n{connection}"
            ))
        };
        let in_cluster = "        type: InClusterConfig\n";

        let err = load_and_validate(hook("45s", in_cluster).as_bytes(), &none()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::InvalidTimeout { index: 0, .. })
        ));

        let err = load_and_validate(hook("3s", "        type: KubeConfigFile\n").as_bytes(), &none())
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::MissingKubeConfigFile(0))
        ));

        let ok = load_and_validate(hook("3s", in_cluster).as_bytes(), &none()).unwrap();
        assert_eq!(
            ok.authorizers[0].webhook.as_ref().unwrap().failure_policy,
            FailurePolicy::Deny
        );
    }

    #[test]
    fn test_out_of_range_ttl_is_a_parse_error() {
        let doc = WEBHOOK_THEN_RBAC.replace("authorizedTTL: 5m", "authorizedTTL: 99999999999999999999999h");
        match load_and_validate(doc.as_bytes(), &none()) {
            Err(ConfigError::Parse(err)) => assert!(err.to_string().contains("out of range"), "{err}"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_match_conditions_rejected() {
        let doc = with_authorizers(
            "  - type: Webhook\n    name: hook\n    webhook:\n      timeout: 3s\n      subjectAccessReviewVersion: v1\n      matchConditionSubjectAccessReviewVersion: v1\n      failurePolicy: Deny\n      authorizedTTL: 1m\n      unauthorizedTTL: 1m\n      connectionInfo:\n        type: InClusterConfig\n      matchConditions:\n        - expression: has(request.resourceAttributes)\n",
        );
        let err = load_and_validate(doc.as_bytes(), &none()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::MatchConditionsUnsupported(0))
        ));
    }

    #[test]
    fn test_required_types_and_header() {
        let required: HashSet<_> = [AuthorizerType::Rbac].into_iter().collect();
        let doc = with_authorizers("  - type: Node\n    name: node\n");
        let err = load_and_validate(doc.as_bytes(), &required).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::RequiredTypeMissing(AuthorizerType::Rbac))
        ));

        let doc = "apiVersion: v1\nkind: AuthorizationConfiguration\nauthorizers: []\n";
        let err = load_and_validate(doc.as_bytes(), &none()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::UnsupportedApiVersion(_))
        ));

        assert!(matches!(
            load_and_validate(b"authorizers: [", &none()),
            Err(ConfigError::Parse(_))
        ));
    }
}

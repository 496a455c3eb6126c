pub mod authorizer;
pub mod builtin;
pub mod config;
pub mod duration;
pub mod metrics_defs;
pub mod reload;
pub mod union;
pub mod watch;
pub mod webhook;

pub use authorizer::{
    Attributes, AuthorizerAndResolver, AuthzError, Authorizer, Decision, RuleResolver, RuleSet,
    RulesOutcome, Verdict,
};
pub use config::{AuthorizationConfiguration, AuthorizerType, ConfigError, load_and_validate};
pub use reload::{BuildError, Dependencies, ReloadOutcome, Resolver, ResolverConfig, ResolverError};
pub use webhook::WebhookRetryBackoff;

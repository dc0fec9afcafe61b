//! Declarative rule harness: YAML specs compiled into CEL programs and
//! evaluated against single events or event series.

use thiserror::Error;

pub mod compile;
pub mod enforce;
pub mod env;
pub mod eval;
pub mod metrics;
pub mod prom;
pub mod clickhouse;
pub mod registry;
pub mod spec;
pub mod window;

pub use compile::{CompiledRule, Compiler};
pub use enforce::Enforcer;
pub use eval::{evaluate_event, evaluate_series};
pub use metrics::{MetricsProvider, ProviderError, Selector};
pub use registry::RuleRegistry;
pub use spec::RuleSpec;
pub use window::WindowStore;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("read rule {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse rule yaml {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("rule {path} missing id")]
    MissingId { path: String },

    #[error("rule {rule_id} missing expr")]
    MissingExpr { rule_id: String },

    #[error("rule {rule_id}: unsupported decision {decision:?}")]
    BadDecision { rule_id: String, decision: String },

    #[error("rule {rule_id}: parse expression: {message}")]
    Parse { rule_id: String, message: String },

    #[error("rule {rule_id} eval: {message}")]
    Eval { rule_id: String, message: String },

    #[error("rule {rule_id}: expression must return a boolean, got {got}")]
    NotBoolean { rule_id: String, got: String },

    #[error("series evaluation requires at least one event")]
    EmptySeries,

    #[error("unknown rule {0}")]
    UnknownRule(String),
}

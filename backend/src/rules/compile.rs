//! Rule compilation: bind an expression environment, metrics provider and
//! window store to a rule spec, yielding an immutable `CompiledRule`.

use super::env::{system_clock, Clock, EvalBindings};
use super::metrics::MetricsProvider;
use super::spec::{load_rule_yaml, DecisionBlock, NotifyBlock, RuleSpec};
use super::window::WindowStore;
use super::RuleError;
use cel_interpreter::Program;
use std::path::Path;
use std::sync::Arc;

/// Runtime form of a rule, ready for evaluation. Immutable after compile.
#[derive(Clone)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub category: String,
    pub severity: String,
    pub version: u32,
    pub description: String,
    pub expr: String,
    pub canary: bool,
    /// Some(true) = deny-fail-closed, Some(false) = fail-open with a logged
    /// warning, None = surface evaluation errors to the caller.
    pub block_on_error: Option<bool>,
    pub on_match: DecisionBlock,
    pub notify: NotifyBlock,
    pub docs_url: String,
    pub owners: Vec<String>,
    pub(crate) program: Arc<Program>,
    pub(crate) bindings: EvalBindings,
}

impl std::fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRule")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("expr", &self.expr)
            .field("canary", &self.canary)
            .finish()
    }
}

/// Binds rule specs to their evaluation environment.
#[derive(Clone)]
pub struct Compiler {
    store: Arc<WindowStore>,
    provider: Option<Arc<dyn MetricsProvider>>,
    clock: Clock,
}

impl Compiler {
    pub fn new(store: Arc<WindowStore>) -> Self {
        Self {
            store,
            provider: None,
            clock: system_clock(),
        }
    }

    /// Route `rate()` aggregates through a metrics backend when the rule
    /// carries a selector.
    pub fn with_provider(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    pub fn clock(&self) -> Clock {
        self.clock.clone()
    }

    pub fn compile(&self, spec: RuleSpec) -> Result<CompiledRule, RuleError> {
        let program = Program::compile(&spec.expr).map_err(|e| RuleError::Parse {
            rule_id: spec.rule_id.clone(),
            message: e.to_string(),
        })?;

        Ok(CompiledRule {
            id: spec.rule_id,
            name: spec.name,
            category: spec.category,
            severity: spec.severity,
            version: spec.version,
            description: spec.description,
            expr: spec.expr,
            canary: spec.canary,
            block_on_error: spec.block_on_error,
            on_match: spec.on_match,
            notify: spec.notify,
            docs_url: spec.docs_url,
            owners: spec.owners,
            program: Arc::new(program),
            bindings: EvalBindings {
                store: self.store.clone(),
                provider: self.provider.clone(),
                selector: spec.metrics_selector,
                clock: self.clock.clone(),
            },
        })
    }

    pub fn compile_file(&self, path: impl AsRef<Path>) -> Result<CompiledRule, RuleError> {
        let spec = load_rule_yaml(path)?;
        self.compile(spec)
    }
}

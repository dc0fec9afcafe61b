//! Lookup of compiled rules loaded from a rules directory.

use super::compile::{CompiledRule, Compiler};
use super::RuleError;
use std::collections::HashMap;
use std::path::Path;

#[derive(Default)]
pub struct RuleRegistry {
    by_id: HashMap<String, CompiledRule>,
}

impl RuleRegistry {
    /// Compile every `*.yaml` / `*.yml` document in `dir`.
    pub fn load_dir(compiler: &Compiler, dir: impl AsRef<Path>) -> Result<Self, RuleError> {
        let dir = dir.as_ref();
        let mut registry = RuleRegistry::default();

        let entries = std::fs::read_dir(dir).map_err(|source| RuleError::Load {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| RuleError::Load {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => {}
                _ => continue,
            }
            let rule = compiler.compile_file(&path)?;
            tracing::info!(rule_id = %rule.id, path = %path.display(), "loaded rule");
            registry.by_id.insert(rule.id.clone(), rule);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, rule: CompiledRule) {
        self.by_id.insert(rule.id.clone(), rule);
    }

    pub fn find(&self, id: &str) -> Option<&CompiledRule> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_id.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

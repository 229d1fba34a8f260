//! Physical-constraint checkers for domain-impossible actions.

use std::collections::BTreeSet;
use std::fmt;

use contracts::{ConstraintRule, HallucinationConfig, Trace};

use crate::error::ValidationResult;
use crate::registry::NamedRegistry;

pub trait HallucinationChecker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the trace's final action is impossible given its pre-decision state.
    fn is_hallucination(&self, trace: &Trace) -> bool;

    /// Actions the checker considers valid at all; empty when it has no opinion.
    fn vocabulary(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Flags nothing; the hallucination rate degrades to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChecker;

impl HallucinationChecker for NoopChecker {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_hallucination(&self, _trace: &Trace) -> bool {
        false
    }
}

/// Used whenever no checker is registered.
pub(crate) static NOOP_CHECKER: NoopChecker = NoopChecker;

/// Rule-driven checker: an action is impossible when one of its rules' state
/// condition holds, or when a vocabulary is declared and the action is outside it.
#[derive(Debug, Clone)]
pub struct ConstraintChecker {
    name: String,
    rules: Vec<ConstraintRule>,
    vocabulary: BTreeSet<String>,
}

impl ConstraintChecker {
    pub fn new(config: HallucinationConfig) -> Self {
        Self {
            name: config.name,
            rules: config.rules,
            vocabulary: config.vocabulary.into_iter().collect(),
        }
    }

    /// Description of the first violated rule, if any.
    pub fn violation<'a>(&'a self, trace: &Trace) -> Option<&'a str> {
        let action = trace.final_action.known()?;
        if !self.vocabulary.is_empty() && !self.vocabulary.contains(action) {
            return Some("action outside declared vocabulary");
        }
        self.rules
            .iter()
            .find(|rule| &rule.action == action && rule.condition.holds(&trace.state_before))
            .map(|rule| rule.description.as_deref().unwrap_or("constraint violated"))
    }
}

impl HallucinationChecker for ConstraintChecker {
    fn name(&self) -> &str {
        &self.name
    }

    /// `Unknown` actions cannot be judged and are never flagged.
    fn is_hallucination(&self, trace: &Trace) -> bool {
        self.violation(trace).is_some()
    }

    fn vocabulary(&self) -> Vec<String> {
        self.vocabulary.iter().cloned().collect()
    }
}

/// Hallucination checkers registered at configuration time and selected by name.
pub struct CheckerRegistry {
    inner: NamedRegistry<Box<dyn HallucinationChecker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self {
            inner: NamedRegistry::new("checker"),
        }
    }

    pub fn from_configs(configs: &[HallucinationConfig]) -> ValidationResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Box::new(ConstraintChecker::new(config.clone())))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, checker: Box<dyn HallucinationChecker>) -> ValidationResult<()> {
        let name = checker.name().to_string();
        self.inner.register(name, checker)
    }

    /// The named checker, else the first registered, else the no-op checker
    /// when nothing is registered and no name was asked for.
    pub fn resolve(&self, name: Option<&str>) -> ValidationResult<&dyn HallucinationChecker> {
        let checker: &dyn HallucinationChecker = match self.inner.resolve_optional(name)? {
            Some(checker) => checker.as_ref(),
            None => &NOOP_CHECKER,
        };
        Ok(checker)
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names().collect()
    }
}

impl Default for CheckerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CheckerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckerRegistry")
            .field("checkers", &self.names())
            .field("default", &self.inner.default_name())
            .finish()
    }
}

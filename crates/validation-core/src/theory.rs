//! Behavioral theory capabilities and their registry.
//!
//! The metric engine never reads rule tables directly. It asks a theory which
//! capabilities it exposes and goes through those: [`DiscreteCoherence`] for
//! coherent-action sets, [`ContinuousCoherence`] for tendency scores. A theory
//! may expose both.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use contracts::{
    ActionTendency, ConstructDimension, ConstructLevels, Extracted, RuleTableConfig,
    SensibilityRule, StateMap, TendencyConfig, TheoryConfig, TheoryRule, Trace,
};

use crate::error::{ValidationError, ValidationResult};
use crate::registry::NamedRegistry;

pub trait BehavioralTheory: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> &[ConstructDimension];

    fn agent_types(&self) -> &[String];

    /// Levels for this theory's dimensions, renormalized on its own scales.
    /// Dimensions the trace lacks are `Unknown`.
    fn extract_constructs(&self, trace: &Trace) -> ConstructLevels {
        self.dimensions()
            .iter()
            .map(|dimension| {
                let level = match trace.constructs.get(&dimension.name) {
                    Some(Extracted::Known(raw)) => dimension.scale.normalize(raw),
                    _ => Extracted::Unknown,
                };
                (dimension.name.clone(), level)
            })
            .collect()
    }

    fn discrete(&self) -> Option<&dyn DiscreteCoherence> {
        None
    }

    fn continuous(&self) -> Option<&dyn ContinuousCoherence> {
        None
    }
}

pub trait DiscreteCoherence {
    /// Coherent actions for a fully known level combination, or `None` when no
    /// explicit rule covers it.
    fn coherent_actions(&self, levels: &ConstructLevels, agent_type: &str)
        -> Option<BTreeSet<String>>;

    /// Fallback judgement for combinations outside the rule table.
    fn is_sensible_action(&self, levels: &ConstructLevels, action: &str, agent_type: &str) -> bool;

    fn get_coherent_actions(&self, levels: &ConstructLevels, agent_type: &str) -> BTreeSet<String> {
        self.coherent_actions(levels, agent_type).unwrap_or_default()
    }
}

pub trait ContinuousCoherence {
    /// Probability of each action given the pre-decision state.
    fn action_distribution(&self, state: &StateMap, agent_type: &str) -> BTreeMap<String, f64>;

    /// Coherence in [0, 1]: the action's probability relative to the modal one.
    fn coherence_score(&self, state: &StateMap, action: &str, agent_type: &str) -> f64 {
        let distribution = self.action_distribution(state, agent_type);
        let modal = distribution.values().copied().fold(0.0_f64, f64::max);
        if modal <= 0.0 {
            return 0.0;
        }
        distribution
            .get(action)
            .map(|p| (p / modal).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }
}

/// Runtime conformance check applied at registration.
pub fn check_conformance(theory: &dyn BehavioralTheory) -> ValidationResult<()> {
    let fail = |reason: &str| ValidationError::NonConformantTheory {
        name: theory.name().to_string(),
        reason: reason.to_string(),
    };
    if theory.name().trim().is_empty() {
        return Err(fail("name is empty"));
    }
    if theory.discrete().is_none() && theory.continuous().is_none() {
        return Err(fail("exposes neither discrete nor continuous coherence"));
    }
    if theory.discrete().is_some() && theory.dimensions().is_empty() {
        return Err(fail("discrete coherence needs at least one construct dimension"));
    }
    let mut seen = BTreeSet::new();
    for dimension in theory.dimensions() {
        if dimension.scale.is_empty() {
            return Err(fail(&format!("dimension {:?} has an empty scale", dimension.name)));
        }
        if !seen.insert(dimension.name.as_str()) {
            return Err(fail(&format!("dimension {:?} is declared twice", dimension.name)));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

fn agent_type_matches(rule_type: Option<&str>, agent_type: &str) -> bool {
    rule_type.map_or(true, |expected| expected == agent_type)
}

/// Every listed dimension must be known and carry one of the allowed labels.
fn levels_match(when: &BTreeMap<String, Vec<String>>, levels: &ConstructLevels) -> bool {
    when.iter().all(|(dimension, allowed)| {
        levels
            .get(dimension)
            .and_then(Extracted::known)
            .is_some_and(|label| allowed.iter().any(|candidate| candidate == label))
    })
}

#[derive(Debug, Clone)]
pub struct RuleTableTheory {
    name: String,
    dimensions: Vec<ConstructDimension>,
    agent_types: Vec<String>,
    rules: Vec<TheoryRule>,
    sensible: Vec<SensibilityRule>,
    tendencies: Option<TendencyModel>,
}

impl RuleTableTheory {
    pub fn new(config: RuleTableConfig) -> ValidationResult<Self> {
        for (index, rule) in config.rules.iter().enumerate() {
            validate_condition(&config.dimensions, &rule.when)
                .map_err(|reason| non_conformant(&config.name, format!("rule {index}: {reason}")))?;
        }
        for rule in &config.sensible {
            validate_condition(&config.dimensions, &rule.when).map_err(|reason| {
                non_conformant(&config.name, format!("sensible {:?}: {reason}", rule.action))
            })?;
        }
        let tendencies = if config.tendencies.is_empty() {
            None
        } else {
            Some(TendencyModel::new(
                &config.name,
                config.tendencies,
                config.temperature,
            )?)
        };
        Ok(Self {
            name: config.name,
            dimensions: config.dimensions,
            agent_types: config.agent_types,
            rules: config.rules,
            sensible: config.sensible,
            tendencies,
        })
    }
}

fn non_conformant(name: &str, reason: String) -> ValidationError {
    ValidationError::NonConformantTheory {
        name: name.to_string(),
        reason,
    }
}

fn validate_condition(
    dimensions: &[ConstructDimension],
    when: &BTreeMap<String, Vec<String>>,
) -> Result<(), String> {
    for (dimension, allowed) in when {
        let Some(declared) = dimensions.iter().find(|candidate| &candidate.name == dimension)
        else {
            return Err(format!("unknown dimension {dimension:?}"));
        };
        if let Some(label) = allowed
            .iter()
            .find(|label| declared.scale.rank(label).is_none())
        {
            return Err(format!("label {label:?} is not on the {dimension:?} scale"));
        }
    }
    Ok(())
}

impl BehavioralTheory for RuleTableTheory {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> &[ConstructDimension] {
        &self.dimensions
    }

    fn agent_types(&self) -> &[String] {
        &self.agent_types
    }

    fn discrete(&self) -> Option<&dyn DiscreteCoherence> {
        Some(self)
    }

    fn continuous(&self) -> Option<&dyn ContinuousCoherence> {
        self.tendencies
            .as_ref()
            .map(|model| model as &dyn ContinuousCoherence)
    }
}

impl DiscreteCoherence for RuleTableTheory {
    fn coherent_actions(
        &self,
        levels: &ConstructLevels,
        agent_type: &str,
    ) -> Option<BTreeSet<String>> {
        self.rules
            .iter()
            .find(|rule| {
                agent_type_matches(rule.agent_type.as_deref(), agent_type)
                    && levels_match(&rule.when, levels)
            })
            .map(|rule| rule.coherent.iter().cloned().collect())
    }

    fn is_sensible_action(&self, levels: &ConstructLevels, action: &str, agent_type: &str) -> bool {
        self.sensible.iter().any(|rule| {
            rule.action == action
                && agent_type_matches(rule.agent_type.as_deref(), agent_type)
                && levels_match(&rule.when, levels)
        })
    }
}

// ---------------------------------------------------------------------------
// Tendencies
// ---------------------------------------------------------------------------

/// Softmax over linear per-action utilities of numeric state.
#[derive(Debug, Clone)]
pub struct TendencyModel {
    actions: BTreeMap<String, ActionTendency>,
    temperature: f64,
}

impl TendencyModel {
    pub fn new(
        theory: &str,
        actions: BTreeMap<String, ActionTendency>,
        temperature: f64,
    ) -> ValidationResult<Self> {
        if actions.is_empty() {
            return Err(non_conformant(theory, "no action tendencies".to_string()));
        }
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(non_conformant(
                theory,
                format!("temperature must be positive, got {temperature}"),
            ));
        }
        Ok(Self {
            actions,
            temperature,
        })
    }

    fn utility(tendency: &ActionTendency, state: &StateMap, agent_type: &str) -> f64 {
        let shift = tendency
            .agent_type_bias
            .get(agent_type)
            .copied()
            .unwrap_or(0.0);
        let weighted: f64 = tendency
            .weights
            .iter()
            .map(|(key, weight)| {
                let value = state
                    .get(key)
                    .and_then(contracts::value_as_f64)
                    .unwrap_or(0.0);
                weight * value
            })
            .sum();
        tendency.bias + shift + weighted
    }
}

impl ContinuousCoherence for TendencyModel {
    fn action_distribution(&self, state: &StateMap, agent_type: &str) -> BTreeMap<String, f64> {
        let utilities: Vec<(&String, f64)> = self
            .actions
            .iter()
            .map(|(action, tendency)| {
                (action, Self::utility(tendency, state, agent_type) / self.temperature)
            })
            .filter(|(_, utility)| utility.is_finite())
            .collect();
        let peak = utilities
            .iter()
            .map(|(_, utility)| *utility)
            .fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<(&String, f64)> = utilities
            .into_iter()
            .map(|(action, utility)| (action, (utility - peak).exp()))
            .collect();
        let total: f64 = exps.iter().map(|(_, weight)| weight).sum();
        if total <= 0.0 || !total.is_finite() {
            return BTreeMap::new();
        }
        exps.into_iter()
            .map(|(action, weight)| (action.clone(), weight / total))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TendencyTheory {
    name: String,
    dimensions: Vec<ConstructDimension>,
    agent_types: Vec<String>,
    model: TendencyModel,
}

impl TendencyTheory {
    pub fn new(config: TendencyConfig) -> ValidationResult<Self> {
        let model = TendencyModel::new(&config.name, config.actions, config.temperature)?;
        Ok(Self {
            name: config.name,
            dimensions: config.dimensions,
            agent_types: config.agent_types,
            model,
        })
    }
}

impl BehavioralTheory for TendencyTheory {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> &[ConstructDimension] {
        &self.dimensions
    }

    fn agent_types(&self) -> &[String] {
        &self.agent_types
    }

    fn continuous(&self) -> Option<&dyn ContinuousCoherence> {
        Some(&self.model)
    }
}

pub fn build_theory(config: TheoryConfig) -> ValidationResult<Box<dyn BehavioralTheory>> {
    Ok(match config {
        TheoryConfig::RuleTable(table) => Box::new(RuleTableTheory::new(table)?),
        TheoryConfig::Tendency(tendency) => Box::new(TendencyTheory::new(tendency)?),
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct TheoryRegistry {
    inner: NamedRegistry<Box<dyn BehavioralTheory>>,
}

impl TheoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: NamedRegistry::new("theory"),
        }
    }

    /// Build every configured theory; `default` overrides first-registered.
    pub fn from_configs(configs: &[TheoryConfig], default: Option<&str>) -> ValidationResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(build_theory(config.clone())?)?;
        }
        if let Some(name) = default {
            registry.set_default(name)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, theory: Box<dyn BehavioralTheory>) -> ValidationResult<()> {
        check_conformance(theory.as_ref())?;
        let name = theory.name().to_string();
        self.inner.register(name, theory)
    }

    pub fn set_default(&mut self, name: &str) -> ValidationResult<()> {
        self.inner.set_default(name)
    }

    pub fn get(&self, name: &str) -> ValidationResult<&dyn BehavioralTheory> {
        self.inner.get(name).map(|theory| theory.as_ref())
    }

    pub fn default_theory(&self) -> ValidationResult<&dyn BehavioralTheory> {
        self.inner.default_entry().map(|theory| theory.as_ref())
    }

    pub fn resolve(&self, name: Option<&str>) -> ValidationResult<&dyn BehavioralTheory> {
        self.inner.resolve(name).map(|theory| theory.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names().collect()
    }

    /// Dimensions of every registered theory, ordered by theory name.
    pub fn dimensions(&self) -> impl Iterator<Item = &ConstructDimension> {
        self.inner
            .values()
            .flat_map(|theory| theory.dimensions().iter())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for TheoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TheoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TheoryRegistry")
            .field("theories", &self.names())
            .field("default", &self.inner.default_name())
            .finish()
    }
}

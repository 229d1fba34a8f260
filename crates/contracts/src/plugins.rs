//! Plugin configuration contracts.
//!
//! Rule tables, grounding thresholds, constraint rules, and benchmark ranges are
//! domain data owned by the caller. The engine only interprets their shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::KappaWeighting;
use crate::{value_as_f64, ConstructDimension, OrdinalScale, StateMap};

// ---------------------------------------------------------------------------
// Theories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TheoryConfig {
    RuleTable(RuleTableConfig),
    Tendency(TendencyConfig),
}

impl TheoryConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::RuleTable(config) => &config.name,
            Self::Tendency(config) => &config.name,
        }
    }
}

/// Discrete lookup theory: construct-level combinations to coherent action sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTableConfig {
    pub name: String,
    pub dimensions: Vec<ConstructDimension>,
    #[serde(default)]
    pub agent_types: Vec<String>,
    /// Evaluated in order; the first matching rule is authoritative.
    pub rules: Vec<TheoryRule>,
    /// Fallback for level combinations no rule covers.
    #[serde(default)]
    pub sensible: Vec<SensibilityRule>,
    /// Optional continuous tendencies; when present the theory exposes both capabilities.
    #[serde(default)]
    pub tendencies: BTreeMap<String, ActionTendency>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TheoryRule {
    /// `None` applies to every agent type.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// Allowed labels per dimension; dimensions not listed match anything.
    pub when: BTreeMap<String, Vec<String>>,
    pub coherent: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SensibilityRule {
    pub action: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub when: BTreeMap<String, Vec<String>>,
}

/// Continuous theory: tendencies over numeric state rather than discrete sets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TendencyConfig {
    pub name: String,
    /// Dimensions still extracted from traces for decomposition and grounding.
    #[serde(default)]
    pub dimensions: Vec<ConstructDimension>,
    #[serde(default)]
    pub agent_types: Vec<String>,
    pub actions: BTreeMap<String, ActionTendency>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

/// Linear utility for one action: `bias + sum(weight * state[key])`, optionally
/// shifted per agent type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionTendency {
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub agent_type_bias: BTreeMap<String, f64>,
}

fn default_temperature() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Grounding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundingConfig {
    pub name: String,
    pub constructs: Vec<ConstructCutpoints>,
    #[serde(default)]
    pub weighting: KappaWeighting,
}

/// Derives one construct level from objective state: a weighted score is
/// bucketed by ascending cut points onto the scale (`labels.len() - 1` cuts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstructCutpoints {
    pub construct: String,
    pub scale: OrdinalScale,
    pub inputs: Vec<WeightedTerm>,
    pub cutpoints: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedTerm {
    pub key: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Physical constraints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HallucinationConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ConstraintRule>,
    /// When non-empty, any final action outside it is flagged.
    #[serde(default)]
    pub vocabulary: Vec<String>,
}

/// `action` is impossible whenever `condition` holds on the pre-decision state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintRule {
    pub action: String,
    pub condition: StateCondition,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateCondition {
    pub key: String,
    #[serde(flatten)]
    pub term: StateTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateTerm {
    Truthy,
    Falsy,
    Equals { value: Value },
    AtLeast { value: f64 },
    AtMost { value: f64 },
}

impl StateCondition {
    pub fn new(key: impl Into<String>, term: StateTerm) -> Self {
        Self {
            key: key.into(),
            term,
        }
    }

    /// Missing keys never satisfy a condition.
    pub fn holds(&self, state: &StateMap) -> bool {
        let Some(value) = state.get(&self.key) else {
            return false;
        };
        match &self.term {
            StateTerm::Truthy => is_truthy(value),
            StateTerm::Falsy => !value.is_null() && !is_truthy(value),
            StateTerm::Equals { value: expected } => value == expected,
            StateTerm::AtLeast { value: bound } => {
                value_as_f64(value).is_some_and(|number| number >= *bound)
            }
            StateTerm::AtMost { value: bound } => {
                value_as_f64(value).is_some_and(|number| number <= *bound)
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkCategory {
    Aggregate,
    Conditional,
    Demographic,
    Temporal,
}

/// A named population statistic with its empirically plausible range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkSpec {
    pub name: String,
    pub low: f64,
    pub high: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub category: BenchmarkCategory,
    #[serde(default)]
    pub description: Option<String>,
}

impl BenchmarkSpec {
    pub fn new(
        name: impl Into<String>,
        low: f64,
        high: f64,
        weight: f64,
        category: BenchmarkCategory,
    ) -> Self {
        Self {
            name: name.into(),
            low,
            high,
            weight,
            category,
            description: None,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }

    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    pub fn half_width(&self) -> f64 {
        (self.high - self.low) / 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkConfig {
    #[serde(flatten)]
    pub spec: BenchmarkSpec,
    #[serde(flatten)]
    pub kind: BenchmarkKind,
}

/// Built-in parametric benchmark computations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BenchmarkKind {
    /// Share of decisions whose final action is one of `actions`.
    ActionShare { actions: Vec<String> },
    /// Same share restricted to traces where `condition` holds, or to traces
    /// flagged as triggered when no condition is given.
    ConditionalActionShare {
        actions: Vec<String>,
        #[serde(default)]
        condition: Option<StateCondition>,
    },
    /// Same share restricted to agents matching a profile filter.
    SubgroupActionShare {
        actions: Vec<String>,
        filter: SubgroupFilter,
    },
    /// Fraction of (filtered) agents that took one of `actions` at least once.
    CumulativeAdoption {
        actions: Vec<String>,
        #[serde(default)]
        filter: SubgroupFilter,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubgroupFilter {
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub marginalized: Option<bool>,
    #[serde(default)]
    pub zone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn benchmark_config_flattens_spec_and_kind() {
        let raw = json!({
            "name": "insurance_uptake",
            "low": 0.3,
            "high": 0.6,
            "weight": 1.0,
            "category": "aggregate",
            "kind": "action_share",
            "actions": ["buy_insurance"]
        });
        let parsed: BenchmarkConfig = serde_json::from_value(raw).expect("benchmark config");
        assert_eq!(parsed.spec.name, "insurance_uptake");
        assert!(parsed.spec.contains(0.45));
        assert!(!parsed.spec.contains(0.61));
        assert_eq!(
            parsed.kind,
            BenchmarkKind::ActionShare {
                actions: vec!["buy_insurance".to_string()]
            }
        );
    }

    #[test]
    fn state_conditions_evaluate_leniently() {
        let mut state = StateMap::new();
        state.insert("flooded".to_string(), json!(true));
        state.insert("depth".to_string(), json!("1.5"));
        state.insert("elevated".to_string(), json!(0));

        assert!(StateCondition::new("flooded", StateTerm::Truthy).holds(&state));
        assert!(StateCondition::new("elevated", StateTerm::Falsy).holds(&state));
        assert!(StateCondition::new("depth", StateTerm::AtLeast { value: 1.0 }).holds(&state));
        assert!(!StateCondition::new("depth", StateTerm::AtMost { value: 1.0 }).holds(&state));
        assert!(!StateCondition::new("missing", StateTerm::Falsy).holds(&state));
    }

    #[test]
    fn theory_config_is_tagged_by_kind() {
        let raw = json!({
            "kind": "rule_table",
            "name": "pmt",
            "dimensions": [{"name": "threat", "scale": {"labels": ["L", "H"]}}],
            "rules": [{"when": {"threat": ["H"]}, "coherent": ["act"]}]
        });
        let parsed: TheoryConfig = serde_json::from_value(raw).expect("theory config");
        assert_eq!(parsed.name(), "pmt");
        let TheoryConfig::RuleTable(table) = parsed else {
            panic!("expected rule table");
        };
        assert!(table.tendencies.is_empty());
        assert!((table.temperature - 1.0).abs() < f64::EPSILON);
    }
}

//! v1 cross-boundary contracts for the validation engine, its api facade, and the report archive.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod plugins;
pub mod probes;
pub mod report;
pub mod serde_seed;

pub use plugins::{
    ActionTendency, BenchmarkCategory, BenchmarkConfig, BenchmarkKind, BenchmarkSpec, ConstraintRule,
    ConstructCutpoints, GroundingConfig, HallucinationConfig, RuleTableConfig,
    SensibilityRule, StateCondition, StateTerm, SubgroupFilter, TendencyConfig, TheoryConfig,
    TheoryRule, WeightedTerm,
};
pub use probes::{DirectionalPair, ExpectedDirection, ProbeConfig, ProbeResponse};
pub use report::{
    BenchmarkOutcome, BootstrapInterval, CacrDecomposition, CellCoherence, CgrResult,
    ConstructAgreement, ConstructReliability, DirectionalResult, EntropyFlag, EntropyReport,
    IngestSummary, KappaWeighting, L1Metrics, L2Metrics, L3Metrics, NullModelResult, RunMetadata,
    SupplementaryStats, ValidationReport,
};

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Agent type used when neither the profile table nor the trace names one.
pub const UNSPECIFIED_AGENT_TYPE: &str = "unspecified";

/// Arbitrary domain state captured around a decision.
pub type StateMap = BTreeMap<String, Value>;

/// Result of pulling a field out of a loosely-structured record.
///
/// Failed extraction is always `Unknown`; it is never replaced by a
/// mid-scale or otherwise plausible value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Extracted<T> {
    Known(T),
    Unknown,
}

impl<T> Extracted<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

}

impl<T> From<Option<T>> for Extracted<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => Self::Known(inner),
            None => Self::Unknown,
        }
    }
}

impl<T: fmt::Display> fmt::Display for Extracted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

pub type ActionLabel = Extracted<String>;
pub type ConstructLevel = Extracted<String>;

/// Ordered construct-dimension name to level mapping.
pub type ConstructLevels = BTreeMap<String, ConstructLevel>;

/// Ordered label set for one construct dimension, lowest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OrdinalScale {
    pub labels: Vec<String>,
    /// Alternate spellings mapped onto a canonical label (e.g. `"high" -> "H"`).
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl OrdinalScale {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>, label: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), label.into());
        self
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Zero-based rank of a canonical label.
    pub fn rank(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|candidate| candidate == label)
    }

    pub fn label_at(&self, rank: usize) -> Option<&str> {
        self.labels.get(rank).map(String::as_str)
    }

    /// Map a raw label onto the canonical spelling. Matching is case-insensitive
    /// against both labels and aliases; anything else is `Unknown`.
    pub fn normalize(&self, raw: &str) -> ConstructLevel {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Extracted::Unknown;
        }
        if let Some(label) = self
            .labels
            .iter()
            .find(|label| label.eq_ignore_ascii_case(trimmed))
        {
            return Extracted::Known(label.clone());
        }
        self.aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
            .and_then(|(_, label)| self.rank(label).map(|_| label.clone()))
            .into()
    }
}

/// Named ordinal dimension a theory operates over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConstructDimension {
    pub name: String,
    pub scale: OrdinalScale,
}

impl ConstructDimension {
    pub fn new(name: impl Into<String>, scale: OrdinalScale) -> Self {
        Self {
            name: name.into(),
            scale,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
    Uncertain,
}

const REJECT_STEMS: [&str; 7] = ["reject", "denied", "deny", "block", "exhaust", "veto", "fail"];
const APPROVE_STEMS: [&str; 5] = ["approv", "accept", "execut", "allow", "success"];
const NEGATION_PREFIXES: [&str; 4] = ["dis", "non", "not", "un"];

impl DecisionOutcome {
    /// Tolerant mapping of outcome tags emitted by governance layers.
    ///
    /// Tags are split into alphanumeric tokens. A negated approval
    /// ("disapproved", "not_approved", "unsuccessful") counts as a rejection.
    pub fn from_tag(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|token| !token.is_empty())
            .collect();
        let starts_with_any =
            |token: &str, stems: &[&str]| stems.iter().any(|stem| token.starts_with(stem));

        if tokens.iter().any(|token| starts_with_any(token, &REJECT_STEMS)) {
            return Self::Rejected;
        }
        let negated_word = tokens
            .iter()
            .any(|token| matches!(*token, "no" | "not" | "non" | "never"));
        let mut approved = false;
        for token in &tokens {
            if starts_with_any(token, &APPROVE_STEMS) {
                approved = true;
            } else if NEGATION_PREFIXES.iter().any(|prefix| {
                token
                    .strip_prefix(prefix)
                    .is_some_and(|rest| starts_with_any(rest, &APPROVE_STEMS))
            }) {
                return Self::Rejected;
            }
        }
        match (approved, negated_word) {
            (true, true) => Self::Rejected,
            (true, false) => Self::Approved,
            (false, _) => Self::Uncertain,
        }
    }
}

/// One agent decision. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub agent_id: String,
    pub step: u64,
    pub proposed_action: ActionLabel,
    pub final_action: ActionLabel,
    pub constructs: ConstructLevels,
    pub outcome: DecisionOutcome,
    #[serde(default)]
    pub state_before: StateMap,
    #[serde(default)]
    pub state_after: Option<StateMap>,
    /// "Triggered this period" flag used by conditional benchmarks.
    #[serde(default)]
    pub triggered: Option<bool>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Lenient numeric coercion shared by theories, groundings, and benchmarks.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Static per-agent attributes joined onto traces for population statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_id: String,
    pub agent_type: String,
    pub marginalized: bool,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub covariates: BTreeMap<String, f64>,
}

/// Candidate field paths and normalization tables used while ingesting traces.
///
/// Paths are dot-separated; numeric segments index into arrays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub agent_id_paths: Vec<String>,
    pub step_paths: Vec<String>,
    pub proposed_action_paths: Vec<String>,
    pub final_action_paths: Vec<String>,
    pub outcome_paths: Vec<String>,
    pub state_before_paths: Vec<String>,
    pub state_after_paths: Vec<String>,
    pub triggered_paths: Vec<String>,
    pub agent_type_paths: Vec<String>,
    pub reasoning_paths: Vec<String>,
    /// Candidate paths per construct dimension.
    pub construct_paths: BTreeMap<String, Vec<String>>,
    /// Ordinal scale per construct dimension, used to normalize raw labels.
    pub construct_scales: BTreeMap<String, OrdinalScale>,
    /// Free-text patterns per construct; the first capture group is the label.
    pub text_patterns: BTreeMap<String, Vec<String>>,
    /// Surface-form action names mapped to canonical names.
    pub action_aliases: BTreeMap<String, String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        fn paths(values: &[&str]) -> Vec<String> {
            values.iter().map(|value| value.to_string()).collect()
        }

        Self {
            agent_id_paths: paths(&["agent_id", "agent.id"]),
            step_paths: paths(&["step", "year", "tick"]),
            proposed_action_paths: paths(&["proposed_action", "proposal.action"]),
            final_action_paths: paths(&["approved_action", "final_action", "decision.action"]),
            outcome_paths: paths(&["outcome", "status", "validation.outcome"]),
            state_before_paths: paths(&["state_before", "state"]),
            state_after_paths: paths(&["state_after"]),
            triggered_paths: paths(&["triggered", "state_before.triggered"]),
            agent_type_paths: paths(&["agent_type", "agent.type"]),
            reasoning_paths: paths(&["reasoning", "proposal.reasoning"]),
            construct_paths: BTreeMap::new(),
            construct_scales: BTreeMap::new(),
            text_patterns: BTreeMap::new(),
            action_aliases: BTreeMap::new(),
        }
    }
}

/// CSV column names for the agent profile table. Any other numeric column is
/// kept as a covariate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileColumns {
    pub agent_id: String,
    pub agent_type: String,
    pub marginalized: String,
    pub zone: String,
}

impl Default for ProfileColumns {
    fn default() -> Self {
        Self {
            agent_id: "agent_id".to_string(),
            agent_type: "agent_type".to_string(),
            marginalized: "marginalized".to_string(),
            zone: "zone".to_string(),
        }
    }
}

/// Resampling unit for bootstrap intervals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResampleUnit {
    Trace,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapSettings {
    pub replicates: usize,
    pub confidence: f64,
    pub unit: ResampleUnit,
    /// Values above 1 run replicates on a worker pool; results are identical.
    pub worker_threads: usize,
    /// Metrics to interval-estimate in the assembled report.
    pub metrics: Vec<String>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            replicates: 1_000,
            confidence: 0.95,
            unit: ResampleUnit::Agent,
            worker_threads: 1,
            metrics: vec!["cacr".to_string(), "epi".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NullModelSettings {
    pub trials: usize,
    /// Name of a registered null policy.
    pub policy: String,
    /// Pool for `uniform_random`; the declared action space when empty.
    pub action_pool: Vec<String>,
    pub enabled: bool,
}

impl Default for NullModelSettings {
    fn default() -> Self {
        Self {
            trials: 1_000,
            policy: "uniform_random".to_string(),
            action_pool: Vec::new(),
            enabled: true,
        }
    }
}

/// Healthy band for normalized behavioral entropy, exclusive on both ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EntropyPolicy {
    pub low_threshold: f64,
    pub high_threshold: f64,
    /// Declared action alphabet; observed actions are always added to it.
    pub action_space: Vec<String>,
}

impl Default for EntropyPolicy {
    fn default() -> Self {
        Self {
            low_threshold: 0.1,
            high_threshold: 0.95,
            action_space: Vec::new(),
        }
    }
}

/// Complete per-run configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub run_id: String,
    #[serde(with = "serde_seed", default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub profiles: ProfileColumns,
    #[serde(default)]
    pub theories: Vec<TheoryConfig>,
    #[serde(default)]
    pub default_theory: Option<String>,
    /// Theory used for this run; the registry default when absent.
    #[serde(default)]
    pub theory: Option<String>,
    #[serde(default)]
    pub groundings: Vec<GroundingConfig>,
    /// Grounding strategy used for this run; the first registered when absent.
    #[serde(default)]
    pub grounding: Option<String>,
    #[serde(default)]
    pub checkers: Vec<HallucinationConfig>,
    /// Hallucination checker used for this run; the first registered when absent.
    #[serde(default)]
    pub checker: Option<String>,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkConfig>,
    /// Open keyword context handed to every benchmark function.
    #[serde(default)]
    pub benchmark_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub null_model: NullModelSettings,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
    #[serde(default)]
    pub entropy: EntropyPolicy,
    #[serde(default = "default_epi_threshold")]
    pub epi_threshold: f64,
    #[serde(default)]
    pub probes: ProbeConfig,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION_V1.to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_epi_threshold() -> f64 {
    0.6
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            run_id: "run_local_001".to_string(),
            seed: default_seed(),
            ingest: IngestConfig::default(),
            profiles: ProfileColumns::default(),
            theories: Vec::new(),
            default_theory: None,
            theory: None,
            groundings: Vec::new(),
            grounding: None,
            checkers: Vec::new(),
            checker: None,
            benchmarks: Vec::new(),
            benchmark_params: BTreeMap::new(),
            null_model: NullModelSettings::default(),
            bootstrap: BootstrapSettings::default(),
            entropy: EntropyPolicy::default(),
            epi_threshold: default_epi_threshold(),
            probes: ProbeConfig::default(),
            notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_normalizes_case_and_aliases() {
        let scale = OrdinalScale::new(["VL", "L", "M", "H", "VH"]).with_alias("high", "H");
        assert_eq!(scale.normalize("vh"), Extracted::Known("VH".to_string()));
        assert_eq!(scale.normalize(" HIGH "), Extracted::Known("H".to_string()));
        assert_eq!(scale.normalize("medium-ish"), Extracted::Unknown);
        assert_eq!(scale.normalize(""), Extracted::Unknown);
        assert_eq!(scale.rank("H"), Some(3));
    }

    #[test]
    fn alias_to_missing_label_stays_unknown() {
        let scale = OrdinalScale::new(["L", "H"]).with_alias("mid", "M");
        assert_eq!(scale.normalize("mid"), Extracted::Unknown);
    }

    #[test]
    fn outcome_tags_are_tolerant() {
        assert_eq!(DecisionOutcome::from_tag("APPROVED"), DecisionOutcome::Approved);
        assert_eq!(
            DecisionOutcome::from_tag("retry_exhausted"),
            DecisionOutcome::Rejected
        );
        assert_eq!(DecisionOutcome::from_tag("pending"), DecisionOutcome::Uncertain);
        assert_eq!(DecisionOutcome::from_tag("Accepted"), DecisionOutcome::Approved);
        assert_eq!(DecisionOutcome::from_tag("executed"), DecisionOutcome::Approved);
    }

    #[test]
    fn negated_approval_tags_are_rejections() {
        for tag in [
            "disapproved",
            "not_approved",
            "Not Approved",
            "unapproved",
            "unsuccessful",
            "non-executed",
            "no success",
        ] {
            assert_eq!(DecisionOutcome::from_tag(tag), DecisionOutcome::Rejected, "{tag}");
        }
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let parsed: ValidationConfig =
            serde_json::from_str(r#"{"run_id":"r1","seed":"7"}"#).expect("minimal config");
        assert_eq!(parsed.seed, 7);
        assert_eq!(parsed.bootstrap.replicates, 1_000);
        assert_eq!(parsed.null_model.trials, 1_000);
        assert_eq!(parsed.null_model.policy, "uniform_random");
        assert!(parsed.groundings.is_empty() && parsed.checkers.is_empty());
        assert!(parsed.ingest.agent_id_paths.contains(&"agent_id".to_string()));
        assert!((parsed.epi_threshold - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn extracted_serializes_unknown_explicitly() {
        let level: ConstructLevel = Extracted::Unknown;
        assert_eq!(serde_json::to_string(&level).expect("serialize"), "\"unknown\"");
        let known: ConstructLevel = Extracted::Known("H".to_string());
        assert_eq!(
            serde_json::to_string(&known).expect("serialize"),
            r#"{"known":"H"}"#
        );
    }
}

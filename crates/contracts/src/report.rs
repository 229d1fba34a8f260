//! Output records. Every record is flat data produced once per run and never mutated afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{BenchmarkCategory, ExpectedDirection, ResampleUnit, SCHEMA_VERSION_V1};

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub lines_read: usize,
    pub records_parsed: usize,
    pub malformed_records: usize,
    /// Traces whose level could not be extracted, per construct.
    pub construct_failures: BTreeMap<String, usize>,
    pub proposed_action_failures: usize,
    pub final_action_failures: usize,
    /// Construct levels recovered from free text after every field path failed.
    pub text_recoveries: usize,
    pub alias_hits: usize,
}

impl IngestSummary {
    pub fn total_construct_failures(&self) -> usize {
        self.construct_failures.values().sum()
    }

    pub fn merge(&mut self, other: &IngestSummary) {
        self.lines_read += other.lines_read;
        self.records_parsed += other.records_parsed;
        self.malformed_records += other.malformed_records;
        for (construct, count) in &other.construct_failures {
            *self.construct_failures.entry(construct.clone()).or_insert(0) += count;
        }
        self.proposed_action_failures += other.proposed_action_failures;
        self.final_action_failures += other.final_action_failures;
        self.text_recoveries += other.text_recoveries;
        self.alias_hits += other.alias_hits;
    }
}

// ---------------------------------------------------------------------------
// L1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellCoherence {
    /// Construct-level cell key, e.g. `coping=H|threat=L`.
    pub cell: String,
    pub n_raw: usize,
    pub n_final: usize,
    pub cacr_raw: Option<f64>,
    pub cacr_final: Option<f64>,
    pub gap: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacrDecomposition {
    pub cacr_raw: Option<f64>,
    pub cacr_final: Option<f64>,
    /// `cacr_final - cacr_raw`; how much external correction moved coherence.
    pub gap: Option<f64>,
    pub n_raw: usize,
    pub n_final: usize,
    pub cells: Vec<CellCoherence>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntropyFlag {
    Healthy,
    /// Monoculture, or an alphabet too small to carry entropy.
    DegenerateLow,
    /// Indistinguishable from uniform random choice.
    DegenerateHigh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntropyReport {
    pub entropy_bits: f64,
    pub max_entropy_bits: f64,
    pub normalized: Option<f64>,
    pub alphabet_size: usize,
    pub flag: EntropyFlag,
    pub action_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct L1Metrics {
    pub theory: String,
    /// Headline coherence, equal to `decomposition.cacr_final`. `None` when no
    /// trace had fully extracted constructs.
    pub cacr: Option<f64>,
    pub decomposition: CacrDecomposition,
    /// Mean continuous coherence when the theory exposes that capability.
    pub continuous_coherence: Option<f64>,
    pub n_continuous: usize,
    pub hallucination_rate: f64,
    pub n_hallucinated: usize,
    pub entropy: EntropyReport,
    pub n_traces: usize,
    pub n_unknown_constructs: usize,
    pub n_unknown_actions: usize,
    /// Final-action decisions judged through the sensibility fallback.
    pub n_fallback: usize,
}

// ---------------------------------------------------------------------------
// Construct grounding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum KappaWeighting {
    Linear,
    #[default]
    Quadratic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstructAgreement {
    pub construct: String,
    pub labels: Vec<String>,
    pub n_compared: usize,
    pub n_unknown: usize,
    pub exact_match_rate: Option<f64>,
    /// Within one ordinal step, exact matches included.
    pub adjacent_match_rate: Option<f64>,
    pub weighted_kappa: Option<f64>,
    pub kappa: Option<f64>,
    /// Expected disagreement was zero; the coefficient is undefined, not 1.
    pub trivial_agreement: bool,
    /// Rows are self-reported levels, columns grounded levels.
    pub confusion: Vec<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CgrResult {
    pub strategy: String,
    pub weighting: KappaWeighting,
    pub exact_match_rate: Option<f64>,
    pub adjacent_match_rate: Option<f64>,
    pub n_compared: usize,
    pub n_unknown: usize,
    pub constructs: Vec<ConstructAgreement>,
}

// ---------------------------------------------------------------------------
// L2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkOutcome {
    pub name: String,
    pub category: BenchmarkCategory,
    pub low: f64,
    pub high: f64,
    pub weight: f64,
    pub value: Option<f64>,
    pub within_range: Option<bool>,
    /// `|value - midpoint| / half_width`; at most 1 inside the range.
    pub midpoint_distance: Option<f64>,
}

/// Statistics reported next to EPI but never folded into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SupplementaryStats {
    pub rejection_rate: Option<f64>,
    pub rejection_rate_by_agent_type: BTreeMap<String, f64>,
    pub rejection_rate_marginalized: Option<f64>,
    pub rejection_rate_non_marginalized: Option<f64>,
    /// Marginalized minus non-marginalized rejection rate.
    pub rejection_gap: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct L2Metrics {
    pub epi: Option<f64>,
    pub epi_threshold: f64,
    pub passes: Option<bool>,
    pub passed_weight: f64,
    pub computed_weight: f64,
    pub n_computed: usize,
    pub n_excluded: usize,
    pub mean_midpoint_distance: Option<f64>,
    pub benchmarks: Vec<BenchmarkOutcome>,
    pub supplementary: SupplementaryStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NullModelResult {
    pub policy: String,
    pub trials: usize,
    /// Trials whose synthetic EPI was computable.
    pub valid_trials: usize,
    pub observed_epi: Option<f64>,
    pub p_value: Option<f64>,
    pub null_mean: Option<f64>,
    pub null_std: Option<f64>,
    pub null_p95: Option<f64>,
    #[serde(with = "crate::serde_seed")]
    pub seed: u64,
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BootstrapInterval {
    pub metric: String,
    pub point_estimate: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub confidence: f64,
    pub replicates: usize,
    pub valid_replicates: usize,
    pub unit: ResampleUnit,
    #[serde(with = "crate::serde_seed")]
    pub seed: u64,
}

// ---------------------------------------------------------------------------
// L3
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstructReliability {
    pub construct: String,
    pub n_personas: usize,
    pub n_responses: usize,
    pub n_unknown: usize,
    pub icc: Option<f64>,
    pub eta_squared: Option<f64>,
    /// Zero total variance or too few personas/replicates for the statistics.
    pub degenerate: bool,
    pub icc_passes: Option<bool>,
    pub eta_passes: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectionalResult {
    pub baseline: String,
    pub varied: String,
    pub varied_dimension: String,
    pub construct: String,
    pub expected: ExpectedDirection,
    pub n_pairs: usize,
    pub n_in_direction: usize,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct L3Metrics {
    pub n_personas: usize,
    pub n_responses: usize,
    pub constructs: Vec<ConstructReliability>,
    pub directional: Vec<DirectionalResult>,
    pub directional_rate: Option<f64>,
    pub directional_passes: Option<bool>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    pub run_id: String,
    #[serde(with = "crate::serde_seed")]
    pub seed: u64,
    pub theory: Option<String>,
    pub grounding: Option<String>,
    pub checker: Option<String>,
    pub null_policy: Option<String>,
    pub n_traces: usize,
    pub n_agents: usize,
    pub n_profiles: usize,
    pub n_traces_without_profile: usize,
    pub ingest: IngestSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub schema_version: String,
    pub metadata: RunMetadata,
    pub l1: Option<L1Metrics>,
    pub cgr: Option<CgrResult>,
    pub l2: Option<L2Metrics>,
    pub null_model: Option<NullModelResult>,
    pub l3: Option<L3Metrics>,
    pub bootstrap: Vec<BootstrapInterval>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn empty(metadata: RunMetadata) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            metadata,
            l1: None,
            cgr: None,
            l2: None,
            null_model: None,
            l3: None,
            bootstrap: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn interval(&self, metric: &str) -> Option<&BootstrapInterval> {
        self.bootstrap.iter().find(|interval| interval.metric == metric)
    }
}

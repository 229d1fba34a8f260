//! L1 micro-metrics: construct-action coherence, hallucination rate, and
//! behavioral entropy.
//!
//! Traces whose constructs could not be extracted are excluded from the
//! coherence denominators; they are counted, never scored.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{
    CacrDecomposition, CellCoherence, ConstructLevels, EntropyFlag, EntropyPolicy, EntropyReport,
    Extracted, L1Metrics, Trace,
};
use tracing::{debug, info, warn};

use crate::error::{ValidationError, ValidationResult};
use crate::hallucination::HallucinationChecker;
use crate::ingest::ProfileTable;
use crate::stats::{mean, ratio, shannon_entropy_bits};
use crate::theory::{BehavioralTheory, DiscreteCoherence};

/// Outcome of judging one action against a level combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Judgement {
    pub coherent: bool,
    /// No explicit rule covered the combination; the sensibility fallback decided.
    pub fallback: bool,
}

pub fn judge_action(
    theory: &dyn DiscreteCoherence,
    levels: &ConstructLevels,
    action: &str,
    agent_type: &str,
) -> Judgement {
    match theory.coherent_actions(levels, agent_type) {
        Some(coherent) => Judgement {
            coherent: coherent.contains(action),
            fallback: false,
        },
        None => Judgement {
            coherent: theory.is_sensible_action(levels, action, agent_type),
            fallback: true,
        },
    }
}

/// Fully extracted levels for the theory's dimensions, or `None`.
fn known_levels(theory: &dyn BehavioralTheory, trace: &Trace) -> Option<ConstructLevels> {
    let levels = theory.extract_constructs(trace);
    if levels.is_empty() || levels.values().any(Extracted::is_unknown) {
        None
    } else {
        Some(levels)
    }
}

fn cell_key(levels: &ConstructLevels) -> String {
    levels
        .iter()
        .map(|(dimension, level)| format!("{dimension}={level}"))
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    raw: usize,
    raw_coherent: usize,
    final_: usize,
    final_coherent: usize,
}

impl Tally {
    fn cacr_raw(&self) -> Option<f64> {
        ratio(self.raw_coherent, self.raw)
    }

    fn cacr_final(&self) -> Option<f64> {
        ratio(self.final_coherent, self.final_)
    }

    fn gap(&self) -> Option<f64> {
        Some(self.cacr_final()? - self.cacr_raw()?)
    }
}

/// Counts collected alongside the decomposition.
#[derive(Debug, Clone, Default)]
pub struct CoherenceCounts {
    pub unknown_constructs: usize,
    pub fallback: usize,
}

/// CACR against proposed and final actions, stratified by construct cell.
/// Empty when the theory has no discrete capability.
pub fn cacr_decomposition(
    traces: &[Trace],
    profiles: &ProfileTable,
    theory: &dyn BehavioralTheory,
) -> (CacrDecomposition, CoherenceCounts) {
    let mut counts = CoherenceCounts::default();
    let Some(discrete) = theory.discrete() else {
        return (CacrDecomposition::default(), counts);
    };

    let mut overall = Tally::default();
    let mut cells: BTreeMap<String, Tally> = BTreeMap::new();
    for trace in traces {
        let Some(levels) = known_levels(theory, trace) else {
            counts.unknown_constructs += 1;
            continue;
        };
        let agent_type = profiles.agent_type_of(trace);
        let cell = cells.entry(cell_key(&levels)).or_default();

        if let Some(action) = trace.proposed_action.known() {
            let judgement = judge_action(discrete, &levels, action, agent_type);
            overall.raw += 1;
            cell.raw += 1;
            if judgement.coherent {
                overall.raw_coherent += 1;
                cell.raw_coherent += 1;
            }
        }
        if let Some(action) = trace.final_action.known() {
            let judgement = judge_action(discrete, &levels, action, agent_type);
            overall.final_ += 1;
            cell.final_ += 1;
            if judgement.fallback {
                counts.fallback += 1;
            }
            if judgement.coherent {
                overall.final_coherent += 1;
                cell.final_coherent += 1;
            }
        }
    }

    let decomposition = CacrDecomposition {
        cacr_raw: overall.cacr_raw(),
        cacr_final: overall.cacr_final(),
        gap: overall.gap(),
        n_raw: overall.raw,
        n_final: overall.final_,
        cells: cells
            .into_iter()
            .map(|(cell, tally)| CellCoherence {
                cell,
                n_raw: tally.raw,
                n_final: tally.final_,
                cacr_raw: tally.cacr_raw(),
                cacr_final: tally.cacr_final(),
                gap: tally.gap(),
            })
            .collect(),
    };
    (decomposition, counts)
}

/// Headline CACR (final actions). Used directly as a bootstrap metric.
pub fn cacr(traces: &[Trace], profiles: &ProfileTable, theory: &dyn BehavioralTheory) -> Option<f64> {
    cacr_decomposition(traces, profiles, theory).0.cacr_final
}

/// Mean continuous coherence over traces with a known final action.
pub fn continuous_coherence(
    traces: &[Trace],
    profiles: &ProfileTable,
    theory: &dyn BehavioralTheory,
) -> (Option<f64>, usize) {
    let Some(continuous) = theory.continuous() else {
        return (None, 0);
    };
    let scores: Vec<f64> = traces
        .iter()
        .filter_map(|trace| {
            let action = trace.final_action.known()?;
            Some(continuous.coherence_score(&trace.state_before, action, profiles.agent_type_of(trace)))
        })
        .collect();
    (mean(&scores), scores.len())
}

/// Flagged traces over all traces; zero for an empty slice.
pub fn hallucination_rate(traces: &[Trace], checker: &dyn HallucinationChecker) -> (f64, usize) {
    let flagged = traces
        .iter()
        .filter(|trace| checker.is_hallucination(trace))
        .count();
    (ratio(flagged, traces.len()).unwrap_or(0.0), flagged)
}

pub fn validate_entropy_policy(policy: &EntropyPolicy) -> ValidationResult<()> {
    let ordered = 0.0 <= policy.low_threshold
        && policy.low_threshold < policy.high_threshold
        && policy.high_threshold <= 1.0;
    if ordered {
        Ok(())
    } else {
        Err(ValidationError::InvalidSettings(format!(
            "entropy thresholds must satisfy 0 <= low < high <= 1, got ({}, {})",
            policy.low_threshold, policy.high_threshold
        )))
    }
}

/// Entropy of the pooled final-action distribution. The alphabet is the
/// declared action space (or `fallback_vocabulary` when none is declared)
/// plus every observed action.
pub fn behavioral_entropy(
    traces: &[Trace],
    policy: &EntropyPolicy,
    fallback_vocabulary: &[String],
) -> EntropyReport {
    let declared = if policy.action_space.is_empty() {
        fallback_vocabulary
    } else {
        policy.action_space.as_slice()
    };
    let mut action_counts: BTreeMap<String, usize> =
        declared.iter().map(|action| (action.clone(), 0)).collect();
    for action in traces.iter().filter_map(|trace| trace.final_action.known()) {
        *action_counts.entry(action.clone()).or_insert(0) += 1;
    }

    let alphabet_size = action_counts.len();
    let entropy_bits = shannon_entropy_bits(action_counts.values().copied());
    let max_entropy_bits = if alphabet_size > 1 {
        (alphabet_size as f64).log2()
    } else {
        0.0
    };
    let normalized =
        (alphabet_size > 1).then(|| (entropy_bits / max_entropy_bits).clamp(0.0, 1.0));
    let flag = match normalized {
        None => EntropyFlag::DegenerateLow,
        Some(value) if value <= policy.low_threshold => EntropyFlag::DegenerateLow,
        Some(value) if value >= policy.high_threshold => EntropyFlag::DegenerateHigh,
        Some(_) => EntropyFlag::Healthy,
    };
    EntropyReport {
        entropy_bits,
        max_entropy_bits,
        normalized,
        alphabet_size,
        flag,
        action_counts,
    }
}

/// All L1 metrics for one trace collection.
pub fn compute_l1(
    traces: &[Trace],
    profiles: &ProfileTable,
    theory: &dyn BehavioralTheory,
    checker: &dyn HallucinationChecker,
    entropy_policy: &EntropyPolicy,
) -> ValidationResult<L1Metrics> {
    validate_entropy_policy(entropy_policy)?;

    let (decomposition, counts) = cacr_decomposition(traces, profiles, theory);
    let (continuous, n_continuous) = continuous_coherence(traces, profiles, theory);
    let (hallucination_rate, n_hallucinated) = hallucination_rate(traces, checker);
    let entropy = behavioral_entropy(traces, entropy_policy, &checker.vocabulary());
    let n_unknown_actions = traces
        .iter()
        .filter(|trace| trace.final_action.is_unknown())
        .count();

    if theory.discrete().is_some() && decomposition.cacr_final.is_none() {
        warn!(
            theory = theory.name(),
            unknown_constructs = counts.unknown_constructs,
            traces = traces.len(),
            "CACR undefined: no trace had fully extracted constructs and a known action"
        );
    } else if counts.unknown_constructs > 0 {
        warn!(
            unknown_constructs = counts.unknown_constructs,
            "traces excluded from coherence for unknown constructs"
        );
    }
    if entropy.flag != EntropyFlag::Healthy {
        warn!(flag = ?entropy.flag, normalized = ?entropy.normalized, "behavioral entropy degenerate");
    }
    debug!(cells = decomposition.cells.len(), fallback = counts.fallback, "coherence cells");

    let observed: BTreeSet<&str> = traces
        .iter()
        .filter_map(|trace| trace.final_action.known().map(String::as_str))
        .collect();
    info!(
        theory = theory.name(),
        cacr = ?decomposition.cacr_final,
        gap = ?decomposition.gap,
        hallucination_rate,
        actions = observed.len(),
        "L1 metrics computed"
    );

    Ok(L1Metrics {
        theory: theory.name().to_string(),
        cacr: decomposition.cacr_final,
        decomposition,
        continuous_coherence: continuous,
        n_continuous,
        hallucination_rate,
        n_hallucinated,
        entropy,
        n_traces: traces.len(),
        n_unknown_constructs: counts.unknown_constructs,
        n_unknown_actions,
        n_fallback: counts.fallback,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hallucination::NoopChecker;
    use crate::theory::RuleTableTheory;
    use contracts::{
        ActionTendency, ConstructDimension, DecisionOutcome, OrdinalScale, RuleTableConfig,
        SensibilityRule, StateMap, TheoryRule,
    };

    fn theory(with_tendencies: bool) -> RuleTableTheory {
        let tendencies = if with_tendencies {
            BTreeMap::from([
                ("act".to_string(), ActionTendency { bias: 1.0, ..Default::default() }),
                ("wait".to_string(), ActionTendency::default()),
            ])
        } else {
            BTreeMap::new()
        };
        RuleTableTheory::new(RuleTableConfig {
            name: "binary".to_string(),
            dimensions: vec![ConstructDimension::new("threat", OrdinalScale::new(["L", "H"]))],
            agent_types: Vec::new(),
            rules: vec![TheoryRule {
                agent_type: None,
                when: BTreeMap::from([("threat".to_string(), vec!["H".to_string()])]),
                coherent: vec!["act".to_string()],
            }],
            sensible: vec![SensibilityRule {
                action: "wait".to_string(),
                agent_type: None,
                when: BTreeMap::new(),
            }],
            tendencies,
            temperature: 1.0,
        })
        .expect("theory")
    }

    fn trace(threat: Option<&str>, proposed: &str, final_action: Option<&str>) -> Trace {
        Trace {
            agent_id: "a".to_string(),
            step: 0,
            proposed_action: Extracted::Known(proposed.to_string()),
            final_action: final_action.map(str::to_string).into(),
            constructs: BTreeMap::from([(
                "threat".to_string(),
                threat.map(str::to_string).into(),
            )]),
            outcome: DecisionOutcome::Approved,
            state_before: StateMap::new(),
            state_after: None,
            triggered: None,
            agent_type: None,
            reasoning: None,
        }
    }

    #[test]
    fn decomposition_reports_gap_and_cells() {
        let traces = vec![
            trace(Some("H"), "wait", Some("act")),
            trace(Some("H"), "act", Some("act")),
            trace(Some("L"), "act", Some("wait")),
            trace(None, "act", Some("act")),
        ];
        let (decomposition, counts) =
            cacr_decomposition(&traces, &ProfileTable::new(), &theory(false));
        assert_eq!(decomposition.n_raw, 3);
        // raw: H/wait no, H/act yes, L/act via fallback no
        assert!((decomposition.cacr_raw.expect("raw") - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(decomposition.cacr_final, Some(1.0));
        assert!((decomposition.gap.expect("gap") - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(decomposition.cells.len(), 2);
        assert_eq!(counts.unknown_constructs, 1);
        assert_eq!(counts.fallback, 1);
    }

    #[test]
    fn all_unknown_constructs_leave_cacr_undefined() {
        let traces = vec![trace(None, "act", Some("act")), trace(None, "wait", Some("wait"))];
        let metrics = compute_l1(
            &traces,
            &ProfileTable::new(),
            &theory(false),
            &NoopChecker,
            &EntropyPolicy::default(),
        )
        .expect("l1");
        assert_eq!(metrics.cacr, None);
        assert_eq!(metrics.n_unknown_constructs, 2);
        assert_eq!(metrics.hallucination_rate, 0.0);
    }

    #[test]
    fn unknown_final_action_leaves_the_final_denominator() {
        let traces = vec![trace(Some("H"), "act", None), trace(Some("H"), "act", Some("act"))];
        let (decomposition, _) = cacr_decomposition(&traces, &ProfileTable::new(), &theory(false));
        assert_eq!(decomposition.n_raw, 2);
        assert_eq!(decomposition.n_final, 1);
    }

    #[test]
    fn entropy_uses_declared_alphabet() {
        let traces: Vec<Trace> = (0..10).map(|_| trace(Some("H"), "a", Some("a"))).collect();
        let policy = EntropyPolicy {
            action_space: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ..EntropyPolicy::default()
        };
        let report = behavioral_entropy(&traces, &policy, &[]);
        assert_eq!(report.alphabet_size, 3);
        assert_eq!(report.normalized, Some(0.0));
        assert_eq!(report.flag, EntropyFlag::DegenerateLow);

        let observed_only = behavioral_entropy(&traces, &EntropyPolicy::default(), &[]);
        assert_eq!(observed_only.normalized, None);
        assert_eq!(observed_only.flag, EntropyFlag::DegenerateLow);
    }

    #[test]
    fn uniform_choice_is_degenerate_high() {
        let traces: Vec<Trace> = ["a", "b", "a", "b"]
            .iter()
            .map(|action| trace(Some("H"), action, Some(*action)))
            .collect();
        let report = behavioral_entropy(&traces, &EntropyPolicy::default(), &[]);
        assert_eq!(report.normalized, Some(1.0));
        assert_eq!(report.flag, EntropyFlag::DegenerateHigh);
    }

    #[test]
    fn both_capabilities_are_reported_together() {
        let traces = vec![trace(Some("H"), "act", Some("act")), trace(Some("L"), "wait", Some("wait"))];
        let metrics = compute_l1(
            &traces,
            &ProfileTable::new(),
            &theory(true),
            &NoopChecker,
            &EntropyPolicy::default(),
        )
        .expect("l1");
        assert_eq!(metrics.cacr, Some(1.0));
        assert_eq!(metrics.n_continuous, 2);
        let mean = metrics.continuous_coherence.expect("continuous");
        assert!((mean - (1.0 + (-1.0_f64).exp()) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_entropy_thresholds_are_rejected() {
        let policy = EntropyPolicy {
            low_threshold: 0.9,
            high_threshold: 0.2,
            action_space: Vec::new(),
        };
        assert!(matches!(
            validate_entropy_policy(&policy),
            Err(ValidationError::InvalidSettings(_))
        ));
    }
}

//! L2 macro-metrics: the empirical plausibility index and the supplementary
//! statistics reported next to it.

use std::collections::BTreeMap;

use contracts::{BenchmarkOutcome, BenchmarkSpec, DecisionOutcome, L2Metrics, SupplementaryStats, Trace};
use tracing::{debug, info, warn};

use crate::benchmark::{BenchmarkContext, BenchmarkRegistry};
use crate::error::{ValidationError, ValidationResult};
use crate::ingest::ProfileTable;
use crate::stats::{mean, ratio};

/// `|value - midpoint| / half_width`; a zero-width range gives 0 on the point
/// and `None` elsewhere.
pub fn midpoint_distance(spec: &BenchmarkSpec, value: f64) -> Option<f64> {
    let half_width = spec.half_width();
    let offset = (value - spec.midpoint()).abs();
    if half_width > 0.0 {
        Some(offset / half_width)
    } else if offset == 0.0 {
        Some(0.0)
    } else {
        None
    }
}

pub fn score_benchmark(spec: &BenchmarkSpec, value: Option<f64>) -> BenchmarkOutcome {
    BenchmarkOutcome {
        name: spec.name.clone(),
        category: spec.category,
        low: spec.low,
        high: spec.high,
        weight: spec.weight,
        value,
        within_range: value.map(|value| spec.contains(value)),
        midpoint_distance: value.and_then(|value| midpoint_distance(spec, value)),
    }
}

/// Weighted pass fraction over computed benchmarks, with the weights involved.
fn weighted_pass(outcomes: &[BenchmarkOutcome]) -> (Option<f64>, f64, f64) {
    let mut passed = 0.0;
    let mut computed = 0.0;
    for outcome in outcomes {
        if let Some(within) = outcome.within_range {
            computed += outcome.weight;
            if within {
                passed += outcome.weight;
            }
        }
    }
    let epi = (computed > 0.0).then(|| (passed / computed).clamp(0.0, 1.0));
    (epi, passed, computed)
}

/// EPI alone, as used by the null model and the bootstrap.
pub fn epi(registry: &BenchmarkRegistry, context: &BenchmarkContext<'_>) -> Option<f64> {
    let outcomes: Vec<BenchmarkOutcome> = registry
        .evaluate(context)
        .into_iter()
        .map(|(spec, value)| score_benchmark(spec, value))
        .collect();
    weighted_pass(&outcomes).0
}

pub fn supplementary_stats(traces: &[Trace], profiles: &ProfileTable) -> SupplementaryStats {
    #[derive(Default)]
    struct Rate {
        rejected: usize,
        total: usize,
    }
    impl Rate {
        fn add(&mut self, rejected: bool) {
            self.total += 1;
            if rejected {
                self.rejected += 1;
            }
        }
        fn value(&self) -> Option<f64> {
            ratio(self.rejected, self.total)
        }
    }

    let mut overall = Rate::default();
    let mut by_type: BTreeMap<String, Rate> = BTreeMap::new();
    let mut marginalized = Rate::default();
    let mut others = Rate::default();
    for trace in traces {
        let rejected = trace.outcome == DecisionOutcome::Rejected;
        overall.add(rejected);
        by_type
            .entry(profiles.agent_type_of(trace).to_string())
            .or_default()
            .add(rejected);
        match profiles.get(&trace.agent_id) {
            Some(profile) if profile.marginalized => marginalized.add(rejected),
            Some(_) => others.add(rejected),
            None => {}
        }
    }

    let rejection_rate_marginalized = marginalized.value();
    let rejection_rate_non_marginalized = others.value();
    SupplementaryStats {
        rejection_rate: overall.value(),
        rejection_rate_by_agent_type: by_type
            .into_iter()
            .filter_map(|(agent_type, rate)| rate.value().map(|value| (agent_type, value)))
            .collect(),
        rejection_rate_marginalized,
        rejection_rate_non_marginalized,
        rejection_gap: rejection_rate_marginalized
            .zip(rejection_rate_non_marginalized)
            .map(|(marginalized, others)| marginalized - others),
    }
}

pub fn compute_l2(
    registry: &BenchmarkRegistry,
    context: &BenchmarkContext<'_>,
    epi_threshold: f64,
) -> ValidationResult<L2Metrics> {
    if !(0.0..=1.0).contains(&epi_threshold) {
        return Err(ValidationError::InvalidSettings(format!(
            "epi threshold must lie in [0, 1], got {epi_threshold}"
        )));
    }

    let benchmarks: Vec<BenchmarkOutcome> = registry
        .evaluate(context)
        .into_iter()
        .map(|(spec, value)| {
            debug!(benchmark = %spec.name, value = ?value, "benchmark evaluated");
            score_benchmark(spec, value)
        })
        .collect();
    let excluded: Vec<&str> = benchmarks
        .iter()
        .filter(|outcome| outcome.value.is_none())
        .map(|outcome| outcome.name.as_str())
        .collect();
    if !excluded.is_empty() {
        warn!(benchmarks = ?excluded, "benchmarks not computable; excluded from EPI");
    }

    let (epi, passed_weight, computed_weight) = weighted_pass(&benchmarks);
    let distances: Vec<f64> = benchmarks
        .iter()
        .filter_map(|outcome| outcome.midpoint_distance)
        .collect();
    let n_excluded = excluded.len();
    let metrics = L2Metrics {
        epi,
        epi_threshold,
        passes: epi.map(|value| value >= epi_threshold),
        passed_weight,
        computed_weight,
        n_computed: benchmarks.len() - n_excluded,
        n_excluded,
        mean_midpoint_distance: mean(&distances),
        supplementary: supplementary_stats(context.traces, context.profiles),
        benchmarks,
    };
    info!(epi = ?metrics.epi, computed = metrics.n_computed, excluded = n_excluded, "L2 metrics computed");
    Ok(metrics)
}

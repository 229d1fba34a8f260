//! Percentile bootstrap for any metric over a trace collection.
//!
//! Replicate `r` always draws from the stream seeded by `(seed, r)`, so the
//! resampled indices and the interval are identical whether replicates run
//! sequentially or on a worker pool.

use std::collections::BTreeMap;

use contracts::{BootstrapInterval, BootstrapSettings, ResampleUnit, Trace};
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{ValidationError, ValidationResult};
use crate::rng::{stream_rng, worker_pool};
use crate::stats::{percentile, sort_finite};

pub fn validate_settings(settings: &BootstrapSettings) -> ValidationResult<()> {
    if settings.replicates == 0 {
        return Err(ValidationError::InvalidSettings(
            "bootstrap needs at least one replicate".to_string(),
        ));
    }
    if !(settings.confidence > 0.0 && settings.confidence < 1.0) {
        return Err(ValidationError::InvalidSettings(format!(
            "bootstrap confidence must lie in (0, 1), got {}",
            settings.confidence
        )));
    }
    Ok(())
}

/// Trace indices grouped by agent, in agent-id order.
fn clusters(traces: &[Trace]) -> Vec<Vec<usize>> {
    let mut by_agent: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, trace) in traces.iter().enumerate() {
        by_agent.entry(trace.agent_id.as_str()).or_default().push(index);
    }
    by_agent.into_values().collect()
}

fn draw(rng: &mut StdRng, clusters: &[Vec<usize>], unit: ResampleUnit, n: usize) -> Vec<usize> {
    match unit {
        ResampleUnit::Trace => (0..n).map(|_| rng.gen_range(0..n)).collect(),
        ResampleUnit::Agent => (0..clusters.len())
            .flat_map(|_| clusters[rng.gen_range(0..clusters.len())].iter().copied())
            .collect(),
    }
}

/// Indices of one replicate. Agent resampling carries every trace of a drawn
/// agent together.
pub fn resample_indices(traces: &[Trace], unit: ResampleUnit, seed: u64, replicate: u64) -> Vec<usize> {
    if traces.is_empty() {
        return Vec::new();
    }
    let clusters = clusters(traces);
    let mut rng = stream_rng(seed, replicate);
    draw(&mut rng, &clusters, unit, traces.len())
}

/// Bootstrap interval of `extract(metric(traces))`.
pub fn bootstrap_ci<T, M, E>(
    metric_name: &str,
    traces: &[Trace],
    metric: M,
    extract: E,
    settings: &BootstrapSettings,
    seed: u64,
) -> ValidationResult<BootstrapInterval>
where
    M: Fn(&[Trace]) -> T + Sync,
    E: Fn(&T) -> Option<f64> + Sync,
{
    validate_settings(settings)?;
    if traces.is_empty() {
        return Err(ValidationError::EmptyTraceCollection);
    }

    let point_estimate = extract(&metric(traces));
    let clusters = clusters(traces);
    let replicate = |index: usize| -> Option<f64> {
        let mut rng = stream_rng(seed, index as u64);
        let sample: Vec<Trace> = draw(&mut rng, &clusters, settings.unit, traces.len())
            .into_iter()
            .map(|position| traces[position].clone())
            .collect();
        extract(&metric(&sample)).filter(|value| value.is_finite())
    };
    let estimates: Vec<Option<f64>> = match worker_pool(settings.worker_threads) {
        Some(pool) => pool.install(|| (0..settings.replicates).into_par_iter().map(replicate).collect()),
        None => (0..settings.replicates).map(replicate).collect(),
    };

    let mut valid: Vec<f64> = estimates.into_iter().flatten().collect();
    sort_finite(&mut valid);
    if valid.len() < settings.replicates {
        warn!(
            metric = metric_name,
            replicates = settings.replicates,
            valid = valid.len(),
            "bootstrap replicates with an undefined metric were dropped"
        );
    }
    let tail = (1.0 - settings.confidence) / 2.0;
    let interval = BootstrapInterval {
        metric: metric_name.to_string(),
        point_estimate,
        lower: percentile(&valid, tail),
        upper: percentile(&valid, 1.0 - tail),
        confidence: settings.confidence,
        replicates: settings.replicates,
        valid_replicates: valid.len(),
        unit: settings.unit,
        seed,
    };
    debug!(
        metric = metric_name,
        lower = ?interval.lower,
        upper = ?interval.upper,
        "bootstrap interval computed"
    );
    Ok(interval)
}

/// [`bootstrap_ci`] for metrics that already return a scalar.
pub fn bootstrap_scalar<M>(
    metric_name: &str,
    traces: &[Trace],
    metric: M,
    settings: &BootstrapSettings,
    seed: u64,
) -> ValidationResult<BootstrapInterval>
where
    M: Fn(&[Trace]) -> Option<f64> + Sync,
{
    bootstrap_ci(metric_name, traces, metric, |value: &Option<f64>| *value, settings, seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DecisionOutcome, Extracted};

    fn traces() -> Vec<Trace> {
        (0..30)
            .map(|index| Trace {
                agent_id: format!("agent_{}", index % 6),
                step: index as u64 / 6,
                proposed_action: Extracted::Known("x".to_string()),
                final_action: Extracted::Known("x".to_string()),
                constructs: Default::default(),
                outcome: if index % 3 == 0 {
                    DecisionOutcome::Rejected
                } else {
                    DecisionOutcome::Approved
                },
                state_before: Default::default(),
                state_after: None,
                triggered: None,
                agent_type: None,
                reasoning: None,
            })
            .collect()
    }

    fn rejection_rate(traces: &[Trace]) -> Option<f64> {
        crate::stats::ratio(
            traces
                .iter()
                .filter(|trace| trace.outcome == DecisionOutcome::Rejected)
                .count(),
            traces.len(),
        )
    }

    #[test]
    fn agent_resampling_keeps_clusters_whole() {
        let traces = traces();
        let indices = resample_indices(&traces, ResampleUnit::Agent, 5, 0);
        assert_eq!(indices.len(), traces.len());
        let mut per_agent: BTreeMap<&str, usize> = BTreeMap::new();
        for index in &indices {
            *per_agent.entry(traces[*index].agent_id.as_str()).or_insert(0) += 1;
        }
        assert!(per_agent.values().all(|count| count % 5 == 0));
    }

    #[test]
    fn intervals_are_reproducible_and_thread_independent() {
        let traces = traces();
        let settings = BootstrapSettings {
            replicates: 200,
            unit: ResampleUnit::Trace,
            ..BootstrapSettings::default()
        };
        let first = bootstrap_scalar("rejection", &traces, rejection_rate, &settings, 9).expect("first");
        let second = bootstrap_scalar("rejection", &traces, rejection_rate, &settings, 9).expect("second");
        assert_eq!(first, second);

        let parallel_settings = BootstrapSettings {
            worker_threads: 3,
            ..settings.clone()
        };
        let parallel =
            bootstrap_scalar("rejection", &traces, rejection_rate, &parallel_settings, 9).expect("parallel");
        assert_eq!(first.lower, parallel.lower);
        assert_eq!(first.upper, parallel.upper);

        let lower = first.lower.expect("lower");
        let upper = first.upper.expect("upper");
        let point = first.point_estimate.expect("point");
        assert!(lower <= point && point <= upper);
    }

    #[test]
    fn extractor_selects_a_field() {
        let traces = traces();
        let settings = BootstrapSettings {
            replicates: 50,
            ..BootstrapSettings::default()
        };
        let interval = bootstrap_ci(
            "count",
            &traces,
            |sample| (sample.len(), rejection_rate(sample)),
            |pair: &(usize, Option<f64>)| Some(pair.0 as f64),
            &settings,
            1,
        )
        .expect("interval");
        assert_eq!(interval.lower, Some(30.0));
        assert_eq!(interval.upper, Some(30.0));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let traces = traces();
        let bad = BootstrapSettings {
            confidence: 1.0,
            ..BootstrapSettings::default()
        };
        assert!(bootstrap_scalar("r", &traces, rejection_rate, &bad, 0).is_err());
        let none = BootstrapSettings {
            replicates: 0,
            ..BootstrapSettings::default()
        };
        assert!(bootstrap_scalar("r", &traces, rejection_rate, &none, 0).is_err());
    }
}

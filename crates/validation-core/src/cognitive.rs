//! L3 cognitive validation over repeated persona-probe responses.
//!
//! Runs without any simulation traces: reliability (ICC), discriminability
//! (eta squared) and directional sensitivity are all computed from replicate
//! answers of designed personas.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{
    ConstructReliability, DirectionalPair, DirectionalResult, ExpectedDirection, L3Metrics,
    OrdinalScale, ProbeConfig, ProbeResponse,
};
use tracing::{info, warn};

use crate::error::{ValidationError, ValidationResult};
use crate::stats::{one_way, ratio};

/// Ordinal rank on the construct's scale, or a plain number when no scale is set.
pub fn response_value(scale: Option<&OrdinalScale>, raw: &str) -> Option<f64> {
    match scale {
        Some(scale) => scale
            .normalize(raw)
            .known()
            .and_then(|label| scale.rank(label))
            .map(|rank| rank as f64),
        None => raw.trim().parse::<f64>().ok().filter(|value| value.is_finite()),
    }
}

/// Known values per construct, per persona, per replicate.
type ResponseIndex = BTreeMap<String, BTreeMap<String, BTreeMap<u32, f64>>>;

fn index_responses(
    responses: &[ProbeResponse],
    config: &ProbeConfig,
) -> (ResponseIndex, BTreeMap<String, usize>) {
    let mut index = ResponseIndex::new();
    let mut unknown: BTreeMap<String, usize> = BTreeMap::new();
    for response in responses {
        let scale = config.scales.get(&response.construct);
        match response_value(scale, &response.level) {
            Some(value) => {
                index
                    .entry(response.construct.clone())
                    .or_default()
                    .entry(response.persona_id.clone())
                    .or_default()
                    .insert(response.replicate, value);
            }
            None => {
                *unknown.entry(response.construct.clone()).or_insert(0) += 1;
            }
        }
    }
    (index, unknown)
}

fn reliability(
    construct: &str,
    personas: Option<&BTreeMap<String, BTreeMap<u32, f64>>>,
    n_unknown: usize,
    config: &ProbeConfig,
) -> ConstructReliability {
    let groups: Vec<Vec<f64>> = personas
        .map(|personas| {
            personas
                .values()
                .map(|replicates| replicates.values().copied().collect())
                .collect()
        })
        .unwrap_or_default();
    let summary = one_way(&groups);
    let icc = summary.and_then(|summary| summary.icc1());
    let eta_squared = summary.and_then(|summary| summary.eta_squared());
    let degenerate = icc.is_none() || eta_squared.is_none();
    if degenerate {
        warn!(construct, "persona responses too sparse or invariant for ICC / eta squared");
    }
    ConstructReliability {
        construct: construct.to_string(),
        n_personas: groups.len(),
        n_responses: groups.iter().map(Vec::len).sum(),
        n_unknown,
        icc,
        eta_squared,
        degenerate,
        icc_passes: icc.map(|value| value >= config.icc_threshold),
        eta_passes: eta_squared.map(|value| value >= config.eta_squared_threshold),
    }
}

/// Replicates answered by both personas, compared in replicate order.
fn directional(pair: &DirectionalPair, index: &ResponseIndex) -> DirectionalResult {
    let personas = index.get(&pair.construct);
    let baseline = personas.and_then(|personas| personas.get(&pair.baseline));
    let varied = personas.and_then(|personas| personas.get(&pair.varied));
    let (mut n_pairs, mut n_in_direction) = (0, 0);
    if let (Some(baseline), Some(varied)) = (baseline, varied) {
        for (replicate, before) in baseline {
            let Some(after) = varied.get(replicate) else {
                continue;
            };
            n_pairs += 1;
            let shifted = match pair.expected {
                ExpectedDirection::Increase => after > before,
                ExpectedDirection::Decrease => after < before,
            };
            if shifted {
                n_in_direction += 1;
            }
        }
    }
    DirectionalResult {
        baseline: pair.baseline.clone(),
        varied: pair.varied.clone(),
        varied_dimension: pair.varied_dimension.clone(),
        construct: pair.construct.clone(),
        expected: pair.expected,
        n_pairs,
        n_in_direction,
        rate: ratio(n_in_direction, n_pairs),
    }
}

pub fn compute_l3(responses: &[ProbeResponse], config: &ProbeConfig) -> ValidationResult<L3Metrics> {
    if responses.is_empty() {
        return Err(ValidationError::EmptyProbeSet);
    }
    let (index, unknown) = index_responses(responses, config);
    let constructs: BTreeSet<&str> = responses
        .iter()
        .map(|response| response.construct.as_str())
        .collect();
    let reliabilities: Vec<ConstructReliability> = constructs
        .iter()
        .map(|construct| {
            reliability(
                construct,
                index.get(*construct),
                unknown.get(*construct).copied().unwrap_or(0),
                config,
            )
        })
        .collect();

    let directional: Vec<DirectionalResult> = config
        .directional_pairs
        .iter()
        .map(|pair| directional(pair, &index))
        .collect();
    let directional_rate = ratio(
        directional.iter().map(|result| result.n_in_direction).sum(),
        directional.iter().map(|result| result.n_pairs).sum(),
    );

    let metrics = L3Metrics {
        n_personas: responses
            .iter()
            .map(|response| response.persona_id.as_str())
            .collect::<BTreeSet<_>>()
            .len(),
        n_responses: responses.len(),
        constructs: reliabilities,
        directional,
        directional_rate,
        directional_passes: directional_rate.map(|rate| rate >= config.directional_threshold),
    };
    info!(
        personas = metrics.n_personas,
        responses = metrics.n_responses,
        directional_rate = ?metrics.directional_rate,
        "L3 metrics computed"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProbeConfig {
        ProbeConfig {
            scales: BTreeMap::from([(
                "threat".to_string(),
                OrdinalScale::new(["VL", "L", "M", "H", "VH"]),
            )]),
            directional_pairs: vec![DirectionalPair {
                baseline: "dry_owner".to_string(),
                varied: "flooded_owner".to_string(),
                varied_dimension: "flood_history".to_string(),
                construct: "threat".to_string(),
                expected: ExpectedDirection::Increase,
            }],
            ..ProbeConfig::default()
        }
    }

    fn responses(dry: &[&str], flooded: &[&str]) -> Vec<ProbeResponse> {
        let mut all = Vec::new();
        for (replicate, level) in dry.iter().enumerate() {
            all.push(ProbeResponse::new("dry_owner", replicate as u32, "threat", *level));
        }
        for (replicate, level) in flooded.iter().enumerate() {
            all.push(ProbeResponse::new("flooded_owner", replicate as u32, "threat", *level));
        }
        all
    }

    #[test]
    fn discriminating_personas_pass_every_check() {
        let metrics = compute_l3(
            &responses(&["L", "L", "M", "L"], &["H", "VH", "H", "H"]),
            &config(),
        )
        .expect("l3");
        let threat = &metrics.constructs[0];
        assert_eq!(threat.n_personas, 2);
        assert!(threat.icc.expect("icc") > 0.6);
        assert!(threat.eta_squared.expect("eta") > 0.14);
        assert_eq!(threat.icc_passes, Some(true));
        assert_eq!(metrics.directional[0].n_pairs, 4);
        assert_eq!(metrics.directional_rate, Some(1.0));
        assert_eq!(metrics.directional_passes, Some(true));
    }

    #[test]
    fn identical_constant_answers_are_degenerate() {
        let metrics =
            compute_l3(&responses(&["M", "M", "M"], &["M", "M", "M"]), &config()).expect("l3");
        let threat = &metrics.constructs[0];
        assert!(threat.degenerate);
        assert_eq!(threat.eta_squared, None);
        assert_eq!(metrics.directional_rate, Some(0.0));
    }

    #[test]
    fn unparseable_answers_are_counted_not_scored() {
        let metrics =
            compute_l3(&responses(&["L", "banana"], &["H", "VH"]), &config()).expect("l3");
        let threat = &metrics.constructs[0];
        assert_eq!(threat.n_unknown, 1);
        assert_eq!(threat.n_responses, 3);
        assert_eq!(metrics.directional[0].n_pairs, 1);
    }

    #[test]
    fn empty_probe_set_is_fatal() {
        assert!(matches!(
            compute_l3(&[], &ProbeConfig::default()),
            Err(ValidationError::EmptyProbeSet)
        ));
    }
}

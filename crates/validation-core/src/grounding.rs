//! Construct grounding: expected construct levels derived from objective state
//! and compared against what agents reported.
//!
//! A [`GroundingStrategy`] only ever sees the pre-decision state map, so the
//! derived level cannot depend on the agent's self-report or chosen action.

use std::fmt;

use contracts::{
    CgrResult, ConstructAgreement, ConstructCutpoints, ConstructLevels, Extracted,
    GroundingConfig, KappaWeighting, OrdinalScale, StateMap, Trace,
};
use tracing::{info, warn};

use crate::error::{ValidationError, ValidationResult};
use crate::registry::NamedRegistry;
use crate::stats::{cohen_kappa, ratio};

pub trait GroundingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Constructs this strategy grounds, with the scale each is compared on.
    fn scales(&self) -> Vec<(String, OrdinalScale)>;

    fn ground(&self, state_before: &StateMap) -> ConstructLevels;

    fn weighting(&self) -> KappaWeighting {
        KappaWeighting::default()
    }
}

/// Weighted sum of numeric state keys bucketed by ascending cut points.
#[derive(Debug, Clone)]
pub struct ThresholdGrounding {
    name: String,
    constructs: Vec<ConstructCutpoints>,
    weighting: KappaWeighting,
}

impl ThresholdGrounding {
    pub fn new(config: GroundingConfig) -> ValidationResult<Self> {
        let invalid = |reason: String| ValidationError::InvalidGrounding {
            name: config.name.clone(),
            reason,
        };
        if config.constructs.is_empty() {
            return Err(invalid("no constructs".to_string()));
        }
        for entry in &config.constructs {
            if entry.scale.len() < 2 {
                return Err(invalid(format!(
                    "{:?} needs a scale of at least two labels",
                    entry.construct
                )));
            }
            if entry.cutpoints.len() + 1 != entry.scale.len() {
                return Err(invalid(format!(
                    "{:?} has {} cut points for {} labels",
                    entry.construct,
                    entry.cutpoints.len(),
                    entry.scale.len()
                )));
            }
            if entry.cutpoints.iter().any(|cut| !cut.is_finite())
                || entry.cutpoints.windows(2).any(|pair| pair[0] > pair[1])
            {
                return Err(invalid(format!(
                    "{:?} cut points must be finite and ascending",
                    entry.construct
                )));
            }
            if entry.inputs.is_empty() {
                return Err(invalid(format!("{:?} has no inputs", entry.construct)));
            }
        }
        Ok(Self {
            name: config.name,
            constructs: config.constructs,
            weighting: config.weighting,
        })
    }

    /// `None` when any input is missing or non-numeric.
    fn score(entry: &ConstructCutpoints, state: &StateMap) -> Option<f64> {
        entry.inputs.iter().try_fold(0.0, |total, term| {
            let value = state.get(&term.key).and_then(contracts::value_as_f64)?;
            Some(total + term.weight * value)
        })
    }
}

impl GroundingStrategy for ThresholdGrounding {
    fn name(&self) -> &str {
        &self.name
    }

    fn scales(&self) -> Vec<(String, OrdinalScale)> {
        self.constructs
            .iter()
            .map(|entry| (entry.construct.clone(), entry.scale.clone()))
            .collect()
    }

    fn ground(&self, state_before: &StateMap) -> ConstructLevels {
        self.constructs
            .iter()
            .map(|entry| {
                let level: Extracted<String> = Self::score(entry, state_before)
                    .filter(|score| score.is_finite())
                    .and_then(|score| {
                        let rank = entry.cutpoints.iter().filter(|cut| score >= **cut).count();
                        entry.scale.label_at(rank).map(str::to_string)
                    })
                    .into();
                (entry.construct.clone(), level)
            })
            .collect()
    }

    fn weighting(&self) -> KappaWeighting {
        self.weighting
    }
}

/// Grounding strategies registered at configuration time and selected by name.
pub struct GroundingRegistry {
    inner: NamedRegistry<Box<dyn GroundingStrategy>>,
}

impl GroundingRegistry {
    pub fn new() -> Self {
        Self {
            inner: NamedRegistry::new("grounding"),
        }
    }

    pub fn from_configs(configs: &[GroundingConfig]) -> ValidationResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register(Box::new(ThresholdGrounding::new(config.clone())?))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, strategy: Box<dyn GroundingStrategy>) -> ValidationResult<()> {
        let name = strategy.name().to_string();
        self.inner.register(name, strategy)
    }

    /// The named strategy, else the first registered; `None` when nothing is
    /// registered and no name was asked for.
    pub fn resolve(&self, name: Option<&str>) -> ValidationResult<Option<&dyn GroundingStrategy>> {
        Ok(self
            .inner
            .resolve_optional(name)?
            .map(|strategy| strategy.as_ref()))
    }

    /// Constructs covered by any registered strategy, with their scales.
    pub fn scales(&self) -> Vec<(String, OrdinalScale)> {
        self.inner
            .values()
            .flat_map(|strategy| strategy.scales())
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names().collect()
    }
}

impl Default for GroundingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GroundingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroundingRegistry")
            .field("groundings", &self.names())
            .field("default", &self.inner.default_name())
            .finish()
    }
}

fn rank_of(scale: &OrdinalScale, level: Option<&Extracted<String>>) -> Option<usize> {
    match level? {
        Extracted::Known(raw) => scale.normalize(raw).known().and_then(|label| scale.rank(label)),
        Extracted::Unknown => None,
    }
}

/// Compare grounded and self-reported levels for every construct the strategy covers.
pub fn compute_cgr(traces: &[Trace], grounding: &dyn GroundingStrategy) -> CgrResult {
    let weighting = grounding.weighting();
    let grounded: Vec<ConstructLevels> = traces
        .iter()
        .map(|trace| grounding.ground(&trace.state_before))
        .collect();

    let mut constructs = Vec::new();
    let (mut total_exact, mut total_adjacent) = (0, 0);
    for (construct, scale) in grounding.scales() {
        let k = scale.len();
        let mut confusion = vec![vec![0_u64; k]; k];
        let (mut exact, mut adjacent, mut compared, mut unknown) = (0, 0, 0, 0);

        for (trace, expected) in traces.iter().zip(&grounded) {
            let reported = rank_of(&scale, trace.constructs.get(&construct));
            let derived = rank_of(&scale, expected.get(&construct));
            let (Some(reported), Some(derived)) = (reported, derived) else {
                unknown += 1;
                continue;
            };
            compared += 1;
            confusion[reported][derived] += 1;
            if reported == derived {
                exact += 1;
            }
            if reported.abs_diff(derived) <= 1 {
                adjacent += 1;
            }
        }

        total_exact += exact;
        total_adjacent += adjacent;
        let weighted_kappa = cohen_kappa(&confusion, Some(weighting));
        let trivial_agreement = compared > 0 && weighted_kappa.is_none();
        if trivial_agreement {
            warn!(construct = %construct, compared, "grounding agreement is trivial");
        }
        constructs.push(ConstructAgreement {
            construct,
            labels: scale.labels.clone(),
            n_compared: compared,
            n_unknown: unknown,
            exact_match_rate: ratio(exact, compared),
            adjacent_match_rate: ratio(adjacent, compared),
            weighted_kappa,
            kappa: cohen_kappa(&confusion, None),
            trivial_agreement,
            confusion,
        });
    }

    let compared: usize = constructs.iter().map(|entry| entry.n_compared).sum();
    let result = CgrResult {
        strategy: grounding.name().to_string(),
        weighting,
        exact_match_rate: ratio(total_exact, compared),
        adjacent_match_rate: ratio(total_adjacent, compared),
        n_compared: compared,
        n_unknown: constructs.iter().map(|entry| entry.n_unknown).sum(),
        constructs,
    };
    info!(
        strategy = %result.strategy,
        compared = result.n_compared,
        exact = ?result.exact_match_rate,
        "construct grounding computed"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use contracts::{DecisionOutcome, WeightedTerm};
    use serde_json::json;

    fn grounding(weighting: KappaWeighting) -> ThresholdGrounding {
        ThresholdGrounding::new(GroundingConfig {
            name: "depth_threat".to_string(),
            constructs: vec![ConstructCutpoints {
                construct: "threat".to_string(),
                scale: OrdinalScale::new(["L", "M", "H"]),
                inputs: vec![WeightedTerm {
                    key: "flood_depth".to_string(),
                    weight: 1.0,
                }],
                cutpoints: vec![0.5, 1.5],
            }],
            weighting,
        })
        .expect("grounding")
    }

    fn trace(depth: Option<f64>, reported: &str) -> Trace {
        let mut state = StateMap::new();
        if let Some(depth) = depth {
            state.insert("flood_depth".to_string(), json!(depth));
        }
        Trace {
            agent_id: "a".to_string(),
            step: 0,
            proposed_action: Extracted::Unknown,
            final_action: Extracted::Unknown,
            constructs: BTreeMap::from([(
                "threat".to_string(),
                Extracted::Known(reported.to_string()),
            )]),
            outcome: DecisionOutcome::Approved,
            state_before: state,
            state_after: None,
            triggered: None,
            agent_type: None,
            reasoning: None,
        }
    }

    #[test]
    fn registry_selects_by_name_and_rejects_unknown_names() {
        let mut second = grounding(KappaWeighting::Quadratic);
        second.name = "income_threat".to_string();
        let mut registry = GroundingRegistry::new();
        assert!(registry.resolve(None).expect("empty").is_none());
        registry
            .register(Box::new(grounding(KappaWeighting::Linear)))
            .expect("first");
        registry.register(Box::new(second)).expect("second");

        let default = registry.resolve(None).expect("default").expect("present");
        assert_eq!(default.name(), "depth_threat");
        let named = registry
            .resolve(Some("income_threat"))
            .expect("named")
            .expect("present");
        assert_eq!(named.weighting(), KappaWeighting::Quadratic);
        assert!(matches!(
            registry.resolve(Some("satellite")),
            Err(ValidationError::Unregistered { kind: "grounding", .. })
        ));
        assert_eq!(registry.scales().len(), 2);
    }

    #[test]
    fn cut_points_bucket_scores() {
        let strategy = grounding(KappaWeighting::Linear);
        let level = |depth: f64| {
            strategy.ground(&StateMap::from([("flood_depth".to_string(), json!(depth))]))
                ["threat"]
                .clone()
        };
        assert_eq!(level(0.0), Extracted::Known("L".to_string()));
        assert_eq!(level(0.5), Extracted::Known("M".to_string()));
        assert_eq!(level(3.0), Extracted::Known("H".to_string()));
        assert_eq!(
            strategy.ground(&StateMap::new())["threat"],
            Extracted::Unknown
        );
    }

    #[test]
    fn mismatched_cut_points_are_rejected() {
        let mut config = GroundingConfig {
            name: "bad".to_string(),
            constructs: vec![ConstructCutpoints {
                construct: "threat".to_string(),
                scale: OrdinalScale::new(["L", "M", "H"]),
                inputs: vec![WeightedTerm {
                    key: "x".to_string(),
                    weight: 1.0,
                }],
                cutpoints: vec![1.0],
            }],
            weighting: KappaWeighting::Quadratic,
        };
        assert!(ThresholdGrounding::new(config.clone()).is_err());
        config.constructs[0].cutpoints = vec![2.0, 1.0];
        assert!(ThresholdGrounding::new(config).is_err());
    }

    #[test]
    fn agreement_rates_and_unknowns() {
        let traces = vec![
            trace(Some(0.0), "L"),
            trace(Some(1.0), "M"),
            trace(Some(2.0), "M"),
            trace(None, "H"),
        ];
        let result = compute_cgr(&traces, &grounding(KappaWeighting::Quadratic));
        let threat = &result.constructs[0];
        assert_eq!(threat.n_compared, 3);
        assert_eq!(threat.n_unknown, 1);
        assert!((threat.exact_match_rate.expect("exact") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(threat.adjacent_match_rate, Some(1.0));
        assert_eq!(threat.confusion[1][2], 1);
        assert!(!threat.trivial_agreement);
        assert_eq!(result.exact_match_rate, threat.exact_match_rate);
    }

    #[test]
    fn single_cell_agreement_is_flagged_trivial() {
        let traces = vec![trace(Some(0.0), "L"), trace(Some(0.1), "L")];
        let result = compute_cgr(&traces, &grounding(KappaWeighting::Linear));
        let threat = &result.constructs[0];
        assert_eq!(threat.exact_match_rate, Some(1.0));
        assert!(threat.trivial_agreement);
        assert_eq!(threat.weighted_kappa, None);
    }
}

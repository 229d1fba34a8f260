//! Benchmark registry and the built-in parametric benchmark kinds.
//!
//! A benchmark function receives a [`BenchmarkContext`] holding the joined
//! trace and profile data plus an open keyword map, and returns `None` when the
//! statistic cannot be computed for that data.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use contracts::{
    AgentProfile, BenchmarkConfig, BenchmarkKind, BenchmarkSpec, StateCondition, SubgroupFilter,
    Trace,
};
use serde_json::Value;

use crate::error::{ValidationError, ValidationResult};
use crate::ingest::ProfileTable;
use crate::registry::NamedRegistry;
use crate::stats::ratio;

/// Keyword parameter read by every built-in kind: the minimum number of
/// eligible traces (or agents) below which the benchmark is not computed.
pub const MIN_SUPPORT_PARAM: &str = "min_support";

#[derive(Clone, Copy)]
pub struct BenchmarkContext<'a> {
    pub traces: &'a [Trace],
    pub profiles: &'a ProfileTable,
    pub params: &'a BTreeMap<String, Value>,
}

impl<'a> BenchmarkContext<'a> {
    pub fn new(
        traces: &'a [Trace],
        profiles: &'a ProfileTable,
        params: &'a BTreeMap<String, Value>,
    ) -> Self {
        Self {
            traces,
            profiles,
            params,
        }
    }

    /// Same profiles and parameters over a different trace collection.
    pub fn with_traces<'b>(&self, traces: &'b [Trace]) -> BenchmarkContext<'b>
    where
        'a: 'b,
    {
        BenchmarkContext {
            traces,
            profiles: self.profiles,
            params: self.params,
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(contracts::value_as_f64)
    }

    pub fn min_support(&self) -> usize {
        self.param_f64(MIN_SUPPORT_PARAM)
            .filter(|value| value.is_finite() && *value >= 1.0)
            .map(|value| value as usize)
            .unwrap_or(1)
    }

    pub fn profile(&self, trace: &Trace) -> Option<&'a AgentProfile> {
        self.profiles.get(&trace.agent_id)
    }
}

pub type BenchmarkFn = Box<dyn Fn(&BenchmarkContext<'_>) -> Option<f64> + Send + Sync>;

pub struct RegisteredBenchmark {
    spec: BenchmarkSpec,
    compute: BenchmarkFn,
}

impl RegisteredBenchmark {
    pub fn spec(&self) -> &BenchmarkSpec {
        &self.spec
    }

    /// Non-finite results count as not computable.
    pub fn compute(&self, context: &BenchmarkContext<'_>) -> Option<f64> {
        (self.compute)(context).filter(|value| value.is_finite())
    }
}

impl fmt::Debug for RegisteredBenchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBenchmark")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

pub fn validate_spec(spec: &BenchmarkSpec) -> ValidationResult<()> {
    let invalid = |reason: &str| ValidationError::InvalidBenchmark {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };
    if spec.name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if !spec.low.is_finite() || !spec.high.is_finite() {
        return Err(invalid("range bounds must be finite"));
    }
    if spec.low > spec.high {
        return Err(invalid("range is inverted"));
    }
    if !spec.weight.is_finite() || spec.weight <= 0.0 {
        return Err(invalid("weight must be positive"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct BenchmarkRegistry {
    inner: NamedRegistry<RegisteredBenchmark>,
}

impl BenchmarkRegistry {
    pub fn new() -> Self {
        Self {
            inner: NamedRegistry::new("benchmark"),
        }
    }

    pub fn from_configs(configs: &[BenchmarkConfig]) -> ValidationResult<Self> {
        let mut registry = Self::new();
        for config in configs {
            registry.register_kind(config.clone())?;
        }
        Ok(registry)
    }

    pub fn register<F>(&mut self, spec: BenchmarkSpec, compute: F) -> ValidationResult<()>
    where
        F: Fn(&BenchmarkContext<'_>) -> Option<f64> + Send + Sync + 'static,
    {
        validate_spec(&spec)?;
        let name = spec.name.clone();
        self.inner.register(
            name,
            RegisteredBenchmark {
                spec,
                compute: Box::new(compute),
            },
        )
    }

    pub fn register_kind(&mut self, config: BenchmarkConfig) -> ValidationResult<()> {
        let BenchmarkConfig { spec, kind } = config;
        match kind {
            BenchmarkKind::ActionShare { actions } => {
                let actions = action_set(&spec, actions)?;
                self.register(spec, move |context| {
                    action_share(context.traces.iter(), &actions, context.min_support())
                })
            }
            BenchmarkKind::ConditionalActionShare { actions, condition } => {
                let actions = action_set(&spec, actions)?;
                self.register(spec, move |context| {
                    let eligible = context
                        .traces
                        .iter()
                        .filter(|trace| condition_holds(condition.as_ref(), trace));
                    action_share(eligible, &actions, context.min_support())
                })
            }
            BenchmarkKind::SubgroupActionShare { actions, filter } => {
                let actions = action_set(&spec, actions)?;
                self.register(spec, move |context| {
                    let eligible = context
                        .traces
                        .iter()
                        .filter(|trace| filter_matches(&filter, context, trace));
                    action_share(eligible, &actions, context.min_support())
                })
            }
            BenchmarkKind::CumulativeAdoption { actions, filter } => {
                let actions = action_set(&spec, actions)?;
                self.register(spec, move |context| {
                    cumulative_adoption(context, &filter, &actions)
                })
            }
        }
    }

    pub fn get(&self, name: &str) -> ValidationResult<&RegisteredBenchmark> {
        self.inner.get(name)
    }

    /// Compute one benchmark by name; unregistered names are errors.
    pub fn compute(&self, name: &str, context: &BenchmarkContext<'_>) -> ValidationResult<Option<f64>> {
        Ok(self.get(name)?.compute(context))
    }

    /// Every registered benchmark in name order.
    pub fn evaluate(&self, context: &BenchmarkContext<'_>) -> Vec<(&BenchmarkSpec, Option<f64>)> {
        self.inner
            .names()
            .filter_map(|name| self.inner.get(name).ok())
            .map(|benchmark| (benchmark.spec(), benchmark.compute(context)))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for BenchmarkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn action_set(spec: &BenchmarkSpec, actions: Vec<String>) -> ValidationResult<BTreeSet<String>> {
    if actions.is_empty() {
        return Err(ValidationError::InvalidBenchmark {
            name: spec.name.clone(),
            reason: "no actions listed".to_string(),
        });
    }
    Ok(actions.into_iter().collect())
}

/// Share of eligible traces with a known final action that is in `actions`.
fn action_share<'t>(
    eligible: impl Iterator<Item = &'t Trace>,
    actions: &BTreeSet<String>,
    min_support: usize,
) -> Option<f64> {
    let (mut support, mut hits) = (0, 0);
    for action in eligible.filter_map(|trace| trace.final_action.known()) {
        support += 1;
        if actions.contains(action) {
            hits += 1;
        }
    }
    if support < min_support {
        return None;
    }
    ratio(hits, support)
}

fn condition_holds(condition: Option<&StateCondition>, trace: &Trace) -> bool {
    match condition {
        Some(condition) => condition.holds(&trace.state_before),
        None => trace.triggered == Some(true),
    }
}

fn filter_matches(filter: &SubgroupFilter, context: &BenchmarkContext<'_>, trace: &Trace) -> bool {
    if let Some(agent_type) = &filter.agent_type {
        if context.profiles.agent_type_of(trace) != agent_type {
            return false;
        }
    }
    if filter.marginalized.is_none() && filter.zone.is_none() {
        return true;
    }
    let Some(profile) = context.profile(trace) else {
        return false;
    };
    filter
        .marginalized
        .map_or(true, |flag| profile.marginalized == flag)
        && filter
            .zone
            .as_ref()
            .map_or(true, |zone| profile.zone.as_ref() == Some(zone))
}

/// Fraction of matching agents that took one of `actions` at least once.
fn cumulative_adoption(
    context: &BenchmarkContext<'_>,
    filter: &SubgroupFilter,
    actions: &BTreeSet<String>,
) -> Option<f64> {
    let mut adopted: BTreeMap<&str, bool> = BTreeMap::new();
    for trace in context
        .traces
        .iter()
        .filter(|trace| filter_matches(filter, context, trace))
    {
        let took = trace
            .final_action
            .known()
            .is_some_and(|action| actions.contains(action));
        *adopted.entry(trace.agent_id.as_str()).or_insert(false) |= took;
    }
    if adopted.len() < context.min_support() {
        return None;
    }
    ratio(
        adopted.values().filter(|took| **took).count(),
        adopted.len(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{BenchmarkCategory, DecisionOutcome, Extracted, StateMap, StateTerm};
    use serde_json::json;

    fn trace(agent: &str, step: u64, action: &str, flooded: bool) -> Trace {
        Trace {
            agent_id: agent.to_string(),
            step,
            proposed_action: Extracted::Known(action.to_string()),
            final_action: Extracted::Known(action.to_string()),
            constructs: Default::default(),
            outcome: DecisionOutcome::Approved,
            state_before: StateMap::from([("flooded".to_string(), json!(flooded))]),
            state_after: None,
            triggered: Some(flooded),
            agent_type: None,
            reasoning: None,
        }
    }

    fn profiles() -> ProfileTable {
        ProfileTable::from_profiles([
            AgentProfile {
                agent_id: "a".to_string(),
                agent_type: "owner".to_string(),
                marginalized: true,
                zone: Some("high".to_string()),
                covariates: BTreeMap::new(),
            },
            AgentProfile {
                agent_id: "b".to_string(),
                agent_type: "renter".to_string(),
                marginalized: false,
                zone: Some("low".to_string()),
                covariates: BTreeMap::new(),
            },
        ])
        .expect("profiles")
    }

    fn config(name: &str, kind: BenchmarkKind) -> BenchmarkConfig {
        BenchmarkConfig {
            spec: BenchmarkSpec::new(name, 0.0, 1.0, 1.0, BenchmarkCategory::Aggregate),
            kind,
        }
    }

    fn traces() -> Vec<Trace> {
        vec![
            trace("a", 1, "insure", true),
            trace("a", 2, "do_nothing", false),
            trace("b", 1, "do_nothing", true),
            trace("b", 2, "do_nothing", false),
        ]
    }

    #[test]
    fn built_in_kinds_compute_shares() {
        let insure = vec!["insure".to_string()];
        let registry = BenchmarkRegistry::from_configs(&[
            config("share", BenchmarkKind::ActionShare { actions: insure.clone() }),
            config(
                "after_flood",
                BenchmarkKind::ConditionalActionShare {
                    actions: insure.clone(),
                    condition: None,
                },
            ),
            config(
                "dry_years",
                BenchmarkKind::ConditionalActionShare {
                    actions: insure.clone(),
                    condition: Some(StateCondition::new("flooded", StateTerm::Falsy)),
                },
            ),
            config(
                "marginalized",
                BenchmarkKind::SubgroupActionShare {
                    actions: insure.clone(),
                    filter: SubgroupFilter {
                        marginalized: Some(true),
                        ..SubgroupFilter::default()
                    },
                },
            ),
            config(
                "ever_insured",
                BenchmarkKind::CumulativeAdoption {
                    actions: insure,
                    filter: SubgroupFilter::default(),
                },
            ),
        ])
        .expect("registry");

        let traces = traces();
        let profiles = profiles();
        let params = BTreeMap::new();
        let context = BenchmarkContext::new(&traces, &profiles, &params);
        let value = |name: &str| registry.compute(name, &context).expect("registered");
        assert_eq!(value("share"), Some(0.25));
        assert_eq!(value("after_flood"), Some(0.5));
        assert_eq!(value("dry_years"), Some(0.0));
        assert_eq!(value("marginalized"), Some(0.5));
        assert_eq!(value("ever_insured"), Some(0.5));
        assert!(registry.compute("missing", &context).is_err());
    }

    #[test]
    fn min_support_makes_benchmarks_uncomputable() {
        let registry = BenchmarkRegistry::from_configs(&[config(
            "share",
            BenchmarkKind::ActionShare {
                actions: vec!["insure".to_string()],
            },
        )])
        .expect("registry");
        let traces = traces();
        let profiles = profiles();
        let params = BTreeMap::from([(MIN_SUPPORT_PARAM.to_string(), json!(10))]);
        let context = BenchmarkContext::new(&traces, &profiles, &params);
        assert_eq!(registry.compute("share", &context).expect("registered"), None);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let mut registry = BenchmarkRegistry::new();
        let inverted = BenchmarkSpec::new("inverted", 0.6, 0.3, 1.0, BenchmarkCategory::Aggregate);
        assert!(matches!(
            registry.register(inverted, |_| Some(0.4)),
            Err(ValidationError::InvalidBenchmark { .. })
        ));
        let weightless = BenchmarkSpec::new("weightless", 0.1, 0.3, 0.0, BenchmarkCategory::Aggregate);
        assert!(registry.register(weightless, |_| Some(0.2)).is_err());
    }

    #[test]
    fn custom_closures_read_open_parameters() {
        let mut registry = BenchmarkRegistry::new();
        registry
            .register(
                BenchmarkSpec::new("scaled", 0.0, 10.0, 1.0, BenchmarkCategory::Temporal),
                |context| Some(context.traces.len() as f64 * context.param_f64("scale")?),
            )
            .expect("register");
        let traces = traces();
        let profiles = profiles();
        let mut params = BTreeMap::new();
        let context = BenchmarkContext::new(&traces, &profiles, &params);
        assert_eq!(registry.compute("scaled", &context).expect("registered"), None);
        params.insert("scale".to_string(), json!(0.5));
        let context = BenchmarkContext::new(&traces, &profiles, &params);
        assert_eq!(registry.compute("scaled", &context).expect("registered"), Some(2.0));
    }
}

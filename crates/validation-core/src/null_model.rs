//! Monte Carlo null-model test for the plausibility index.
//!
//! Each trial replaces the observed actions with synthetic ones drawn under a
//! [`NullPolicy`], recomputes EPI, and the observed EPI is ranked against the
//! resulting distribution.

use std::collections::BTreeMap;
use std::fmt;

use contracts::{Extracted, NullModelResult, NullModelSettings, Trace};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::benchmark::{BenchmarkContext, BenchmarkRegistry};
use crate::error::{ValidationError, ValidationResult};
use crate::plausibility::epi;
use crate::registry::NamedRegistry;
use crate::rng::{stream_rng, worker_pool};
use crate::stats::{mean, percentile, sort_finite, std_dev};

pub trait NullPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// A synthetic copy of `traces` with proposed and final actions replaced.
    fn synthesize(&self, traces: &[Trace], rng: &mut StdRng) -> Vec<Trace>;
}

fn with_action(trace: &Trace, action: Extracted<String>) -> Trace {
    Trace {
        proposed_action: action.clone(),
        final_action: action,
        ..trace.clone()
    }
}

#[derive(Debug, Clone)]
pub struct UniformRandom {
    pool: Vec<String>,
}

impl UniformRandom {
    pub fn new(pool: Vec<String>) -> ValidationResult<Self> {
        if pool.is_empty() {
            return Err(ValidationError::InvalidSettings(
                "uniform null policy needs a non-empty action pool".to_string(),
            ));
        }
        Ok(Self { pool })
    }
}

impl NullPolicy for UniformRandom {
    fn name(&self) -> &str {
        "uniform_random"
    }

    fn synthesize(&self, traces: &[Trace], rng: &mut StdRng) -> Vec<Trace> {
        traces
            .iter()
            .map(|trace| {
                let action = self.pool[rng.gen_range(0..self.pool.len())].clone();
                with_action(trace, Extracted::Known(action))
            })
            .collect()
    }
}

/// Draws from the observed final-action frequencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyMatched;

impl NullPolicy for FrequencyMatched {
    fn name(&self) -> &str {
        "frequency_matched"
    }

    fn synthesize(&self, traces: &[Trace], rng: &mut StdRng) -> Vec<Trace> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for action in traces.iter().filter_map(|trace| trace.final_action.known()) {
            *counts.entry(action.as_str()).or_insert(0) += 1;
        }
        let actions: Vec<&str> = counts.keys().copied().collect();
        let Ok(sampler) = WeightedIndex::new(counts.values().copied()) else {
            return traces.to_vec();
        };
        traces
            .iter()
            .map(|trace| {
                let action = actions[sampler.sample(rng)].to_string();
                with_action(trace, Extracted::Known(action))
            })
            .collect()
    }
}

/// Permutes observed final actions across traces.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShuffledLabels;

impl NullPolicy for ShuffledLabels {
    fn name(&self) -> &str {
        "shuffled_labels"
    }

    fn synthesize(&self, traces: &[Trace], rng: &mut StdRng) -> Vec<Trace> {
        let mut labels: Vec<Extracted<String>> = traces
            .iter()
            .map(|trace| trace.final_action.clone())
            .collect();
        labels.shuffle(rng);
        traces
            .iter()
            .zip(labels)
            .map(|(trace, label)| with_action(trace, label))
            .collect()
    }
}

/// Builds a policy once the run's declared action alphabet is known.
pub type NullPolicyFactory = Box<
    dyn Fn(&NullModelSettings, &[String]) -> ValidationResult<Box<dyn NullPolicy>> + Send + Sync,
>;

/// Shorthand for factories: box a concrete policy behind the trait.
pub fn boxed_policy(policy: impl NullPolicy + 'static) -> ValidationResult<Box<dyn NullPolicy>> {
    Ok(Box::new(policy))
}

/// Null policies selectable by name from the null-model settings.
pub struct NullPolicyRegistry {
    inner: NamedRegistry<NullPolicyFactory>,
}

impl NullPolicyRegistry {
    pub fn new() -> Self {
        Self {
            inner: NamedRegistry::new("null policy"),
        }
    }

    /// `uniform_random` (an empty pool falls back to the declared actions),
    /// `frequency_matched` and `shuffled_labels`.
    pub fn with_builtins() -> ValidationResult<Self> {
        let mut registry = Self::new();
        registry.register("uniform_random", |settings, declared_actions| {
            let pool = if settings.action_pool.is_empty() {
                declared_actions.to_vec()
            } else {
                settings.action_pool.clone()
            };
            boxed_policy(UniformRandom::new(pool)?)
        })?;
        registry.register("frequency_matched", |_, _| boxed_policy(FrequencyMatched))?;
        registry.register("shuffled_labels", |_, _| boxed_policy(ShuffledLabels))?;
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> ValidationResult<()>
    where
        F: Fn(&NullModelSettings, &[String]) -> ValidationResult<Box<dyn NullPolicy>>
            + Send
            + Sync
            + 'static,
    {
        self.inner.register(name, Box::new(factory))
    }

    /// Instantiate the policy named in `settings`.
    pub fn build(
        &self,
        settings: &NullModelSettings,
        declared_actions: &[String],
    ) -> ValidationResult<Box<dyn NullPolicy>> {
        let factory = self.inner.get(&settings.policy)?;
        factory(settings, declared_actions)
    }

    pub fn names(&self) -> Vec<&str> {
        self.inner.names().collect()
    }
}

impl Default for NullPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NullPolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NullPolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}

/// `(#{null >= observed} + 1) / (#null + 1)`.
pub fn empirical_p_value(null_epis: &[f64], observed: f64) -> f64 {
    let at_least = null_epis.iter().filter(|value| **value >= observed).count();
    (at_least + 1) as f64 / (null_epis.len() + 1) as f64
}

/// Synthetic EPI for every trial; `None` where no benchmark was computable.
pub fn null_distribution(
    registry: &BenchmarkRegistry,
    context: &BenchmarkContext<'_>,
    policy: &dyn NullPolicy,
    trials: usize,
    seed: u64,
    worker_threads: usize,
) -> Vec<Option<f64>> {
    let trial = |index: usize| {
        let mut rng = stream_rng(seed, index as u64);
        let synthetic = policy.synthesize(context.traces, &mut rng);
        epi(registry, &context.with_traces(&synthetic))
    };
    match worker_pool(worker_threads) {
        Some(pool) => pool.install(|| (0..trials).into_par_iter().map(trial).collect()),
        None => (0..trials).map(trial).collect(),
    }
}

pub fn run_null_model(
    registry: &BenchmarkRegistry,
    context: &BenchmarkContext<'_>,
    policy: &dyn NullPolicy,
    trials: usize,
    seed: u64,
    worker_threads: usize,
) -> ValidationResult<NullModelResult> {
    if trials == 0 {
        return Err(ValidationError::InvalidSettings(
            "null model needs at least one trial".to_string(),
        ));
    }
    let observed_epi = epi(registry, context);
    let mut valid: Vec<f64> =
        null_distribution(registry, context, policy, trials, seed, worker_threads)
            .into_iter()
            .flatten()
            .collect();
    sort_finite(&mut valid);
    if valid.len() < trials {
        warn!(
            trials,
            valid = valid.len(),
            "null trials without a computable EPI were excluded"
        );
    }

    let p_value = match (observed_epi, valid.is_empty()) {
        (Some(observed), false) => Some(empirical_p_value(&valid, observed)),
        _ => None,
    };
    let result = NullModelResult {
        policy: policy.name().to_string(),
        trials,
        valid_trials: valid.len(),
        observed_epi,
        p_value,
        null_mean: mean(&valid),
        null_std: std_dev(&valid),
        null_p95: percentile(&valid, 0.95),
        seed,
    };
    info!(
        policy = %result.policy,
        observed = ?result.observed_epi,
        p_value = ?result.p_value,
        "null model evaluated"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ProfileTable;
    use contracts::{BenchmarkCategory, BenchmarkConfig, BenchmarkKind, BenchmarkSpec, DecisionOutcome};

    fn traces(n: usize) -> Vec<Trace> {
        (0..n)
            .map(|index| Trace {
                agent_id: format!("agent_{}", index % 5),
                step: index as u64,
                proposed_action: Extracted::Known("insure".to_string()),
                final_action: Extracted::Known(if index % 4 == 0 { "wait" } else { "insure" }.to_string()),
                constructs: Default::default(),
                outcome: DecisionOutcome::Approved,
                state_before: Default::default(),
                state_after: None,
                triggered: None,
                agent_type: None,
                reasoning: None,
            })
            .collect()
    }

    fn registry() -> BenchmarkRegistry {
        BenchmarkRegistry::from_configs(&[BenchmarkConfig {
            spec: BenchmarkSpec::new("uptake", 0.7, 0.8, 1.0, BenchmarkCategory::Aggregate),
            kind: BenchmarkKind::ActionShare {
                actions: vec!["insure".to_string()],
            },
        }])
        .expect("registry")
    }

    #[test]
    fn p_value_uses_plus_one_correction() {
        assert!((empirical_p_value(&[0.1; 1000], 0.9) - 1.0 / 1001.0).abs() < 1e-15);
        assert_eq!(empirical_p_value(&[0.5, 0.5, 0.5], 0.5), 1.0);
        assert_eq!(empirical_p_value(&[], 0.5), 1.0);
    }

    #[test]
    fn null_runs_are_reproducible_across_worker_counts() {
        let traces = traces(40);
        let profiles = ProfileTable::new();
        let params = BTreeMap::new();
        let context = BenchmarkContext::new(&traces, &profiles, &params);
        let registry = registry();
        let policy = FrequencyMatched;
        let sequential = run_null_model(&registry, &context, &policy, 64, 11, 1).expect("seq");
        let parallel = run_null_model(&registry, &context, &policy, 64, 11, 4).expect("par");
        assert_eq!(sequential, parallel);
        assert_eq!(sequential.observed_epi, Some(1.0));
    }

    #[test]
    fn shuffling_preserves_the_action_multiset() {
        let traces = traces(12);
        let mut rng = stream_rng(3, 0);
        let shuffled = ShuffledLabels.synthesize(&traces, &mut rng);
        let count = |set: &[Trace]| {
            set.iter()
                .filter(|trace| trace.final_action == Extracted::Known("wait".to_string()))
                .count()
        };
        assert_eq!(count(&traces), count(&shuffled));
    }

    #[test]
    fn empty_uniform_pool_without_declared_actions_is_rejected() {
        let registry = NullPolicyRegistry::with_builtins().expect("builtins");
        let settings = NullModelSettings::default();
        assert!(registry.build(&settings, &[]).is_err());
        let policy = registry
            .build(&settings, &["a".to_string()])
            .expect("fallback pool");
        assert_eq!(policy.name(), "uniform_random");
    }

    #[test]
    fn policies_resolve_by_name() {
        let mut registry = NullPolicyRegistry::with_builtins().expect("builtins");
        let named = |policy: &str| NullModelSettings {
            policy: policy.to_string(),
            ..NullModelSettings::default()
        };
        assert_eq!(
            registry.build(&named("shuffled_labels"), &[]).expect("builtin").name(),
            "shuffled_labels"
        );
        assert!(matches!(
            registry.build(&named("coin_flip"), &[]),
            Err(ValidationError::Unregistered { kind: "null policy", .. })
        ));

        registry
            .register("coin_flip", |_, _| {
                boxed_policy(UniformRandom::new(vec![
                    "heads".to_string(),
                    "tails".to_string(),
                ])?)
            })
            .expect("custom");
        assert_eq!(
            registry.build(&named("coin_flip"), &[]).expect("custom").name(),
            "uniform_random"
        );
        assert!(matches!(
            registry.register("frequency_matched", |_, _| boxed_policy(FrequencyMatched)),
            Err(ValidationError::DuplicateRegistration { .. })
        ));
    }
}

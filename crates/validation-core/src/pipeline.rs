//! End-to-end run wiring: every plugin arrives as an explicit parameter.

use std::collections::BTreeSet;

use contracts::{ProbeResponse, RunMetadata, ValidationConfig, ValidationReport};
use tracing::{info, warn};

use crate::benchmark::{BenchmarkContext, BenchmarkRegistry};
use crate::bootstrap::{bootstrap_scalar, validate_settings};
use crate::cognitive::compute_l3;
use crate::error::{ValidationError, ValidationResult};
use crate::grounding::{compute_cgr, GroundingStrategy};
use crate::hallucination::{HallucinationChecker, NOOP_CHECKER};
use crate::ingest::{ProfileTable, TraceSet};
use crate::micro::{cacr, compute_l1, continuous_coherence, hallucination_rate};
use crate::null_model::{run_null_model, NullPolicyRegistry};
use crate::plausibility::{compute_l2, epi, supplementary_stats};
use crate::report::ReportBuilder;
use crate::theory::{BehavioralTheory, TheoryRegistry};

/// Metric names accepted in the bootstrap settings.
pub const BOOTSTRAP_METRICS: [&str; 5] = [
    "cacr",
    "epi",
    "hallucination_rate",
    "continuous_coherence",
    "rejection_rate",
];

/// Plugin instances for one run.
pub struct ValidationPlugins<'a> {
    pub theory: &'a dyn BehavioralTheory,
    pub checker: &'a dyn HallucinationChecker,
    pub grounding: Option<&'a dyn GroundingStrategy>,
    pub benchmarks: &'a BenchmarkRegistry,
    /// Where the null-model policy is looked up; the built-in policies when unset.
    pub null_policies: Option<&'a NullPolicyRegistry>,
}

impl<'a> ValidationPlugins<'a> {
    /// The registry default theory and the no-op checker; everything else unset.
    pub fn with_defaults(
        theories: &'a TheoryRegistry,
        benchmarks: &'a BenchmarkRegistry,
    ) -> ValidationResult<Self> {
        Ok(Self {
            theory: theories.default_theory()?,
            checker: &NOOP_CHECKER,
            grounding: None,
            benchmarks,
            null_policies: None,
        })
    }
}

pub fn run_metadata(
    config: &ValidationConfig,
    traces: &TraceSet,
    profiles: &ProfileTable,
    plugins: &ValidationPlugins<'_>,
    null_policy: Option<&str>,
) -> RunMetadata {
    RunMetadata {
        run_id: config.run_id.clone(),
        seed: config.seed,
        theory: Some(plugins.theory.name().to_string()),
        grounding: plugins.grounding.map(|grounding| grounding.name().to_string()),
        checker: Some(plugins.checker.name().to_string()),
        null_policy: null_policy.map(str::to_string),
        n_traces: traces.len(),
        n_agents: traces.agent_ids().len(),
        n_profiles: profiles.len(),
        n_traces_without_profile: traces
            .traces()
            .iter()
            .filter(|trace| profiles.get(&trace.agent_id).is_none())
            .count(),
        ingest: traces.summary().clone(),
    }
}

/// Declared action alphabet: entropy policy, then checker vocabulary, then observed actions.
fn declared_actions(
    config: &ValidationConfig,
    traces: &TraceSet,
    checker: &dyn HallucinationChecker,
) -> Vec<String> {
    if !config.entropy.action_space.is_empty() {
        return config.entropy.action_space.clone();
    }
    let vocabulary = checker.vocabulary();
    if !vocabulary.is_empty() {
        return vocabulary;
    }
    traces
        .traces()
        .iter()
        .filter_map(|trace| trace.final_action.known().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn check_bootstrap_metrics(metrics: &[String]) -> ValidationResult<()> {
    match metrics
        .iter()
        .find(|metric| !BOOTSTRAP_METRICS.contains(&metric.as_str()))
    {
        Some(unknown) => Err(ValidationError::Unregistered {
            kind: "bootstrap metric",
            name: unknown.clone(),
        }),
        None => Ok(()),
    }
}

/// Run L1, CGR, L2, the null model, bootstrap intervals and, when probe
/// responses are supplied, L3, then assemble the report.
pub fn run_validation(
    config: &ValidationConfig,
    traces: &TraceSet,
    profiles: &ProfileTable,
    plugins: &ValidationPlugins<'_>,
    probes: Option<&[ProbeResponse]>,
) -> ValidationResult<ValidationReport> {
    if traces.is_empty() {
        return Err(ValidationError::EmptyTraceCollection);
    }
    check_bootstrap_metrics(&config.bootstrap.metrics)?;
    if !config.bootstrap.metrics.is_empty() {
        validate_settings(&config.bootstrap)?;
    }
    info!(
        run_id = %config.run_id,
        traces = traces.len(),
        profiles = profiles.len(),
        theory = plugins.theory.name(),
        "validation run started"
    );

    let rows = traces.traces();
    let l1 = compute_l1(rows, profiles, plugins.theory, plugins.checker, &config.entropy)?;
    let cgr = plugins.grounding.map(|grounding| compute_cgr(rows, grounding));

    let context = BenchmarkContext::new(rows, profiles, &config.benchmark_params);
    let l2 = compute_l2(plugins.benchmarks, &context, config.epi_threshold)?;

    let null_model = if config.null_model.enabled && !plugins.benchmarks.is_empty() {
        let builtin_policies;
        let policies = match plugins.null_policies {
            Some(policies) => policies,
            None => {
                builtin_policies = NullPolicyRegistry::with_builtins()?;
                &builtin_policies
            }
        };
        let policy = policies.build(
            &config.null_model,
            &declared_actions(config, traces, plugins.checker),
        )?;
        Some(run_null_model(
            plugins.benchmarks,
            &context,
            policy.as_ref(),
            config.null_model.trials,
            config.seed,
            config.bootstrap.worker_threads,
        )?)
    } else {
        None
    };

    let mut builder = ReportBuilder::new(run_metadata(
        config,
        traces,
        profiles,
        plugins,
        null_model.as_ref().map(|result| result.policy.as_str()),
    ))
    .l1(l1)
    .l2(l2);
    if let Some(cgr) = cgr {
        builder = builder.cgr(cgr);
    }
    if let Some(null_model) = null_model {
        builder = builder.null_model(null_model);
    }

    for metric in &config.bootstrap.metrics {
        let interval = match metric.as_str() {
            "cacr" => bootstrap_scalar(
                metric,
                rows,
                |sample| cacr(sample, profiles, plugins.theory),
                &config.bootstrap,
                config.seed,
            )?,
            "epi" => bootstrap_scalar(
                metric,
                rows,
                |sample| epi(plugins.benchmarks, &context.with_traces(sample)),
                &config.bootstrap,
                config.seed,
            )?,
            "hallucination_rate" => bootstrap_scalar(
                metric,
                rows,
                |sample| Some(hallucination_rate(sample, plugins.checker).0),
                &config.bootstrap,
                config.seed,
            )?,
            "continuous_coherence" => bootstrap_scalar(
                metric,
                rows,
                |sample| continuous_coherence(sample, profiles, plugins.theory).0,
                &config.bootstrap,
                config.seed,
            )?,
            _ => bootstrap_scalar(
                metric,
                rows,
                |sample| supplementary_stats(sample, profiles).rejection_rate,
                &config.bootstrap,
                config.seed,
            )?,
        };
        builder = builder.interval(interval);
    }

    if let Some(responses) = probes {
        builder = builder.l3(compute_l3(responses, &config.probes)?);
    }
    if profiles.is_empty() {
        warn!("no agent profiles supplied; demographic benchmarks will be uncomputable");
        builder = builder.warning("no agent profiles supplied");
    }
    Ok(builder.build())
}

/// L3 alone: persona probes need no simulation traces.
pub fn run_probe_validation(
    config: &ValidationConfig,
    responses: &[ProbeResponse],
) -> ValidationResult<ValidationReport> {
    let l3 = compute_l3(responses, &config.probes)?;
    let metadata = RunMetadata {
        run_id: config.run_id.clone(),
        seed: config.seed,
        theory: None,
        grounding: None,
        checker: None,
        null_policy: None,
        n_traces: 0,
        n_agents: 0,
        n_profiles: 0,
        n_traces_without_profile: 0,
        ingest: Default::default(),
    };
    Ok(ReportBuilder::new(metadata).l3(l3).build())
}

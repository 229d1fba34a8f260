//! Behavioral validation engine for LLM-driven agent-based models.
//!
//! Three tiers over immutable, in-memory inputs:
//! - L1 micro-metrics per decision ([`micro`]) with construct grounding ([`grounding`]);
//! - L2 population plausibility ([`plausibility`]) with a null-model test ([`null_model`]);
//! - L3 persona-probe reliability ([`cognitive`]).
//!
//! Theories, grounding strategies, constraint checkers, benchmarks, and null
//! policies are capability traits; concrete instances are handed to each
//! computation explicitly. [`pipeline::run_validation`] wires a full run.

pub mod benchmark;
pub mod bootstrap;
pub mod cognitive;
pub mod error;
pub mod grounding;
pub mod hallucination;
pub mod ingest;
pub mod micro;
pub mod null_model;
pub mod pipeline;
pub mod plausibility;
pub mod registry;
pub mod report;
pub mod rng;
pub mod stats;
pub mod theory;

pub use benchmark::{BenchmarkContext, BenchmarkRegistry, MIN_SUPPORT_PARAM};
pub use bootstrap::{bootstrap_ci, bootstrap_scalar, resample_indices};
pub use cognitive::compute_l3;
pub use error::{ValidationError, ValidationResult};
pub use grounding::{compute_cgr, GroundingRegistry, GroundingStrategy, ThresholdGrounding};
pub use hallucination::{CheckerRegistry, ConstraintChecker, HallucinationChecker, NoopChecker};
pub use ingest::{ProfileTable, TraceParser, TraceSet, TraceStream};
pub use micro::{behavioral_entropy, cacr, cacr_decomposition, compute_l1};
pub use null_model::{
    boxed_policy, empirical_p_value, run_null_model, FrequencyMatched, NullPolicy,
    NullPolicyFactory, NullPolicyRegistry, ShuffledLabels, UniformRandom,
};
pub use pipeline::{run_probe_validation, run_validation, ValidationPlugins};
pub use plausibility::{compute_l2, epi};
pub use registry::NamedRegistry;
pub use report::ReportBuilder;
pub use theory::{
    BehavioralTheory, ContinuousCoherence, DiscreteCoherence, RuleTableTheory, TendencyTheory,
    TheoryRegistry,
};

//! Configuration-class failures. Record-level problems are absorbed and counted
//! by the stage that meets them and never surface here.

/// Fatal errors raised before or while wiring a validation run.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("trace collection is empty")]
    EmptyTraceCollection,

    #[error("probe response set is empty")]
    EmptyProbeSet,

    #[error("no {kind} registered under {name:?}")]
    Unregistered { kind: &'static str, name: String },

    #[error("{kind} {name:?} is already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("no default {kind} is registered")]
    NoDefault { kind: &'static str },

    #[error("theory {name:?} does not conform: {reason}")]
    NonConformantTheory { name: String, reason: String },

    #[error("grounding {name:?} is invalid: {reason}")]
    InvalidGrounding { name: String, reason: String },

    #[error("benchmark {name:?} is invalid: {reason}")]
    InvalidBenchmark { name: String, reason: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("duplicate profile for agent {0:?}")]
    DuplicateProfile(String),

    #[error("invalid text pattern for construct {construct:?}: {source}")]
    InvalidPattern {
        construct: String,
        #[source]
        source: regex::Error,
    },
}

pub type ValidationResult<T> = Result<T, ValidationError>;

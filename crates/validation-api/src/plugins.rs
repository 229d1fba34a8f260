use contracts::{OrdinalScale, ValidationConfig};
use validation_core::{
    BenchmarkRegistry, CheckerRegistry, GroundingRegistry, NullPolicyRegistry, TheoryRegistry,
    ValidationPlugins, ValidationResult,
};

/// Every plugin a configuration document declares, built once and borrowed per run.
#[derive(Debug)]
pub struct PluginSet {
    theories: TheoryRegistry,
    groundings: GroundingRegistry,
    checkers: CheckerRegistry,
    benchmarks: BenchmarkRegistry,
    null_policies: NullPolicyRegistry,
}

impl PluginSet {
    pub fn from_config(config: &ValidationConfig) -> ValidationResult<Self> {
        Ok(Self {
            theories: TheoryRegistry::from_configs(
                &config.theories,
                config.default_theory.as_deref(),
            )?,
            groundings: GroundingRegistry::from_configs(&config.groundings)?,
            checkers: CheckerRegistry::from_configs(&config.checkers)?,
            benchmarks: BenchmarkRegistry::from_configs(&config.benchmarks)?,
            null_policies: NullPolicyRegistry::with_builtins()?,
        })
    }

    pub fn benchmarks(&self) -> &BenchmarkRegistry {
        &self.benchmarks
    }

    /// Constructs some theory or grounding strategy reads, with their scales.
    /// Theory dimensions come first, so their scale wins on a shared name.
    pub fn declared_constructs(&self) -> Vec<(String, OrdinalScale)> {
        self.theories
            .dimensions()
            .map(|dimension| (dimension.name.clone(), dimension.scale.clone()))
            .chain(self.groundings.scales())
            .collect()
    }

    /// Plugins named by the run's `theory`, `grounding` and `checker`
    /// selectors, each falling back to its registry default.
    pub fn for_run(&self, config: &ValidationConfig) -> ValidationResult<ValidationPlugins<'_>> {
        Ok(ValidationPlugins {
            theory: self.theories.resolve(config.theory.as_deref())?,
            checker: self.checkers.resolve(config.checker.as_deref())?,
            grounding: self.groundings.resolve(config.grounding.as_deref())?,
            benchmarks: &self.benchmarks,
            null_policies: Some(&self.null_policies),
        })
    }
}

//! In-process facade over the validation engine: configuration loading, disk
//! ingestion, plugin construction, report export, and the SQLite report archive.

mod error;
pub mod export;
pub mod loader;
mod persistence;
mod plugins;

use std::path::Path;

use contracts::{ProbeResponse, ValidationConfig, ValidationReport};
use tracing::{debug, info};
use validation_core::{run_probe_validation, run_validation, ProfileTable, TraceParser, TraceSet};

pub use error::{ApiError, ApiResult};
pub use persistence::{ArchivedReportSummary, SqliteReportStore};
pub use plugins::PluginSet;

/// Environment variable naming the report archive when no path is given.
pub const SQLITE_PATH_ENV: &str = "ABM_VALIDATE_SQLITE_PATH";

pub fn default_sqlite_path() -> String {
    std::env::var(SQLITE_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "abm_validation.sqlite".to_string())
}

#[derive(Debug)]
pub struct ValidationApi {
    config: ValidationConfig,
    parser: TraceParser,
    plugins: PluginSet,
    archive: Option<SqliteReportStore>,
}

impl ValidationApi {
    /// Builds every configured plugin and the trace parser up front, so
    /// configuration errors surface before any data is read. The parser
    /// extracts every construct a theory or grounding strategy declares.
    pub fn from_config(config: ValidationConfig) -> ApiResult<Self> {
        let plugins = PluginSet::from_config(&config)?;
        let parser =
            TraceParser::with_constructs(config.ingest.clone(), plugins.declared_constructs())?;
        debug!(constructs = ?parser.constructs(), "trace parser ready");
        Ok(Self {
            config,
            parser,
            plugins,
            archive: None,
        })
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> ApiResult<Self> {
        Self::from_config(loader::load_config(path)?)
    }

    pub fn attach_sqlite_store(&mut self, path: impl AsRef<Path>) -> ApiResult<()> {
        self.archive = Some(SqliteReportStore::open(path)?);
        Ok(())
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn load_traces(&self, path: impl AsRef<Path>) -> ApiResult<TraceSet> {
        loader::load_traces(path, &self.parser)
    }

    pub fn load_profiles(&self, path: impl AsRef<Path>) -> ApiResult<ProfileTable> {
        loader::load_profiles(path, &self.config.profiles)
    }

    pub fn validate(
        &self,
        traces: &TraceSet,
        profiles: &ProfileTable,
        probes: Option<&[ProbeResponse]>,
    ) -> ApiResult<ValidationReport> {
        let plugins = self.plugins.for_run(&self.config)?;
        Ok(run_validation(&self.config, traces, profiles, &plugins, probes)?)
    }

    /// Full run from disk. Missing profiles run with an empty table.
    pub fn validate_paths(
        &self,
        traces_path: &Path,
        profiles_path: Option<&Path>,
        probes_path: Option<&Path>,
    ) -> ApiResult<ValidationReport> {
        let traces = self.load_traces(traces_path)?;
        let profiles = match profiles_path {
            Some(path) => self.load_profiles(path)?,
            None => ProfileTable::new(),
        };
        let probes = probes_path.map(loader::load_probes).transpose()?;
        let report = self.validate(&traces, &profiles, probes.as_deref())?;
        info!(
            run_id = %report.metadata.run_id,
            warnings = report.warnings.len(),
            "validation run finished"
        );
        Ok(report)
    }

    /// L3 alone from a probe response file.
    pub fn validate_probes(&self, path: impl AsRef<Path>) -> ApiResult<ValidationReport> {
        let responses = loader::load_probes(path)?;
        Ok(run_probe_validation(&self.config, &responses)?)
    }

    pub fn archive_report(&mut self, report: &ValidationReport, replace_existing: bool) -> ApiResult<()> {
        let Some(store) = self.archive.as_mut() else {
            return Err(ApiError::NotAttached);
        };
        store.persist_report(report, replace_existing)?;
        info!(run_id = %report.metadata.run_id, "report archived");
        Ok(())
    }

    pub fn list_reports(&self) -> ApiResult<Vec<ArchivedReportSummary>> {
        let Some(store) = self.archive.as_ref() else {
            return Err(ApiError::NotAttached);
        };
        store.list_reports()
    }

    pub fn load_report(&self, run_id: &str) -> ApiResult<Option<ValidationReport>> {
        let Some(store) = self.archive.as_ref() else {
            return Err(ApiError::NotAttached);
        };
        store.load_report(run_id)
    }
}

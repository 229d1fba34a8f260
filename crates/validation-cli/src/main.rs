use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use contracts::ValidationReport;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use validation_api::{default_sqlite_path, export, ApiError, ValidationApi, SQLITE_PATH_ENV};

#[derive(Parser)]
#[command(name = "abm-validate")]
#[command(about = "Behavioral validation for LLM-driven agent-based models", long_about = None)]
struct Cli {
    /// Debug-level logging; overrides RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run L1, grounding, L2, null model and bootstrap over a trace collection
    Validate {
        /// Validation config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Trace file or directory of *.jsonl files
        #[arg(short, long)]
        traces: PathBuf,

        /// Agent profile table (CSV)
        #[arg(short, long)]
        profiles: Option<PathBuf>,

        /// Persona probe responses (JSONL); adds L3 to the report
        #[arg(long)]
        probes: Option<PathBuf>,

        /// Report JSON output; stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Flat metric,value table
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Archive the report in this SQLite file
        #[arg(long)]
        sqlite: Option<PathBuf>,

        /// Overwrite an archived report with the same run id
        #[arg(long)]
        replace: bool,
    },

    /// Run L3 alone over persona probe responses
    Probe {
        /// Validation config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Persona probe responses (JSONL)
        #[arg(short, long)]
        responses: PathBuf,

        /// Report JSON output; stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List archived reports
    History {
        #[arg(long)]
        sqlite: Option<PathBuf>,
    },

    /// Print one archived report
    Show {
        run_id: String,

        #[arg(long)]
        sqlite: Option<PathBuf>,
    },
}

fn sqlite_path(value: Option<PathBuf>) -> PathBuf {
    value
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(default_sqlite_path()))
}

fn emit_report(report: &ValidationReport, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => export::write_json(report, path)
            .with_context(|| format!("failed to write report to {}", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            serde_json::to_writer_pretty(&mut stdout, report)?;
            writeln!(stdout)?;
            Ok(())
        }
    }
}

fn print_summary(report: &ValidationReport) {
    let metric = |value: Option<f64>| value.map_or_else(|| "undefined".to_string(), |v| format!("{v:.3}"));
    eprintln!(
        "validated run_id={} traces={} cacr={} epi={} p={} warnings={}",
        report.metadata.run_id,
        report.metadata.n_traces,
        metric(report.l1.as_ref().and_then(|l1| l1.cacr)),
        metric(report.l2.as_ref().and_then(|l2| l2.epi)),
        metric(report.null_model.as_ref().and_then(|null| null.p_value)),
        report.warnings.len()
    );
    for warning in &report.warnings {
        eprintln!("  warning: {warning}");
    }
}

#[allow(clippy::too_many_arguments)]
fn run_validate(
    config: &Path,
    traces: &Path,
    profiles: Option<&Path>,
    probes: Option<&Path>,
    out: Option<&Path>,
    csv: Option<&Path>,
    sqlite: Option<PathBuf>,
    replace: bool,
) -> anyhow::Result<()> {
    let mut api = ValidationApi::from_config_file(config)?;
    let report = api.validate_paths(traces, profiles, probes)?;
    emit_report(&report, out)?;
    if let Some(path) = csv {
        export::write_csv(&report, path)?;
    }

    // Archive when a path is given explicitly or through the environment.
    let archive = sqlite.or_else(|| {
        std::env::var_os(SQLITE_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    });
    if let Some(path) = archive {
        api.attach_sqlite_store(&path)
            .with_context(|| format!("failed to attach sqlite store {}", path.display()))?;
        api.archive_report(&report, replace)?;
    }
    print_summary(&report);
    Ok(())
}

fn run_probe(config: &Path, responses: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let api = ValidationApi::from_config_file(config)?;
    let report = api.validate_probes(responses)?;
    emit_report(&report, out)?;
    print_summary(&report);
    Ok(())
}

fn archive_api(sqlite: Option<PathBuf>) -> anyhow::Result<ValidationApi> {
    let path = sqlite_path(sqlite);
    if !path.exists() {
        warn!(path = %path.display(), "report archive does not exist yet; creating it");
    }
    let mut api = ValidationApi::from_config(Default::default())?;
    api.attach_sqlite_store(&path)
        .with_context(|| format!("failed to attach sqlite store {}", path.display()))?;
    Ok(api)
}

fn run_history(sqlite: Option<PathBuf>) -> anyhow::Result<()> {
    let api = archive_api(sqlite)?;
    let metric = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    for summary in api.list_reports()? {
        println!(
            "{}  theory={} traces={} cacr={} epi={} p={} warnings={} archived={}",
            summary.run_id,
            summary.theory.as_deref().unwrap_or("-"),
            summary.n_traces,
            metric(summary.cacr),
            metric(summary.epi),
            metric(summary.p_value),
            summary.warnings,
            summary.archived_at
        );
    }
    Ok(())
}

fn run_show(run_id: &str, sqlite: Option<PathBuf>) -> anyhow::Result<()> {
    let api = archive_api(sqlite)?;
    let report = api
        .load_report(run_id)?
        .with_context(|| format!("no archived report for run {run_id:?}"))?;
    emit_report(&report, None)
}

/// `--verbose` wins over `RUST_LOG`, which wins over the `info` default.
fn log_directives(verbose: bool, rust_log: Option<String>) -> String {
    if verbose {
        return "debug".to_string();
    }
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// 2 for problems with what the caller supplied, 1 for everything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ApiError>() {
        Some(api_err) if api_err.is_usage() => 2,
        _ => 1,
    }
}

fn main() {
    let cli = Cli::parse();

    let directives = log_directives(cli.verbose, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let result = match cli.command {
        Commands::Validate {
            config,
            traces,
            profiles,
            probes,
            out,
            csv,
            sqlite,
            replace,
        } => run_validate(
            &config,
            &traces,
            profiles.as_deref(),
            probes.as_deref(),
            out.as_deref(),
            csv.as_deref(),
            sqlite,
            replace,
        ),
        Commands::Probe {
            config,
            responses,
            out,
        } => run_probe(&config, &responses, out.as_deref()),
        Commands::History { sqlite } => run_history(sqlite),
        Commands::Show { run_id, sqlite } => run_show(&run_id, sqlite),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        process::exit(exit_code(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flag_overrides_rust_log() {
        assert_eq!(log_directives(true, Some("warn".to_string())), "debug");
        assert_eq!(log_directives(false, Some("warn".to_string())), "warn");
        assert_eq!(log_directives(false, Some("  ".to_string())), "info");
        assert_eq!(log_directives(false, None), "info");
    }

    #[test]
    fn usage_errors_exit_with_two() {
        let usage = anyhow::Error::from(ApiError::RunAlreadyExists("r1".to_string()));
        assert_eq!(exit_code(&usage), 2);
        let runtime = anyhow::Error::from(ApiError::NotAttached);
        assert_eq!(exit_code(&runtime), 1);
    }
}

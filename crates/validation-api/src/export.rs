//! Report export: pretty JSON and a flat `metric,value` table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use contracts::ValidationReport;

use crate::error::{ApiError, ApiResult};

pub fn write_json(report: &ValidationReport, path: impl AsRef<Path>) -> ApiResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| ApiError::io(path, err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .map_err(|err| ApiError::io(path, err))
}

/// One row per scalar in the report; undefined values keep their row with an empty value.
pub fn metric_rows(report: &ValidationReport) -> Vec<(String, Option<f64>)> {
    let mut rows: Vec<(String, Option<f64>)> = Vec::new();
    let mut push = |name: String, value: Option<f64>| rows.push((name, value));

    if let Some(l1) = &report.l1 {
        push("l1.cacr".to_string(), l1.cacr);
        push("l1.cacr_raw".to_string(), l1.decomposition.cacr_raw);
        push("l1.cacr_gap".to_string(), l1.decomposition.gap);
        push("l1.continuous_coherence".to_string(), l1.continuous_coherence);
        push("l1.hallucination_rate".to_string(), Some(l1.hallucination_rate));
        push("l1.entropy_normalized".to_string(), l1.entropy.normalized);
        for cell in &l1.decomposition.cells {
            push(format!("l1.cell.{}.cacr", cell.cell), cell.cacr_final);
        }
    }
    if let Some(cgr) = &report.cgr {
        push("cgr.exact_match_rate".to_string(), cgr.exact_match_rate);
        push("cgr.adjacent_match_rate".to_string(), cgr.adjacent_match_rate);
        for construct in &cgr.constructs {
            push(format!("cgr.{}.weighted_kappa", construct.construct), construct.weighted_kappa);
            push(format!("cgr.{}.kappa", construct.construct), construct.kappa);
        }
    }
    if let Some(l2) = &report.l2 {
        push("l2.epi".to_string(), l2.epi);
        push("l2.mean_midpoint_distance".to_string(), l2.mean_midpoint_distance);
        for benchmark in &l2.benchmarks {
            push(format!("l2.benchmark.{}", benchmark.name), benchmark.value);
        }
        push("l2.rejection_rate".to_string(), l2.supplementary.rejection_rate);
        push("l2.rejection_gap".to_string(), l2.supplementary.rejection_gap);
    }
    if let Some(null) = &report.null_model {
        push("null.p_value".to_string(), null.p_value);
        push("null.mean".to_string(), null.null_mean);
        push("null.p95".to_string(), null.null_p95);
    }
    if let Some(l3) = &report.l3 {
        for construct in &l3.constructs {
            push(format!("l3.{}.icc", construct.construct), construct.icc);
            push(format!("l3.{}.eta_squared", construct.construct), construct.eta_squared);
        }
        push("l3.directional_rate".to_string(), l3.directional_rate);
    }
    for interval in &report.bootstrap {
        push(format!("bootstrap.{}.lower", interval.metric), interval.lower);
        push(format!("bootstrap.{}.upper", interval.metric), interval.upper);
    }
    rows
}

pub fn write_metric_table<W: Write>(report: &ValidationReport, out: W) -> ApiResult<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(["metric", "value"])?;
    for (metric, value) in metric_rows(report) {
        let value = value.map(|value| value.to_string()).unwrap_or_default();
        writer.write_record([metric.as_str(), value.as_str()])?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

pub fn write_csv(report: &ValidationReport, path: impl AsRef<Path>) -> ApiResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| ApiError::io(path, err))?;
    write_metric_table(report, BufWriter::new(file))
}

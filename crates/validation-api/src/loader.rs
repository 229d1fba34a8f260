//! Disk readers for configuration, trace directories, profile tables, and probe files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use contracts::{IngestSummary, ProbeResponse, ProfileColumns, ValidationConfig, SCHEMA_VERSION_V1};
use tracing::{debug, info, warn};
use validation_core::{ProfileTable, TraceParser, TraceSet};

use crate::error::{ApiError, ApiResult};

pub fn load_config(path: impl AsRef<Path>) -> ApiResult<ValidationConfig> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| ApiError::io(path, err))?;
    let config: ValidationConfig = serde_json::from_reader(BufReader::new(file))?;
    if config.schema_version != SCHEMA_VERSION_V1 {
        return Err(ApiError::UnsupportedSchema(config.schema_version));
    }
    debug!(path = %path.display(), run_id = %config.run_id, "config loaded");
    Ok(config)
}

/// `*.jsonl` files of a directory in lexical order, or the path itself when it is a file.
pub fn trace_files(path: &Path) -> ApiResult<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| ApiError::io(path, err))? {
        let entry = entry.map_err(|err| ApiError::io(path, err))?;
        let candidate = entry.path();
        if candidate.is_file() && candidate.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(candidate);
        }
    }
    files.sort();
    if files.is_empty() {
        return Err(ApiError::NoTraceFiles(path.to_path_buf()));
    }
    Ok(files)
}

pub fn load_traces(path: impl AsRef<Path>, parser: &TraceParser) -> ApiResult<TraceSet> {
    let path = path.as_ref();
    let files = trace_files(path)?;
    let mut traces = Vec::new();
    let mut summary = IngestSummary::default();
    for file_path in &files {
        let file = File::open(file_path).map_err(|err| ApiError::io(file_path, err))?;
        let mut stream = parser.stream(BufReader::new(file));
        let before = traces.len();
        traces.extend(stream.by_ref());
        let file_summary = stream.finish().map_err(|err| ApiError::io(file_path, err))?;
        debug!(
            file = %file_path.display(),
            traces = traces.len() - before,
            malformed = file_summary.malformed_records,
            "trace file ingested"
        );
        summary.merge(&file_summary);
    }
    info!(
        files = files.len(),
        traces = traces.len(),
        malformed = summary.malformed_records,
        text_recoveries = summary.text_recoveries,
        "traces ingested"
    );
    Ok(TraceSet::new(traces, summary)?)
}

pub fn load_profiles(path: impl AsRef<Path>, columns: &ProfileColumns) -> ApiResult<ProfileTable> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<BTreeMap<String, String>>() {
        rows.push(row?);
    }
    let (table, skipped) = ProfileTable::from_rows(rows, columns)?;
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "profile rows without an agent id were skipped");
    }
    info!(profiles = table.len(), "agent profiles loaded");
    Ok(table)
}

/// Newline-delimited probe responses. Undecodable lines are skipped and counted.
pub fn load_probes(path: impl AsRef<Path>) -> ApiResult<Vec<ProbeResponse>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| ApiError::io(path, err))?;
    let mut responses = Vec::new();
    let mut skipped = 0_usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| ApiError::io(path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProbeResponse>(&line) {
            Ok(response) => responses.push(response),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "undecodable probe responses were skipped");
    }
    info!(responses = responses.len(), "probe responses loaded");
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Extracted, IngestConfig, OrdinalScale};
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create");
        file.write_all(body.as_bytes()).expect("write");
        path
    }

    fn parser() -> TraceParser {
        let mut config = IngestConfig::default();
        config
            .construct_scales
            .insert("threat".to_string(), OrdinalScale::new(["L", "M", "H"]));
        TraceParser::new(config).expect("parser")
    }

    #[test]
    fn trace_directory_is_read_in_lexical_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            dir.path(),
            "b_run.jsonl",
            r#"{"agent_id":"a2","step":1,"proposed_action":"insure","outcome":"approved","constructs":{"threat":"H"}}"#,
        );
        write(
            dir.path(),
            "a_run.jsonl",
            "{\"agent_id\":\"a1\",\"step\":1,\"proposed_action\":\"wait\",\"outcome\":\"approved\",\"constructs\":{\"threat\":\"L\"}}\nnot json\n",
        );
        write(dir.path(), "notes.txt", "ignored");

        let traces = load_traces(dir.path(), &parser()).expect("traces");
        assert_eq!(traces.len(), 2);
        assert_eq!(traces.traces()[0].agent_id, "a1");
        assert_eq!(traces.traces()[1].final_action, Extracted::Known("insure".to_string()));
        assert_eq!(traces.summary().malformed_records, 1);
    }

    #[test]
    fn directory_without_trace_files_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "readme.md", "nothing here");
        assert!(matches!(
            load_traces(dir.path(), &parser()),
            Err(ApiError::NoTraceFiles(_))
        ));
    }

    #[test]
    fn profiles_load_with_covariates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "profiles.csv",
            "agent_id,agent_type,marginalized,zone,income\na1,owner,false,A,52000\na2,renter,yes,B,31000\n,owner,no,A,1\n",
        );
        let profiles = load_profiles(&path, &ProfileColumns::default()).expect("profiles");
        assert_eq!(profiles.len(), 2);
        let renter = profiles.get("a2").expect("a2");
        assert!(renter.marginalized);
        assert_eq!(renter.covariates.get("income"), Some(&31000.0));
    }

    #[test]
    fn probe_lines_skip_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(
            dir.path(),
            "probes.jsonl",
            "{\"persona_id\":\"p1\",\"replicate\":0,\"construct\":\"threat\",\"level\":\"H\"}\n\n{\"persona_id\":1}\n",
        );
        let responses = load_probes(&path).expect("probes");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].persona_id, "p1");
    }

    #[test]
    fn config_with_foreign_schema_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "config.json", r#"{"schema_version":"9.9","run_id":"r"}"#);
        assert!(matches!(load_config(&path), Err(ApiError::UnsupportedSchema(_))));
    }
}

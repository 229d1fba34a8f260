//! Trace and profile ingestion.
//!
//! Records arrive as loosely-structured JSON whose nesting differs between
//! producers. Every logical field is looked up through an ordered list of
//! candidate paths; construct levels additionally fall back to free-text
//! patterns over the agent's reasoning. Anything still missing becomes
//! `Unknown` and is counted in the [`IngestSummary`]; only an empty collection
//! is fatal.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead};

use contracts::{
    ActionLabel, AgentProfile, ConstructLevel, ConstructLevels, DecisionOutcome, Extracted,
    IngestConfig, IngestSummary, OrdinalScale, ProfileColumns, StateMap, Trace,
    UNSPECIFIED_AGENT_TYPE,
};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ValidationError, ValidationResult};

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

/// Resolve a dot-separated path; numeric segments index into arrays.
pub fn lookup_path<'v>(record: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = record;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        current = match current {
            Value::Object(entries) => entries.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// First non-null value among candidate paths.
pub fn first_present<'v>(record: &'v Value, paths: &[String]) -> Option<&'v Value> {
    paths
        .iter()
        .filter_map(|path| lookup_path(record, path))
        .find(|value| !value.is_null())
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn value_as_step(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn value_as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_f64().map(|v| v != 0.0),
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_state(value: &Value) -> Option<StateMap> {
    value.as_object().map(|entries| {
        entries
            .iter()
            .map(|(key, inner)| (key.clone(), inner.clone()))
            .collect()
    })
}

// ---------------------------------------------------------------------------
// TraceParser
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TraceParser {
    config: IngestConfig,
    constructs: Vec<String>,
    patterns: BTreeMap<String, Vec<Regex>>,
}

impl TraceParser {
    pub fn new(config: IngestConfig) -> ValidationResult<Self> {
        let constructs: BTreeSet<String> = config
            .construct_paths
            .keys()
            .chain(config.construct_scales.keys())
            .chain(config.text_patterns.keys())
            .cloned()
            .collect();

        let mut patterns = BTreeMap::new();
        for construct in &constructs {
            let sources: Vec<String> = match config.text_patterns.get(construct) {
                Some(custom) => custom.clone(),
                None if config.construct_scales.contains_key(construct) => {
                    vec![default_text_pattern(construct)]
                }
                None => Vec::new(),
            };
            let compiled = sources
                .iter()
                .map(|source| {
                    Regex::new(source).map_err(|err| ValidationError::InvalidPattern {
                        construct: construct.clone(),
                        source: err,
                    })
                })
                .collect::<ValidationResult<Vec<_>>>()?;
            patterns.insert(construct.clone(), compiled);
        }

        Ok(Self {
            config,
            constructs: constructs.into_iter().collect(),
            patterns,
        })
    }

    /// Parser that also extracts every `declared` construct, each with its
    /// scale and the default candidate paths unless the ingest section
    /// already configures it.
    pub fn with_constructs<I>(mut config: IngestConfig, declared: I) -> ValidationResult<Self>
    where
        I: IntoIterator<Item = (String, OrdinalScale)>,
    {
        for (construct, scale) in declared {
            config.construct_scales.entry(construct).or_insert(scale);
        }
        Self::new(config)
    }

    /// Constructs extracted from every record, in name order.
    pub fn constructs(&self) -> &[String] {
        &self.constructs
    }

    /// Map a surface-form action name to its canonical name.
    pub fn canonical_action(&self, raw: &str) -> (String, bool) {
        let trimmed = raw.trim();
        if let Some(canonical) = self.config.action_aliases.get(trimmed) {
            return (canonical.clone(), true);
        }
        if let Some((_, canonical)) = self
            .config
            .action_aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(trimmed))
        {
            return (canonical.clone(), true);
        }
        (trimmed.to_string(), false)
    }

    /// Parse one line of a record stream. Blank lines are skipped silently;
    /// unparseable lines count as malformed.
    pub fn parse_line(&self, line: &str, summary: &mut IngestSummary) -> Option<Trace> {
        if line.trim().is_empty() {
            return None;
        }
        summary.lines_read += 1;
        match serde_json::from_str::<Value>(line) {
            Ok(record) => self.parse_value(&record, summary),
            Err(err) => {
                debug!(error = %err, "unparseable trace line");
                summary.malformed_records += 1;
                None
            }
        }
    }

    /// Parse one decoded record. Returns `None` only when the record lacks an
    /// agent identifier or a time index, since such a record cannot be joined.
    pub fn parse_value(&self, record: &Value, summary: &mut IngestSummary) -> Option<Trace> {
        let agent_id = first_present(record, &self.config.agent_id_paths).and_then(value_as_text);
        let step = first_present(record, &self.config.step_paths).and_then(value_as_step);
        let (Some(agent_id), Some(step)) = (agent_id, step) else {
            summary.malformed_records += 1;
            return None;
        };

        let outcome = match first_present(record, &self.config.outcome_paths) {
            Some(Value::Bool(approved)) => {
                if *approved {
                    DecisionOutcome::Approved
                } else {
                    DecisionOutcome::Rejected
                }
            }
            Some(value) => value_as_text(value)
                .map(|tag| DecisionOutcome::from_tag(&tag))
                .unwrap_or(DecisionOutcome::Uncertain),
            None => DecisionOutcome::Uncertain,
        };

        let proposed_action = self.extract_action(
            first_present(record, &self.config.proposed_action_paths),
            summary,
        );
        let final_action = match first_present(record, &self.config.final_action_paths) {
            Some(value) => self.extract_action(Some(value), summary),
            None if outcome == DecisionOutcome::Rejected => Extracted::Unknown,
            None => proposed_action.clone(),
        };
        if proposed_action.is_unknown() {
            summary.proposed_action_failures += 1;
        }
        if final_action.is_unknown() {
            summary.final_action_failures += 1;
        }

        let reasoning = first_present(record, &self.config.reasoning_paths).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        });
        let constructs = self.extract_constructs(record, reasoning.as_deref(), summary);

        let trace = Trace {
            agent_id,
            step,
            proposed_action,
            final_action,
            constructs,
            outcome,
            state_before: first_present(record, &self.config.state_before_paths)
                .and_then(value_as_state)
                .unwrap_or_default(),
            state_after: first_present(record, &self.config.state_after_paths)
                .and_then(value_as_state),
            triggered: first_present(record, &self.config.triggered_paths)
                .and_then(value_as_flag),
            agent_type: first_present(record, &self.config.agent_type_paths)
                .and_then(value_as_text),
            reasoning,
        };
        summary.records_parsed += 1;
        Some(trace)
    }

    pub fn stream<R: BufRead>(&self, reader: R) -> TraceStream<'_, R> {
        TraceStream {
            parser: self,
            lines: reader.lines(),
            summary: IngestSummary::default(),
            io_error: None,
        }
    }

    fn extract_action(&self, value: Option<&Value>, summary: &mut IngestSummary) -> ActionLabel {
        let Some(raw) = value.and_then(value_as_text) else {
            return Extracted::Unknown;
        };
        let (canonical, aliased) = self.canonical_action(&raw);
        if aliased {
            summary.alias_hits += 1;
        }
        if canonical.is_empty() {
            Extracted::Unknown
        } else {
            Extracted::Known(canonical)
        }
    }

    fn extract_constructs(
        &self,
        record: &Value,
        reasoning: Option<&str>,
        summary: &mut IngestSummary,
    ) -> ConstructLevels {
        let mut levels = ConstructLevels::new();
        for construct in &self.constructs {
            let scale = self.config.construct_scales.get(construct);
            let from_fields = self
                .candidate_paths(construct)
                .iter()
                .filter_map(|path| lookup_path(record, path))
                .filter_map(value_as_text)
                .map(|raw| normalize_level(scale, &raw))
                .find(|level| !level.is_unknown());

            let level = match from_fields {
                Some(level) => level,
                None => match reasoning.and_then(|text| self.level_from_text(construct, text)) {
                    Some(level) => {
                        summary.text_recoveries += 1;
                        level
                    }
                    None => {
                        *summary
                            .construct_failures
                            .entry(construct.clone())
                            .or_insert(0) += 1;
                        Extracted::Unknown
                    }
                },
            };
            levels.insert(construct.clone(), level);
        }
        levels
    }

    fn candidate_paths(&self, construct: &str) -> Vec<String> {
        match self.config.construct_paths.get(construct) {
            Some(paths) if !paths.is_empty() => paths.clone(),
            _ => vec![format!("constructs.{construct}"), construct.to_string()],
        }
    }

    fn level_from_text(&self, construct: &str, text: &str) -> Option<ConstructLevel> {
        let scale = self.config.construct_scales.get(construct);
        self.patterns.get(construct)?.iter().find_map(|pattern| {
            pattern
                .captures_iter(text)
                .filter_map(|captures| captures.get(1))
                .map(|capture| normalize_level(scale, capture.as_str()))
                .find(|level| !level.is_unknown())
        })
    }
}

fn normalize_level(scale: Option<&OrdinalScale>, raw: &str) -> ConstructLevel {
    match scale {
        Some(scale) => scale.normalize(raw),
        None => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Extracted::Unknown
            } else {
                Extracted::Known(trimmed.to_string())
            }
        }
    }
}

fn default_text_pattern(construct: &str) -> String {
    format!(
        r#"(?i)\b{}\b\s*(?:level|label)?\s*(?:is|was|[:=\-])?\s*["']?([A-Za-z0-9_]+)"#,
        regex::escape(construct)
    )
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Incremental reader over newline-delimited records.
pub struct TraceStream<'p, R> {
    parser: &'p TraceParser,
    lines: io::Lines<R>,
    summary: IngestSummary,
    io_error: Option<io::Error>,
}

impl<R: BufRead> TraceStream<'_, R> {
    pub fn summary(&self) -> &IngestSummary {
        &self.summary
    }

    /// Consume the stream, surfacing any read error that stopped it.
    pub fn finish(self) -> io::Result<IngestSummary> {
        match self.io_error {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }
}

impl<R: BufRead> Iterator for TraceStream<'_, R> {
    type Item = Trace;

    fn next(&mut self) -> Option<Trace> {
        if self.io_error.is_some() {
            return None;
        }
        loop {
            match self.lines.next()? {
                Ok(line) => {
                    if let Some(trace) = self.parser.parse_line(&line, &mut self.summary) {
                        return Some(trace);
                    }
                }
                Err(err) => {
                    self.io_error = Some(err);
                    return None;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TraceSet
// ---------------------------------------------------------------------------

/// Non-empty, immutable trace collection for one simulation run.
#[derive(Debug, Clone)]
pub struct TraceSet {
    traces: Vec<Trace>,
    summary: IngestSummary,
}

impl TraceSet {
    pub fn new(traces: Vec<Trace>, summary: IngestSummary) -> ValidationResult<Self> {
        if traces.is_empty() {
            return Err(ValidationError::EmptyTraceCollection);
        }
        let failures = summary.total_construct_failures();
        if failures > 0 || summary.malformed_records > 0 {
            warn!(
                traces = traces.len(),
                construct_failures = failures,
                malformed_records = summary.malformed_records,
                "trace ingestion degraded"
            );
        }
        Ok(Self { traces, summary })
    }

    /// Wrap already-materialized traces, e.g. from tests or another loader.
    pub fn from_traces(traces: Vec<Trace>) -> ValidationResult<Self> {
        let mut summary = IngestSummary {
            records_parsed: traces.len(),
            ..IngestSummary::default()
        };
        for trace in &traces {
            for (construct, level) in &trace.constructs {
                if level.is_unknown() {
                    *summary
                        .construct_failures
                        .entry(construct.clone())
                        .or_insert(0) += 1;
                }
            }
            if trace.proposed_action.is_unknown() {
                summary.proposed_action_failures += 1;
            }
            if trace.final_action.is_unknown() {
                summary.final_action_failures += 1;
            }
        }
        Self::new(traces, summary)
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    pub fn summary(&self) -> &IngestSummary {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn agent_ids(&self) -> BTreeSet<&str> {
        self.traces
            .iter()
            .map(|trace| trace.agent_id.as_str())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ProfileTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    profiles: BTreeMap<String, AgentProfile>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles<I>(profiles: I) -> ValidationResult<Self>
    where
        I: IntoIterator<Item = AgentProfile>,
    {
        let mut table = Self::new();
        for profile in profiles {
            table.insert(profile)?;
        }
        Ok(table)
    }

    /// Build from header-keyed text rows. Rows without an agent id are skipped
    /// and counted in the returned total.
    pub fn from_rows<I>(rows: I, columns: &ProfileColumns) -> ValidationResult<(Self, usize)>
    where
        I: IntoIterator<Item = BTreeMap<String, String>>,
    {
        let mut table = Self::new();
        let mut skipped = 0;
        for row in rows {
            let Some(agent_id) = row
                .get(&columns.agent_id)
                .map(|raw| raw.trim())
                .filter(|raw| !raw.is_empty())
            else {
                skipped += 1;
                continue;
            };

            let reserved = [
                &columns.agent_id,
                &columns.agent_type,
                &columns.marginalized,
                &columns.zone,
            ];
            let covariates = row
                .iter()
                .filter(|(key, _)| !reserved.contains(key))
                .filter_map(|(key, raw)| {
                    raw.trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|value| value.is_finite())
                        .map(|value| (key.clone(), value))
                })
                .collect();

            table.insert(AgentProfile {
                agent_id: agent_id.to_string(),
                agent_type: row
                    .get(&columns.agent_type)
                    .map(|raw| raw.trim().to_string())
                    .filter(|raw| !raw.is_empty())
                    .unwrap_or_else(|| UNSPECIFIED_AGENT_TYPE.to_string()),
                marginalized: row
                    .get(&columns.marginalized)
                    .and_then(|raw| value_as_flag(&Value::String(raw.clone())))
                    .unwrap_or(false),
                zone: row
                    .get(&columns.zone)
                    .map(|raw| raw.trim().to_string())
                    .filter(|raw| !raw.is_empty()),
                covariates,
            })?;
        }
        Ok((table, skipped))
    }

    pub fn insert(&mut self, profile: AgentProfile) -> ValidationResult<()> {
        if self.profiles.contains_key(&profile.agent_id) {
            return Err(ValidationError::DuplicateProfile(profile.agent_id));
        }
        self.profiles.insert(profile.agent_id.clone(), profile);
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.profiles.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.profiles.values()
    }

    /// Profile type first, then the trace's own tag, then the unspecified marker.
    pub fn agent_type_of<'a>(&'a self, trace: &'a Trace) -> &'a str {
        self.get(&trace.agent_id)
            .map(|profile| profile.agent_type.as_str())
            .or(trace.agent_type.as_deref())
            .unwrap_or(UNSPECIFIED_AGENT_TYPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> TraceParser {
        let mut config = IngestConfig::default();
        let scale = OrdinalScale::new(["VL", "L", "M", "H", "VH"]).with_alias("high", "H");
        config
            .construct_scales
            .insert("threat".to_string(), scale.clone());
        config.construct_scales.insert("coping".to_string(), scale);
        config.construct_paths.insert(
            "threat".to_string(),
            vec![
                "constructs.threat".to_string(),
                "proposal.reasoning.TP_LABEL".to_string(),
            ],
        );
        config
            .action_aliases
            .insert("buy_flood_insurance".to_string(), "insure".to_string());
        TraceParser::new(config).expect("parser")
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let record = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(lookup_path(&record, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(lookup_path(&record, "a.x"), None);
    }

    #[test]
    fn nested_schema_and_aliases_resolve() {
        let parser = parser();
        let mut summary = IngestSummary::default();
        let record = json!({
            "agent_id": "a1",
            "year": 3,
            "proposal": {"action": "Buy_Flood_Insurance", "reasoning": {"TP_LABEL": "vh"}},
            "constructs": {"coping": "high"},
            "outcome": "APPROVED",
            "state_before": {"flooded": true}
        });
        let trace = parser.parse_value(&record, &mut summary).expect("trace");
        assert_eq!(trace.step, 3);
        assert_eq!(trace.proposed_action, Extracted::Known("insure".to_string()));
        assert_eq!(trace.final_action, trace.proposed_action);
        assert_eq!(trace.constructs["threat"], Extracted::Known("VH".to_string()));
        assert_eq!(trace.constructs["coping"], Extracted::Known("H".to_string()));
        assert_eq!(trace.outcome, DecisionOutcome::Approved);
        assert_eq!(summary.alias_hits, 1);
        assert_eq!(summary.total_construct_failures(), 0);
    }

    #[test]
    fn free_text_fallback_then_unknown() {
        let parser = parser();
        let mut summary = IngestSummary::default();
        let record = json!({
            "agent_id": "a2",
            "step": 1,
            "proposed_action": "do_nothing",
            "reasoning": "My threat is high because water rose."
        });
        let trace = parser.parse_value(&record, &mut summary).expect("trace");
        assert_eq!(trace.constructs["threat"], Extracted::Known("H".to_string()));
        assert_eq!(trace.constructs["coping"], Extracted::Unknown);
        assert_eq!(summary.text_recoveries, 1);
        assert_eq!(summary.construct_failures.get("coping"), Some(&1));
    }

    #[test]
    fn rejected_without_final_action_is_unknown() {
        let parser = parser();
        let mut summary = IngestSummary::default();
        let record = json!({
            "agent_id": "a3",
            "step": 2,
            "proposed_action": "relocate",
            "outcome": "rejected"
        });
        let trace = parser.parse_value(&record, &mut summary).expect("trace");
        assert_eq!(trace.final_action, Extracted::Unknown);
        assert_eq!(summary.final_action_failures, 1);
    }

    #[test]
    fn stream_counts_malformed_lines() {
        let parser = parser();
        let input = "{\"agent_id\":\"a\",\"step\":1,\"proposed_action\":\"x\"}\n\nnot json\n{\"step\":2}\n";
        let mut stream = parser.stream(input.as_bytes());
        let traces: Vec<Trace> = stream.by_ref().collect();
        let summary = stream.finish().expect("no io error");
        assert_eq!(traces.len(), 1);
        assert_eq!(summary.lines_read, 3);
        assert_eq!(summary.malformed_records, 2);
        assert_eq!(summary.records_parsed, 1);
    }

    #[test]
    fn empty_trace_set_is_fatal() {
        assert!(matches!(
            TraceSet::new(Vec::new(), IngestSummary::default()),
            Err(ValidationError::EmptyTraceCollection)
        ));
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let mut config = IngestConfig::default();
        config
            .text_patterns
            .insert("threat".to_string(), vec!["(unclosed".to_string()]);
        assert!(matches!(
            TraceParser::new(config),
            Err(ValidationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn profiles_from_rows_keep_covariates_and_reject_duplicates() {
        let columns = ProfileColumns::default();
        let row = |id: &str| {
            BTreeMap::from([
                ("agent_id".to_string(), id.to_string()),
                ("agent_type".to_string(), "owner".to_string()),
                ("marginalized".to_string(), "yes".to_string()),
                ("zone".to_string(), "high_risk".to_string()),
                ("income".to_string(), "42000".to_string()),
            ])
        };
        let (table, skipped) =
            ProfileTable::from_rows(vec![row("a1"), BTreeMap::new()], &columns).expect("table");
        assert_eq!(skipped, 1);
        let profile = table.get("a1").expect("profile");
        assert!(profile.marginalized);
        assert_eq!(profile.zone.as_deref(), Some("high_risk"));
        assert_eq!(profile.covariates.get("income"), Some(&42000.0));

        assert!(matches!(
            ProfileTable::from_rows(vec![row("a1"), row("a1")], &columns),
            Err(ValidationError::DuplicateProfile(_))
        ));
    }

    #[test]
    fn declared_constructs_are_extracted_without_ingest_settings() {
        let mut config = IngestConfig::default();
        config
            .construct_scales
            .insert("coping".to_string(), OrdinalScale::new(["weak", "strong"]));
        let parser = TraceParser::with_constructs(
            config,
            [
                ("threat".to_string(), OrdinalScale::new(["L", "M", "H"])),
                ("coping".to_string(), OrdinalScale::new(["L", "H"])),
            ],
        )
        .expect("parser");
        assert_eq!(parser.constructs(), ["coping".to_string(), "threat".to_string()]);

        let mut summary = IngestSummary::default();
        let reported = parser
            .parse_value(
                &json!({"agent_id": "a1", "step": 0, "proposed_action": "insure",
                        "constructs": {"threat": "h", "coping": "Strong"}}),
                &mut summary,
            )
            .expect("trace");
        assert_eq!(reported.constructs["threat"], Extracted::Known("H".to_string()));
        assert_eq!(reported.constructs["coping"], Extracted::Known("strong".to_string()));

        let silent = parser
            .parse_value(
                &json!({"agent_id": "a2", "step": 0, "proposed_action": "wait"}),
                &mut summary,
            )
            .expect("trace");
        assert!(silent.constructs["threat"].is_unknown());
        assert_eq!(summary.construct_failures.get("threat"), Some(&1));
    }
}

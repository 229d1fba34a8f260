//! Report assembly. Collects finished tier results and run metadata into one
//! [`ValidationReport`]; nothing here computes a metric.

use contracts::{
    BootstrapInterval, CgrResult, EntropyFlag, L1Metrics, L2Metrics, L3Metrics, NullModelResult,
    RunMetadata, ValidationReport,
};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReportBuilder {
    report: ValidationReport,
}

impl ReportBuilder {
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            report: ValidationReport::empty(metadata),
        }
    }

    pub fn l1(mut self, metrics: L1Metrics) -> Self {
        self.report.l1 = Some(metrics);
        self
    }

    pub fn cgr(mut self, result: CgrResult) -> Self {
        self.report.cgr = Some(result);
        self
    }

    pub fn l2(mut self, metrics: L2Metrics) -> Self {
        self.report.l2 = Some(metrics);
        self
    }

    pub fn null_model(mut self, result: NullModelResult) -> Self {
        self.report.null_model = Some(result);
        self
    }

    pub fn l3(mut self, metrics: L3Metrics) -> Self {
        self.report.l3 = Some(metrics);
        self
    }

    pub fn interval(mut self, interval: BootstrapInterval) -> Self {
        self.report.bootstrap.push(interval);
        self
    }

    pub fn warning(mut self, message: impl Into<String>) -> Self {
        self.report.warnings.push(message.into());
        self
    }

    /// Labelled warnings for every flagged or undefined field, then the report.
    pub fn build(mut self) -> ValidationReport {
        let mut flagged = Vec::new();
        let ingest = &self.report.metadata.ingest;
        if ingest.malformed_records > 0 {
            flagged.push(format!("{} malformed trace records skipped", ingest.malformed_records));
        }
        for (construct, failures) in &ingest.construct_failures {
            if *failures > 0 {
                flagged.push(format!("construct {construct}: {failures} extraction failures"));
            }
        }
        if let Some(l1) = &self.report.l1 {
            if l1.cacr.is_none() && l1.n_unknown_constructs > 0 {
                flagged.push(format!(
                    "CACR undefined: {} of {} traces had unknown constructs",
                    l1.n_unknown_constructs, l1.n_traces
                ));
            }
            match l1.entropy.flag {
                EntropyFlag::Healthy => {}
                EntropyFlag::DegenerateLow => flagged.push("behavioral entropy degenerate-low".to_string()),
                EntropyFlag::DegenerateHigh => flagged.push("behavioral entropy degenerate-high".to_string()),
            }
        }
        if let Some(cgr) = &self.report.cgr {
            for construct in cgr.constructs.iter().filter(|entry| entry.trivial_agreement) {
                flagged.push(format!("construct {}: trivial grounding agreement", construct.construct));
            }
        }
        if let Some(l2) = &self.report.l2 {
            if l2.epi.is_none() {
                flagged.push("EPI undefined: no benchmark was computable".to_string());
            } else if l2.n_excluded > 0 {
                flagged.push(format!("{} benchmarks excluded from EPI", l2.n_excluded));
            }
        }
        if let Some(l3) = &self.report.l3 {
            for construct in l3.constructs.iter().filter(|entry| entry.degenerate) {
                flagged.push(format!("construct {}: degenerate probe statistics", construct.construct));
            }
        }
        self.report.warnings.extend(flagged);

        info!(
            run_id = %self.report.metadata.run_id,
            traces = self.report.metadata.n_traces,
            warnings = self.report.warnings.len(),
            "validation report assembled"
        );
        self.report
    }
}

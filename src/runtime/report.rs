/// Run Report: lifecycle record of one pipeline execution
///
/// Created when a run is submitted, moved to RUNNING by the scheduler and finalized
/// exactly once as OK or ERROR. After that every mutation fails with
/// `ReportFinalized`.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Ok,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Ok | RunStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Ok => "OK",
            RunStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one writer produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterOutput {
    pub stage_id: String,
    /// Index of the writer in the pipeline document
    pub position: usize,
    pub items_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// Result of a scheduler pass, successful or not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub stage_counts: BTreeMap<String, u64>,
    pub outputs: Vec<WriterOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    id: String,
    status: RunStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    terminated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_stage: Option<String>,
    /// Items pulled through each stage boundary (writers: items written)
    #[serde(default)]
    stage_counts: BTreeMap<String, u64>,
    #[serde(default)]
    outputs: Vec<WriterOutput>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    /// New PENDING report with a fresh id
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            terminated_at: None,
            message: None,
            result_reference: None,
            failed_stage: None,
            stage_counts: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        self.terminated_at
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn result_reference(&self) -> Option<&str> {
        self.result_reference.as_deref()
    }

    pub fn failed_stage(&self) -> Option<&str> {
        self.failed_stage.as_deref()
    }

    pub fn stage_counts(&self) -> &BTreeMap<String, u64> {
        &self.stage_counts
    }

    pub fn outputs(&self) -> &[WriterOutput] {
        &self.outputs
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `terminated_at - created_at`, once the run has halted
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.terminated_at.map(|t| t - self.created_at)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(PipelineError::ReportFinalized { id: self.id.clone() });
        }
        Ok(())
    }

    /// PENDING → RUNNING
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Finalize as OK; the first writer in document order provides `result_reference`
    pub fn complete(&mut self, outcome: RunOutcome) -> Result<()> {
        self.ensure_open()?;

        let mut outputs = outcome.outputs;
        outputs.sort_by_key(|o| o.position);
        let written: u64 = outputs.iter().map(|o| o.items_written).sum();

        self.result_reference = outputs.iter().find_map(|o| o.artifact.clone());
        self.message = Some(format!(
            "Pipeline completed: {} item(s) written by {} writer(s)",
            written,
            outputs.len()
        ));
        self.stage_counts = outcome.stage_counts;
        self.outputs = outputs;
        self.finish(RunStatus::Ok);
        Ok(())
    }

    /// Finalize as ERROR with the error message and failing stage
    pub fn fail(&mut self, error: &PipelineError, outcome: RunOutcome) -> Result<()> {
        self.ensure_open()?;
        self.message = Some(error.to_string());
        self.failed_stage = error.stage_id().map(String::from);
        self.stage_counts = outcome.stage_counts;
        self.outputs = outcome.outputs;
        self.finish(RunStatus::Error);
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.terminated_at = Some(Utc::now().max(self.created_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stage_id: &str, position: usize, artifact: Option<&str>) -> WriterOutput {
        WriterOutput {
            stage_id: stage_id.to_string(),
            position,
            items_written: 3,
            artifact: artifact.map(String::from),
        }
    }

    #[test]
    fn lifecycle_ok() {
        let mut report = RunReport::new();
        assert_eq!(report.status(), RunStatus::Pending);
        report.start().unwrap();
        assert_eq!(report.status(), RunStatus::Running);

        let outcome = RunOutcome {
            stage_counts: BTreeMap::from([("src".to_string(), 3)]),
            outputs: vec![output("late", 4, Some("b.geojson")), output("early", 2, Some("a.geojson"))],
        };
        report.complete(outcome).unwrap();

        assert_eq!(report.status(), RunStatus::Ok);
        assert_eq!(report.result_reference(), Some("a.geojson"));
        assert!(report.elapsed().unwrap() >= chrono::Duration::zero());
        assert_eq!(report.stage_counts().get("src"), Some(&3));
    }

    #[test]
    fn failure_records_stage_and_message() {
        let mut report = RunReport::new();
        report.start().unwrap();
        let error = PipelineError::StageExecution {
            stage_id: "limit".into(),
            source: anyhow::anyhow!("too many features"),
        };
        report.fail(&error, RunOutcome::default()).unwrap();

        assert_eq!(report.status(), RunStatus::Error);
        assert_eq!(report.failed_stage(), Some("limit"));
        assert!(report.message().unwrap().starts_with("StageExecutionError"));
    }

    #[test]
    fn finalized_report_is_immutable() {
        let mut report = RunReport::new();
        report.complete(RunOutcome::default()).unwrap();
        let terminated = report.terminated_at();

        assert!(matches!(report.start(), Err(PipelineError::ReportFinalized { .. })));
        assert!(report.fail(&PipelineError::Cancelled, RunOutcome::default()).is_err());
        assert_eq!(report.status(), RunStatus::Ok);
        assert_eq!(report.terminated_at(), terminated);
    }

    #[test]
    fn status_serializes_uppercase() {
        let report = RunReport::with_id("run-1");
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], serde_json::json!("PENDING"));
        assert_eq!(value["id"], serde_json::json!("run-1"));
    }
}

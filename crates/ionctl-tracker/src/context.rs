//! [`ExperimentContext`] – the record threaded through requests and data
//! packets so fragments can correlate asynchronous results with a run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ionctl_types::{KernelError, ParamMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a run. Only ever moves forward; the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Created,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Created => "created",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Completed | ExperimentStatus::Failed | ExperimentStatus::Aborted
        )
    }

    fn rank(&self) -> u8 {
        match self {
            ExperimentStatus::Created => 0,
            ExperimentStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// One entry of a context's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub component: Option<String>,
    pub message: String,
}

/// Addressable record of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentContext {
    id: String,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    parameters: ParamMap,
    status: ExperimentStatus,
    phase: String,
    completed_phases: Vec<String>,
    results: BTreeMap<String, Value>,
    errors: Vec<ErrorRecord>,
}

impl ExperimentContext {
    /// New context in `created` status with a fresh UUID.
    pub fn new(parameters: ParamMap) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parameters,
            status: ExperimentStatus::Created,
            phase: "init".to_string(),
            completed_phases: Vec::new(),
            results: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn parameters(&self) -> &ParamMap {
        &self.parameters
    }

    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn completed_phases(&self) -> &[String] {
        &self.completed_phases
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidTransition`] for backward moves or any move out
    /// of a terminal status.
    pub fn transition(&mut self, next: ExperimentStatus) -> Result<(), KernelError> {
        if !self.status.can_transition_to(next) {
            return Err(KernelError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        let now = Utc::now();
        if next == ExperimentStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), KernelError> {
        self.transition(ExperimentStatus::Running)?;
        self.set_phase("running");
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), KernelError> {
        self.transition(ExperimentStatus::Completed)?;
        self.set_phase("completed");
        Ok(())
    }

    /// Terminal failure; `message` is also appended to the error log.
    pub fn fail(&mut self, message: impl Into<String>, component: Option<&str>) -> Result<(), KernelError> {
        self.transition(ExperimentStatus::Failed)?;
        self.add_error(message, component);
        self.set_phase("failed");
        Ok(())
    }

    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), KernelError> {
        self.transition(ExperimentStatus::Aborted)?;
        self.add_error(reason, None);
        self.set_phase("aborted");
        Ok(())
    }

    /// Enter `phase`; the previous phase is appended to the completed log.
    pub fn set_phase(&mut self, phase: impl Into<String>) {
        let phase = phase.into();
        if phase == self.phase {
            return;
        }
        let previous = std::mem::replace(&mut self.phase, phase);
        self.completed_phases.push(previous);
    }

    pub fn add_result(&mut self, component: impl Into<String>, data: Value) {
        self.results.insert(component.into(), data);
    }

    pub fn add_error(&mut self, message: impl Into<String>, component: Option<&str>) {
        self.errors.push(ErrorRecord {
            timestamp: Utc::now(),
            phase: self.phase.clone(),
            component: component.map(str::to_string),
            message: message.into(),
        });
    }

    /// Wall-clock run time, once started.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - start)
    }

    /// JSON summary used in status replies.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "exp_id": self.id,
            "parent_id": self.parent_id,
            "status": self.status,
            "phase": self.phase,
            "completed_phases": self.completed_phases,
            "created_at": self.created_at,
            "started_at": self.started_at,
            "completed_at": self.completed_at,
            "duration_s": self.duration().map(|d| d.num_milliseconds() as f64 / 1000.0),
            "parameters": self.parameters,
            "results": self.results,
            "errors": self.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionctl_types::ParamValue;

    fn ctx() -> ExperimentContext {
        let mut p = ParamMap::new();
        p.insert("scan_points".into(), ParamValue::Number(21.0));
        ExperimentContext::new(p)
    }

    #[test]
    fn new_context_is_created_with_unique_id() {
        let a = ctx();
        let b = ctx();
        assert_eq!(a.status(), ExperimentStatus::Created);
        assert_ne!(a.id(), b.id());
        assert!(a.started_at().is_none());
    }

    #[test]
    fn lifecycle_moves_forward_and_stamps_times() {
        let mut c = ctx();
        c.start().unwrap();
        assert_eq!(c.status(), ExperimentStatus::Running);
        assert!(c.started_at().is_some());
        c.complete().unwrap();
        assert!(c.is_terminal());
        assert!(c.completed_at().is_some());
        assert!(c.duration().is_some());
    }

    #[test]
    fn terminal_status_cannot_move_back() {
        let mut c = ctx();
        c.start().unwrap();
        c.abort("operator STOP").unwrap();
        assert!(c.transition(ExperimentStatus::Running).is_err());
        assert!(c.transition(ExperimentStatus::Created).is_err());
        assert!(c.complete().is_err());
        assert_eq!(c.status(), ExperimentStatus::Aborted);
    }

    #[test]
    fn running_cannot_return_to_created() {
        let mut c = ctx();
        c.start().unwrap();
        let err = c.transition(ExperimentStatus::Created).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[test]
    fn created_may_fail_directly() {
        let mut c = ctx();
        c.fail("worker offline", Some("dds")).unwrap();
        assert_eq!(c.status(), ExperimentStatus::Failed);
        assert_eq!(c.errors()[0].component.as_deref(), Some("dds"));
    }

    #[test]
    fn phase_changes_are_logged() {
        let mut c = ctx();
        c.set_phase("cooling");
        c.set_phase("cooling");
        c.set_phase("detection");
        assert_eq!(c.phase(), "detection");
        assert_eq!(c.completed_phases(), &["init".to_string(), "cooling".to_string()]);
    }

    #[test]
    fn errors_record_current_phase() {
        let mut c = ctx();
        c.set_phase("sweep");
        c.add_error("timeout", None);
        assert_eq!(c.errors()[0].phase, "sweep");
    }

    #[test]
    fn summary_contains_results() {
        let mut c = ctx().with_parent("parent-1");
        c.add_result("pmt", serde_json::json!({"counts": [1, 2, 3]}));
        let s = c.summary();
        assert_eq!(s["parent_id"], "parent-1");
        assert_eq!(s["status"], "created");
        assert_eq!(s["results"]["pmt"]["counts"][2], 3);
    }
}

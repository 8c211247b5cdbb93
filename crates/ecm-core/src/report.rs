//! Migration report
//!
//! Structured per-instance results of a run. The audit tags remain the
//! durable record; the report is what the caller gets back in-process.

use crate::replacement::ReplacementPhase;
use crate::types::AuditStatus;
use serde::{Deserialize, Serialize};

/// Final result of one instance in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Source instance id
    pub instance_id: String,
    /// Terminal audit status
    pub status: AuditStatus,
    /// Audit message written with the status
    pub message: String,
    /// Replacement instance, if one was launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_id: Option<String>,
    /// Phase that failed, for failed replacements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<ReplacementPhase>,
    /// Pre-migration snapshots taken
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
    /// Whether retrying the instance might succeed
    #[serde(default)]
    pub retryable: bool,
}

impl TaskOutcome {
    /// Create outcome with no replacement details
    #[must_use]
    pub fn new(instance_id: impl Into<String>, status: AuditStatus, message: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            message: message.into(),
            replacement_id: None,
            failed_phase: None,
            snapshots: Vec::new(),
            retryable: false,
        }
    }
}

/// Outcomes of a whole run, sorted by instance id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl MigrationReport {
    /// Build report from outcomes in any order
    #[must_use]
    pub fn from_outcomes(mut outcomes: Vec<TaskOutcome>) -> Self {
        outcomes.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Self { outcomes }
    }

    /// Number of instances with `status`
    #[must_use]
    pub fn count(&self, status: AuditStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Completed migrations
    #[inline]
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(AuditStatus::Completed)
    }

    /// Failed migrations
    #[inline]
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(AuditStatus::Failed)
    }

    /// Migrations that succeeded with a warning
    #[inline]
    #[must_use]
    pub fn warnings(&self) -> usize {
        self.count(AuditStatus::Warning)
    }

    /// Instances skipped by the criteria
    #[inline]
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(AuditStatus::Skipped)
    }

    /// Check if nothing was selected
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Outcome for one source instance
    #[must_use]
    pub fn outcome(&self, instance_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.instance_id == instance_id)
    }

    /// Human-readable summary, one line per instance
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = format!(
            "Migration Report: {} completed, {} warning, {} failed, {} skipped\n",
            self.completed(),
            self.warnings(),
            self.failed(),
            self.skipped()
        );
        for outcome in &self.outcomes {
            out.push_str(&format!("  {:<20} {:<12}", outcome.instance_id, outcome.status.as_str()));
            if let Some(replacement) = &outcome.replacement_id {
                out.push_str(&format!(" -> {replacement}"));
            }
            out.push_str(&format!(" {}\n", outcome.message));
        }
        out
    }
}

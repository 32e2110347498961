use crate::report::{Report, ReportKey};
use crate::store::ReportSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    #[default]
    Draft,
    Submitted,
    Published,
}

impl PublicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PublicationStatus::Draft => "draft",
            PublicationStatus::Submitted => "submitted",
            PublicationStatus::Published => "published",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(PublicationStatus::Draft),
            "submitted" => Some(PublicationStatus::Submitted),
            "published" => Some(PublicationStatus::Published),
            _ => None,
        }
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationAction {
    Submit,
    Publish,
    Unpublish,
    Reject,
}

impl PublicationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PublicationAction::Submit => "submit",
            PublicationAction::Publish => "publish",
            PublicationAction::Unpublish => "unpublish",
            PublicationAction::Reject => "reject",
        }
    }
}

impl fmt::Display for PublicationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} a {from} report: {reason}")]
pub struct InvalidTransitionError {
    pub from: PublicationStatus,
    pub action: PublicationAction,
    pub reason: &'static str,
}

/// Status reached by applying `action` to a report in `from` holding
/// `record_count` academic records.
pub fn next_status(
    from: PublicationStatus,
    action: PublicationAction,
    record_count: usize,
) -> Result<PublicationStatus, InvalidTransitionError> {
    use PublicationAction as A;
    use PublicationStatus as S;
    match (from, action) {
        (S::Draft, A::Submit) if record_count == 0 => Err(InvalidTransitionError {
            from,
            action,
            reason: "report has no academic records",
        }),
        (S::Draft, A::Submit) => Ok(S::Submitted),
        (S::Submitted, A::Publish) => Ok(S::Published),
        (S::Published, A::Unpublish) => Ok(S::Submitted),
        (S::Submitted, A::Reject) => Ok(S::Draft),
        _ => Err(InvalidTransitionError {
            from,
            action,
            reason: "transition not allowed",
        }),
    }
}

impl Report {
    pub fn apply(
        &mut self,
        action: PublicationAction,
    ) -> Result<PublicationStatus, InvalidTransitionError> {
        let next = next_status(self.status, action, self.academic_records.len())?;
        self.status = next;
        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
    Student,
    Inspector,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "parent" => Some(Role::Parent),
            "student" => Some(Role::Student),
            "inspector" => Some(Role::Inspector),
            _ => None,
        }
    }

    /// Teachers send reports for review; everything past that is an
    /// administrator decision.
    pub fn may(self, action: PublicationAction) -> bool {
        match self {
            Role::Admin => true,
            Role::Teacher => action == PublicationAction::Submit,
            Role::Parent | Role::Student | Role::Inspector => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedReport {
    #[serde(flatten)]
    pub key: ReportKey,
    pub status: PublicationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedReport {
    #[serde(flatten)]
    pub key: ReportKey,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPublishOutcome {
    pub succeeded: Vec<ReportKey>,
    pub skipped: Vec<SkippedReport>,
    pub failed: Vec<FailedReport>,
}

impl BulkPublishOutcome {
    pub fn applied_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Publish every submitted report in memory. Reports in any other state are
/// skipped and left untouched.
pub fn publish_all(reports: &mut [Report]) -> BulkPublishOutcome {
    let mut outcome = BulkPublishOutcome::default();
    for report in reports.iter_mut() {
        if report.status != PublicationStatus::Submitted {
            outcome.skipped.push(SkippedReport {
                key: report.key.clone(),
                status: report.status,
            });
            continue;
        }
        match report.apply(PublicationAction::Publish) {
            Ok(_) => outcome.succeeded.push(report.key.clone()),
            Err(e) => outcome.failed.push(FailedReport {
                key: report.key.clone(),
                error: e.to_string(),
            }),
        }
    }
    outcome
}

/// Like [`publish_all`], persisting each status change through `sink`. Every
/// report is written independently; a failed write leaves that report's
/// in-memory status unchanged and does not stop the others.
pub fn publish_all_with<S: ReportSink + ?Sized>(
    reports: &mut [Report],
    sink: &S,
) -> BulkPublishOutcome {
    let mut outcome = BulkPublishOutcome::default();
    for report in reports.iter_mut() {
        if report.status != PublicationStatus::Submitted {
            outcome.skipped.push(SkippedReport {
                key: report.key.clone(),
                status: report.status,
            });
            continue;
        }
        let next = match next_status(
            report.status,
            PublicationAction::Publish,
            report.academic_records.len(),
        ) {
            Ok(v) => v,
            Err(e) => {
                outcome.failed.push(FailedReport {
                    key: report.key.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        match sink.set_report_status(&report.key, next) {
            Ok(()) => {
                report.status = next;
                outcome.succeeded.push(report.key.clone());
            }
            Err(e) => {
                tracing::warn!(report = %report.key, error = %e, "failed to persist published status");
                outcome.failed.push(FailedReport {
                    key: report.key.clone(),
                    error: format!("{e:#}"),
                });
            }
        }
    }
    outcome
}

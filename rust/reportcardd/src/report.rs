use crate::calc::{aggregate_subject_records, ComponentScore, GradingConfig, SubjectRecord};
use crate::publication::PublicationStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const NO_COMMENT: &str = "No comment yet.";
pub const NO_RANK: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} is required")]
pub struct ValidationError {
    pub field: &'static str,
}

/// Identity of a report card: one per student, term and session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportKey {
    pub student_id: String,
    pub term: String,
    pub session: String,
}

impl ReportKey {
    pub fn new(student_id: &str, term: &str, session: &str) -> Result<Self, ValidationError> {
        let required = |field: &'static str, v: &str| {
            let t = v.trim();
            if t.is_empty() {
                Err(ValidationError { field })
            } else {
                Ok(t.to_string())
            }
        };
        Ok(Self {
            student_id: required("studentId", student_id)?,
            term: required("term", term)?,
            session: required("session", session)?,
        })
    }

    pub fn matches(&self, score: &ComponentScore) -> bool {
        score.student_id.trim() == self.student_id
            && score.term.trim() == self.term
            && score.session.trim() == self.session
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.student_id, self.session, self.term)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendance {
    pub present: u32,
    pub absent: u32,
    pub late: u32,
    pub total: u32,
}

/// Rating per domain, e.g. "Punctuality" -> "4".
pub type Ratings = BTreeMap<String, String>;

/// Report content that is entered by hand rather than derived from scores.
/// Every field is optional; absent fields fall back to report defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PublicationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance: Option<Attendance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Ratings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psychomotor: Option<Ratings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_students: Option<String>,
}

impl ReportMeta {
    /// Overlay `patch` onto `self`. Ratings merge per domain; an empty rating
    /// string removes that domain.
    pub fn merge(&mut self, patch: ReportMeta) {
        if patch.status.is_some() {
            self.status = patch.status;
        }
        if patch.attendance.is_some() {
            self.attendance = patch.attendance;
        }
        merge_ratings(&mut self.skills, patch.skills);
        merge_ratings(&mut self.psychomotor, patch.psychomotor);
        if patch.teacher_comment.is_some() {
            self.teacher_comment = patch.teacher_comment;
        }
        if patch.principal_comment.is_some() {
            self.principal_comment = patch.principal_comment;
        }
        if patch.position.is_some() {
            self.position = patch.position;
        }
        if patch.total_students.is_some() {
            self.total_students = patch.total_students;
        }
    }
}

fn merge_ratings(current: &mut Option<Ratings>, patch: Option<Ratings>) {
    let Some(patch) = patch else { return };
    let target = current.get_or_insert_with(Ratings::new);
    for (domain, rating) in patch {
        let domain = domain.trim().to_string();
        if domain.is_empty() {
            continue;
        }
        let rating = rating.trim().to_string();
        if rating.is_empty() {
            target.remove(&domain);
        } else {
            target.insert(domain, rating);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(flatten)]
    pub key: ReportKey,
    pub status: PublicationStatus,
    pub academic_records: Vec<SubjectRecord>,
    pub attendance: Attendance,
    pub skills: Ratings,
    pub psychomotor: Ratings,
    pub teacher_comment: String,
    pub principal_comment: String,
    pub position: String,
    pub total_students: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CompileInput<'a> {
    pub student_id: &'a str,
    pub term: &'a str,
    pub session: &'a str,
    pub scores: &'a [ComponentScore],
    pub subjects_master: &'a [String],
    pub meta: Option<&'a ReportMeta>,
}

fn text_or(v: Option<&String>, default: &str) -> String {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Build a report from source scores. Academic records are always recomputed;
/// scores belonging to another student, term or session are ignored.
pub fn compile_report(
    input: CompileInput<'_>,
    config: &GradingConfig,
) -> Result<Report, ValidationError> {
    let key = ReportKey::new(input.student_id, input.term, input.session)?;

    let own_scores: Vec<ComponentScore> = input
        .scores
        .iter()
        .filter(|s| key.matches(s))
        .cloned()
        .collect();
    let academic_records = aggregate_subject_records(&own_scores, input.subjects_master, config);

    let meta = input.meta.cloned().unwrap_or_default();
    Ok(Report {
        status: meta.status.unwrap_or_default(),
        academic_records,
        attendance: meta.attendance.unwrap_or_default(),
        skills: meta.skills.clone().unwrap_or_default(),
        psychomotor: meta.psychomotor.clone().unwrap_or_default(),
        teacher_comment: text_or(meta.teacher_comment.as_ref(), NO_COMMENT),
        principal_comment: text_or(meta.principal_comment.as_ref(), NO_COMMENT),
        position: text_or(meta.position.as_ref(), NO_RANK),
        total_students: text_or(meta.total_students.as_ref(), NO_RANK),
        key,
    })
}

use crate::calc::RawScore;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::publication::{InvalidTransitionError, Role};
use crate::report::{Attendance, Ratings, ReportMeta, ValidationError};
use rusqlite::Connection;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ValidationError> for HandlerErr {
    fn from(e: ValidationError) -> Self {
        HandlerErr::new("validation_failed", e.to_string())
            .with_details(json!({ "field": e.field }))
    }
}

impl From<InvalidTransitionError> for HandlerErr {
    fn from(e: InvalidTransitionError) -> Self {
        HandlerErr::new("invalid_transition", e.to_string()).with_details(json!({
            "from": e.from.as_str(),
            "action": e.action.as_str(),
        }))
    }
}

/// Map a plumbing error onto a fixed envelope code.
pub fn db_failed(code: &'static str) -> impl Fn(anyhow::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, format!("{e:#}"))
}

/// Run a fallible handler body and wrap its outcome in the response envelope.
pub fn respond(req: &Request, body: impl FnOnce() -> Result<Value, HandlerErr>) -> Value {
    match body() {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// First value present under any of `keys`. Older screens send snake_case or
/// abbreviated field names; this is the one place they are reconciled.
pub fn field<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

pub const STUDENT_ID_KEYS: &[&str] = &["studentId", "student_id"];
pub const CLASS_ID_KEYS: &[&str] = &["classId", "class_id"];
pub const SUBJECT_KEYS: &[&str] = &["subject", "subjectName", "subject_name"];
pub const TERM_KEYS: &[&str] = &["term"];
pub const SESSION_KEYS: &[&str] = &["session", "academicSession", "academic_session"];
pub const CA_KEYS: &[&str] = &[
    "ca",
    "continuousAssessment",
    "continuous_assessment",
    "caScore",
    "ca_score",
];
pub const EXAM_KEYS: &[&str] = &["exam", "examScore", "exam_score"];

/// Trimmed string under any of `keys`; blank counts as absent.
pub fn text_field(obj: &Value, keys: &[&str]) -> Option<String> {
    field(obj, keys)
        .and_then(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
}

pub fn required_text(obj: &Value, keys: &[&str]) -> Result<String, HandlerErr> {
    text_field(obj, keys).ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", keys[0])))
}

pub fn raw_score(obj: &Value, keys: &[&str]) -> RawScore {
    field(obj, keys).map(RawScore::from).unwrap_or(RawScore::Missing)
}

pub fn parse_role(params: &Value) -> Result<Role, HandlerErr> {
    let raw = required_text(params, &["actorRole", "actor_role", "role"])?;
    Role::parse(&raw).ok_or_else(|| {
        HandlerErr::new(
            "bad_params",
            "actorRole must be one of: admin, teacher, parent, student, inspector",
        )
        .with_details(json!({ "actorRole": raw }))
    })
}

fn count_field(obj: &Value, keys: &[&str]) -> Result<u32, HandlerErr> {
    match field(obj, keys) {
        None => Ok(0),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                HandlerErr::new(
                    "bad_params",
                    format!("attendance.{} must be a non-negative integer", keys[0]),
                )
            }),
    }
}

fn ratings_field(obj: &Value, keys: &[&str]) -> Result<Option<Ratings>, HandlerErr> {
    let Some(v) = field(obj, keys) else {
        return Ok(None);
    };
    let Some(map) = v.as_object() else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must be an object of domain -> rating", keys[0]),
        ));
    };
    let mut out = Ratings::new();
    for (domain, rating) in map {
        let rating = match rating {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("{}.{} must be a string or number", keys[0], domain),
                ))
            }
        };
        out.insert(domain.clone(), rating);
    }
    Ok(Some(out))
}

/// Parse hand-entered report content. Ranks may arrive as numbers.
pub fn read_report_meta(obj: &Value) -> Result<ReportMeta, HandlerErr> {
    if !obj.is_object() {
        return Err(HandlerErr::new("bad_params", "meta must be an object"));
    }
    let attendance = match field(obj, &["attendance"]) {
        None => None,
        Some(a) if a.is_object() => Some(Attendance {
            present: count_field(a, &["present"])?,
            absent: count_field(a, &["absent"])?,
            late: count_field(a, &["late"])?,
            total: count_field(a, &["total"])?,
        }),
        Some(_) => return Err(HandlerErr::new("bad_params", "attendance must be an object")),
    };
    let comment = |keys: &[&str]| -> Option<String> {
        field(obj, keys).and_then(|v| v.as_str()).map(|s| s.to_string())
    };
    Ok(ReportMeta {
        status: None,
        attendance,
        skills: ratings_field(obj, &["skills", "affective", "behaviour", "behavior"])?,
        psychomotor: ratings_field(obj, &["psychomotor"])?,
        teacher_comment: comment(&["teacherComment", "teacher_comment"]),
        principal_comment: comment(&["principalComment", "principal_comment"]),
        position: text_field(obj, &["position"]),
        total_students: text_field(obj, &["totalStudents", "total_students"]),
    })
}

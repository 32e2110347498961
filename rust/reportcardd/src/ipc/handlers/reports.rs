use crate::calc::{summarize_records, GradeLetter, GradingConfig};
use crate::ipc::handlers::setup::load_grading_config;
use crate::ipc::helpers::{
    db_conn, db_failed, read_report_meta, required_text, respond, text_field, HandlerErr,
    CLASS_ID_KEYS, SESSION_KEYS, STUDENT_ID_KEYS, TERM_KEYS,
};
use crate::ipc::types::{AppState, Request};
use crate::publication::PublicationStatus;
use crate::report::{compile_report, CompileInput, Report, ReportKey};
use crate::store::{ScoreSource, SqliteStore, SubjectSource};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Key fields as sent; blanks surface as `validation_failed`, not `bad_params`.
pub(crate) fn report_key(params: &Value) -> Result<ReportKey, HandlerErr> {
    let get = |keys: &[&str]| text_field(params, keys).unwrap_or_default();
    Ok(ReportKey::new(
        &get(STUDENT_ID_KEYS),
        &get(TERM_KEYS),
        &get(SESSION_KEYS),
    )?)
}

/// Compile the stored report for `key` against its class subject list.
pub(crate) fn load_report(
    store: &SqliteStore<'_>,
    key: &ReportKey,
    config: &GradingConfig,
) -> Result<Report, HandlerErr> {
    let student = store
        .student(&key.student_id)
        .map_err(db_failed("db_query_failed"))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": key.student_id }))
        })?;
    let master = store
        .list_subjects_for_class(&student.class_id)
        .map_err(db_failed("db_query_failed"))?;
    let scores = store
        .fetch_scores(
            std::slice::from_ref(&key.student_id),
            None,
            &key.term,
            &key.session,
        )
        .map_err(db_failed("db_query_failed"))?;
    let meta = store
        .load_report_meta(key)
        .map_err(db_failed("db_query_failed"))?;
    Ok(compile_report(
        CompileInput {
            student_id: &key.student_id,
            term: &key.term,
            session: &key.session,
            scores: &scores,
            subjects_master: &master,
            meta: meta.as_ref(),
        },
        config,
    )?)
}

pub(crate) fn report_json(store: &SqliteStore<'_>, report: &Report) -> Result<Value, HandlerErr> {
    let report_id = store
        .report_id(&report.key)
        .map_err(db_failed("db_query_failed"))?;
    Ok(json!({
        "reportId": report_id,
        "report": report,
        "summary": summarize_records(&report.academic_records),
    }))
}

fn handle_reports_compile(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let key = report_key(&req.params)?;
        let store = SqliteStore::new(conn);
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let report = load_report(&store, &key, &config)?;
        report_json(&store, &report)
    })
}

fn handle_reports_update_meta(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let key = report_key(&req.params)?;
        let Some(meta_raw) = req.params.get("meta") else {
            return Err(HandlerErr::new("bad_params", "missing meta"));
        };
        let patch = read_report_meta(meta_raw)?;

        let store = SqliteStore::new(conn);
        if store
            .student(&key.student_id)
            .map_err(db_failed("db_query_failed"))?
            .is_none()
        {
            return Err(HandlerErr::new("not_found", "student not found"));
        }
        let mut meta = store
            .load_report_meta(&key)
            .map_err(db_failed("db_query_failed"))?
            .unwrap_or_default();
        meta.merge(patch);
        store
            .save_report_meta(&key, &meta)
            .map_err(db_failed("db_update_failed"))?;
        tracing::info!(report = %key, "report content updated");

        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let report = load_report(&store, &key, &config)?;
        report_json(&store, &report)
    })
}

fn handle_reports_class_summary(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let term = required_text(&req.params, TERM_KEYS)?;
        let session = required_text(&req.params, SESSION_KEYS)?;

        let store = SqliteStore::new(conn);
        if !store.class_exists(&class_id).map_err(db_failed("db_query_failed"))? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let students = store
            .students_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;

        let mut status_counts: BTreeMap<&'static str, usize> = [
            PublicationStatus::Draft,
            PublicationStatus::Submitted,
            PublicationStatus::Published,
        ]
        .into_iter()
        .map(|s| (s.as_str(), 0))
        .collect();
        let mut rows = Vec::with_capacity(students.len());
        for student in students.iter().filter(|s| s.active) {
            let key = ReportKey::new(&student.id, &term, &session)?;
            let report = load_report(&store, &key, &config)?;
            let summary = summarize_records(&report.academic_records);
            let failed = report
                .academic_records
                .iter()
                .filter(|r| r.grade == GradeLetter::F)
                .count();
            *status_counts.entry(report.status.as_str()).or_default() += 1;
            rows.push(json!({
                "studentId": student.id,
                "displayName": student.display_name,
                "status": report.status,
                "subjectCount": summary.subject_count,
                "grandTotal": summary.grand_total,
                "average": summary.average,
                "failedSubjects": failed,
                "position": report.position,
            }));
        }
        Ok(json!({
            "classId": class_id,
            "term": term,
            "session": session,
            "students": rows,
            "statusCounts": status_counts,
        }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.compile" => Some(handle_reports_compile(state, req)),
        "reports.updateMeta" => Some(handle_reports_update_meta(state, req)),
        "reports.classSummary" => Some(handle_reports_class_summary(state, req)),
        _ => None,
    }
}

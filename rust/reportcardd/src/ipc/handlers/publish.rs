use crate::ipc::handlers::reports::{load_report, report_json, report_key};
use crate::ipc::handlers::setup::load_grading_config;
use crate::ipc::helpers::{
    db_conn, db_failed, parse_role, required_text, respond, HandlerErr, CLASS_ID_KEYS,
    SESSION_KEYS, TERM_KEYS,
};
use crate::ipc::types::{AppState, Request};
use crate::publication::{publish_all, publish_all_with, PublicationAction, Role};
use crate::report::ReportKey;
use crate::store::{ReportSink, SqliteStore};
use serde_json::{json, Value};

fn forbidden(role: Role, action: PublicationAction) -> HandlerErr {
    HandlerErr::new(
        "forbidden",
        format!("{:?} may not {} reports", role, action).to_lowercase(),
    )
    .with_details(json!({ "actorRole": role, "action": action }))
}

fn handle_transition(state: &mut AppState, req: &Request, action: PublicationAction) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let role = parse_role(&req.params)?;
        if !role.may(action) {
            return Err(forbidden(role, action));
        }
        let key = report_key(&req.params)?;

        let store = SqliteStore::new(conn);
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let mut report = load_report(&store, &key, &config)?;
        let from = report.status;
        let to = report.apply(action)?;
        store
            .set_report_status(&key, to)
            .map_err(db_failed("db_update_failed"))?;
        tracing::info!(report = %key, %from, %to, role = ?role, "report status changed");
        report_json(&store, &report)
    })
}

fn handle_publish_all(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let role = parse_role(&req.params)?;
        if !role.may(PublicationAction::Publish) {
            return Err(forbidden(role, PublicationAction::Publish));
        }
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
        let mut reports = Vec::with_capacity(students.len());
        for student in students.iter().filter(|s| s.active) {
            let key = ReportKey::new(&student.id, &term, &session)?;
            reports.push(load_report(&store, &key, &config)?);
        }

        // A dry run reports what would happen without writing anything.
        let dry_run = req
            .params
            .get("dryRun")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let outcome = if dry_run {
            publish_all(&mut reports)
        } else {
            publish_all_with(&mut reports, &store)
        };
        tracing::info!(
            class_id = %class_id,
            dry_run,
            published = outcome.applied_count(),
            skipped = outcome.skipped_count(),
            failed = outcome.failed_count(),
            "bulk publish finished"
        );
        Ok(json!({
            "classId": class_id,
            "term": term,
            "session": session,
            "dryRun": dry_run,
            "applied": outcome.applied_count(),
            "skippedCount": outcome.skipped_count(),
            "failedCount": outcome.failed_count(),
            "succeeded": outcome.succeeded,
            "skipped": outcome.skipped,
            "failed": outcome.failed,
        }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let action = match req.method.as_str() {
        "reports.submit" => PublicationAction::Submit,
        "reports.publish" => PublicationAction::Publish,
        "reports.unpublish" => PublicationAction::Unpublish,
        "reports.reject" => PublicationAction::Reject,
        "reports.publishAll" => return Some(handle_publish_all(state, req)),
        _ => return None,
    };
    Some(handle_transition(state, req, action))
}

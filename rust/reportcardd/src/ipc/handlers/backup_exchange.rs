use crate::backup;
use crate::calc::{validate, ComponentScore, RawScore};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::reports::load_report;
use crate::ipc::handlers::setup::load_grading_config;
use crate::ipc::helpers::{
    db_conn, db_failed, required_text, respond, HandlerErr, CLASS_ID_KEYS, SESSION_KEYS,
    TERM_KEYS,
};
use crate::ipc::types::{AppState, Request};
use crate::report::ReportKey;
use crate::store::{ScoreSink, SqliteStore};
use serde_json::json;
use std::path::PathBuf;

const REPORTS_CSV_HEADER: &str =
    "student_id,display_name,term,session,status,subject,ca,exam,total,grade,remark";
const SCORES_CSV_COLUMNS: usize = 6;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                buf.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => out.push(std::mem::take(&mut buf)),
            _ => buf.push(ch),
        }
    }
    out.push(buf);
    out
}

fn workspace_param(state: &AppState, req: &Request) -> Option<PathBuf> {
    req.params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some(workspace_path) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        }
    };
    tracing::info!(path = %out_path, "workspace bundle exported");

    ok(
        &req.id,
        json!({
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256,
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let Some(workspace_path) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    let previous = state.workspace.clone();
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %in_path, error = %format!("{e:#}"), "bundle import rejected");
            // Nothing was replaced; go back to whichever workspace was selected.
            state.workspace = None;
            if let Some(prev) = previous {
                match db::open_db(&prev) {
                    Ok(conn) => {
                        state.workspace = Some(prev);
                        state.db = Some(conn);
                    }
                    Err(reopen) => tracing::warn!(
                        workspace = %prev.display(),
                        error = %format!("{reopen:#}"),
                        "failed to reopen previous workspace"
                    ),
                }
            }
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            );
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            tracing::info!(
                workspace = %workspace_path.display(),
                format = %import.bundle_format_detected,
                "workspace bundle imported"
            );
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => {
            state.workspace = None;
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

fn handle_exchange_export_reports_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let term = required_text(&req.params, TERM_KEYS)?;
        let session = required_text(&req.params, SESSION_KEYS)?;
        let out_path = required_text(&req.params, &["outPath", "out_path"])?;

        let store = SqliteStore::new(conn);
        if !store.class_exists(&class_id).map_err(db_failed("db_query_failed"))? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let students = store
            .students_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;

        let mut out = String::new();
        out.push_str(REPORTS_CSV_HEADER);
        out.push('\n');
        let mut rows_exported = 0usize;
        for student in students.iter().filter(|s| s.active) {
            let key = ReportKey::new(&student.id, &term, &session)?;
            let report = load_report(&store, &key, &config)?;
            for rec in &report.academic_records {
                let line = [
                    csv_quote(&student.id),
                    csv_quote(&student.display_name),
                    csv_quote(&term),
                    csv_quote(&session),
                    report.status.as_str().to_string(),
                    csv_quote(&rec.subject),
                    rec.ca.to_string(),
                    rec.exam.to_string(),
                    rec.total.to_string(),
                    rec.grade.as_str().to_string(),
                    csv_quote(&rec.remark),
                ]
                .join(",");
                out.push_str(&line);
                out.push('\n');
                rows_exported += 1;
            }
        }

        let path = PathBuf::from(&out_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HandlerErr::new("io_failed", e.to_string())
                    .with_details(json!({ "path": parent.to_string_lossy() }))
            })?;
        }
        std::fs::write(&path, out).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": out_path }))
        })?;
        tracing::info!(class_id = %class_id, rows_exported, "reports CSV exported");
        Ok(json!({ "path": out_path, "rowsExported": rows_exported }))
    })
}

/// Import `student_id,subject,term,session,ca,exam` rows. Bad rows become
/// warnings; the rest are upserted.
fn handle_exchange_import_scores_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let in_path = required_text(&req.params, &["inPath", "in_path"])?;
        let text = std::fs::read_to_string(&in_path).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": in_path }))
        })?;

        let store = SqliteStore::new(conn);
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let mut warnings = Vec::new();
        let mut rows_total = 0usize;
        let mut updated = 0usize;
        for (idx, raw_line) in text.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            if raw_line.trim().is_empty() {
                continue;
            }
            rows_total += 1;
            let fields = parse_csv_record(raw_line);
            if fields.len() < SCORES_CSV_COLUMNS {
                warnings.push(json!({
                    "line": line_no,
                    "code": "bad_columns",
                    "message": format!("expected {} CSV columns", SCORES_CSV_COLUMNS),
                }));
                continue;
            }
            let student_id = fields[0].trim().to_string();
            match store.student(&student_id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    warnings.push(json!({
                        "line": line_no,
                        "code": "not_found",
                        "message": format!("unknown student {}", student_id),
                    }));
                    continue;
                }
                Err(e) => return Err(db_failed("db_query_failed")(e)),
            }
            let v = validate(
                &RawScore::from(fields[4].as_str()),
                &RawScore::from(fields[5].as_str()),
                config.caps,
            );
            let score = ComponentScore {
                student_id,
                subject: fields[1].trim().to_string(),
                term: fields[2].trim().to_string(),
                session: fields[3].trim().to_string(),
                continuous_assessment: v.ca,
                exam_score: v.exam,
                updated_at: None,
            };
            match store.upsert_score(&score) {
                Ok(()) => updated += 1,
                Err(e) => warnings.push(json!({
                    "line": line_no,
                    "code": "rejected",
                    "message": format!("{e:#}"),
                })),
            }
        }
        tracing::info!(rows_total, updated, warnings = warnings.len(), "scores CSV imported");
        Ok(json!({
            "rowsTotal": rows_total,
            "updated": updated,
            "warnings": warnings,
        }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportReportsCsv" => Some(handle_exchange_export_reports_csv(state, req)),
        "exchange.importScoresCsv" => Some(handle_exchange_import_scores_csv(state, req)),
        _ => None,
    }
}

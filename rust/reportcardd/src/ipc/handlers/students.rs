use crate::ipc::helpers::{
    db_conn, db_failed, required_text, respond, HandlerErr, CLASS_ID_KEYS,
};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use serde_json::json;
use uuid::Uuid;

fn ensure_class(store: &SqliteStore<'_>, class_id: &str) -> Result<(), HandlerErr> {
    if store.class_exists(class_id).map_err(db_failed("db_query_failed"))? {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", "class not found")
            .with_details(json!({ "classId": class_id })))
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let store = SqliteStore::new(conn);
        ensure_class(&store, &class_id)?;
        let students = store
            .students_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;
        Ok(json!({ "students": students }))
    })
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let last_name = required_text(&req.params, &["lastName", "last_name"])?;
        let first_name = required_text(&req.params, &["firstName", "first_name"])?;
        let active = req
            .params
            .get("active")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let store = SqliteStore::new(conn);
        ensure_class(&store, &class_id)?;

        let next_sort: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
                [&class_id],
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

        let student_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, active, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &student_id,
                &class_id,
                &last_name,
                &first_name,
                active as i64,
                next_sort,
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "students" }))
        })?;

        Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        _ => None,
    }
}

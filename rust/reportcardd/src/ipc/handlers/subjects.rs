use crate::ipc::helpers::{db_conn, db_failed, required_text, respond, HandlerErr, CLASS_ID_KEYS};
use crate::ipc::types::{AppState, Request};
use crate::store::{SqliteStore, SubjectSource};
use serde_json::json;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let store = SqliteStore::new(conn);
        if !store.class_exists(&class_id).map_err(db_failed("db_query_failed"))? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        let subjects = store
            .list_subjects_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;
        Ok(json!({ "classId": class_id, "subjects": subjects }))
    })
}

fn handle_subjects_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let Some(raw) = req.params.get("subjects").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::new("bad_params", "missing subjects[]"));
        };
        let mut subjects = Vec::with_capacity(raw.len());
        for (i, v) in raw.iter().enumerate() {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("subjects[{}] must be a string", i),
                ));
            };
            subjects.push(s.to_string());
        }

        let store = SqliteStore::new(conn);
        if !store.class_exists(&class_id).map_err(db_failed("db_query_failed"))? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        let kept = store
            .set_subjects_for_class(&class_id, &subjects)
            .map_err(db_failed("db_update_failed"))?;
        Ok(json!({ "classId": class_id, "subjects": kept }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.set" => Some(handle_subjects_set(state, req)),
        _ => None,
    }
}

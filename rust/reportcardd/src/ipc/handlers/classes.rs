use crate::ipc::helpers::{db_conn, db_failed, required_text, respond};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteStore;
use serde_json::{json, Value};

fn handle_classes_list(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        // Listing before a workspace is chosen is not an error.
        let Some(conn) = state.db.as_ref() else {
            return Ok(json!({ "classes": [] }));
        };
        let classes = SqliteStore::new(conn)
            .list_classes()
            .map_err(db_failed("db_query_failed"))?;
        Ok(json!({ "classes": classes }))
    })
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let name = required_text(&req.params, &["name", "className"])?;
        let class_id = SqliteStore::new(conn)
            .create_class(&name)
            .map_err(db_failed("db_insert_failed"))?;
        tracing::info!(class_id = %class_id, name = %name, "class created");
        Ok(json!({ "classId": class_id, "name": name }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        _ => None,
    }
}

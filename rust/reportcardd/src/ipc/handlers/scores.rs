use crate::calc::{
    aggregate_subject_records, subject_key, validate, ComponentScore, GradingConfig,
    SubjectRecord,
};
use crate::ipc::handlers::setup::load_grading_config;
use crate::ipc::helpers::{
    db_conn, db_failed, raw_score, required_text, respond, text_field, HandlerErr, CA_KEYS,
    CLASS_ID_KEYS, EXAM_KEYS, SESSION_KEYS, STUDENT_ID_KEYS, SUBJECT_KEYS, TERM_KEYS,
};
use crate::ipc::types::{AppState, Request};
use crate::store::{ScoreSink, ScoreSource, SqliteStore, SubjectSource};
use serde_json::{json, Value};

const SCORES_BULK_MAX_ITEMS: usize = 5000;

/// Validated score plus its graded record, ready to persist.
fn graded_score(
    obj: &Value,
    student_id: String,
    subject: String,
    term: String,
    session: String,
    config: &GradingConfig,
) -> (ComponentScore, SubjectRecord) {
    let v = validate(&raw_score(obj, CA_KEYS), &raw_score(obj, EXAM_KEYS), config.caps);
    let record = SubjectRecord::from_components(&subject, v.ca, v.exam, config);
    let score = ComponentScore {
        student_id,
        subject,
        term,
        session,
        continuous_assessment: v.ca,
        exam_score: v.exam,
        updated_at: None,
    };
    (score, record)
}

fn ensure_student(store: &SqliteStore<'_>, student_id: &str) -> Result<(), HandlerErr> {
    match store.student(student_id).map_err(db_failed("db_query_failed"))? {
        Some(_) => Ok(()),
        None => Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id }))),
    }
}

fn handle_scores_validate(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        // Works without a workspace; caps then come from the defaults.
        let config = match state.db.as_ref() {
            Some(conn) => load_grading_config(conn).map_err(db_failed("db_query_failed"))?,
            None => GradingConfig::default(),
        };
        let v = validate(
            &raw_score(&req.params, CA_KEYS),
            &raw_score(&req.params, EXAM_KEYS),
            config.caps,
        );
        let class = config.thresholds.classify(v.total());
        Ok(json!({
            "ca": v.ca,
            "exam": v.exam,
            "total": v.total(),
            "grade": class.grade,
            "remark": class.remark,
        }))
    })
}

fn handle_scores_upsert(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let student_id = required_text(&req.params, STUDENT_ID_KEYS)?;
        let subject = required_text(&req.params, SUBJECT_KEYS)?;
        let term = required_text(&req.params, TERM_KEYS)?;
        let session = required_text(&req.params, SESSION_KEYS)?;

        let store = SqliteStore::new(conn);
        ensure_student(&store, &student_id)?;
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let (score, record) = graded_score(&req.params, student_id, subject, term, session, &config);
        store
            .upsert_score(&score)
            .map_err(db_failed("db_update_failed"))?;
        tracing::debug!(student = %score.student_id, subject = %score.subject, "score saved");
        Ok(json!({
            "studentId": score.student_id,
            "term": score.term,
            "session": score.session,
            "record": record,
        }))
    })
}

fn bulk_item_error(index: usize, code: &str, message: impl Into<String>) -> Value {
    json!({ "index": index, "code": code, "message": message.into() })
}

fn handle_scores_bulk_upsert(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let Some(items) = req.params.get("items").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::new("bad_params", "missing items[]"));
        };
        if items.len() > SCORES_BULK_MAX_ITEMS {
            let rejected = items.len();
            return Ok(json!({
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [bulk_item_error(
                    0,
                    "too_many_items",
                    format!("bulk payload exceeds max items: {} > {}", rejected, SCORES_BULK_MAX_ITEMS),
                )],
            }));
        }

        let default_term = text_field(&req.params, TERM_KEYS);
        let default_session = text_field(&req.params, SESSION_KEYS);
        let store = SqliteStore::new(conn);
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;

        let mut updated: usize = 0;
        let mut errors: Vec<Value> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if !item.is_object() {
                errors.push(bulk_item_error(i, "bad_params", format!("item at index {} must be an object", i)));
                continue;
            }
            let mut fields = Vec::with_capacity(4);
            for (keys, fallback) in [
                (STUDENT_ID_KEYS, None),
                (SUBJECT_KEYS, None),
                (TERM_KEYS, default_term.as_ref()),
                (SESSION_KEYS, default_session.as_ref()),
            ] {
                match text_field(item, keys).or_else(|| fallback.cloned()) {
                    Some(v) => fields.push(v),
                    None => {
                        errors.push(bulk_item_error(i, "bad_params", format!("item at index {} missing {}", i, keys[0])));
                        break;
                    }
                }
            }
            let [student_id, subject, term, session]: [String; 4] = match fields.try_into() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Err(e) = ensure_student(&store, &student_id) {
                errors.push(bulk_item_error(i, e.code, e.message));
                continue;
            }
            let (score, _) = graded_score(item, student_id, subject, term, session, &config);
            match store.upsert_score(&score) {
                Ok(()) => updated += 1,
                Err(e) => errors.push(bulk_item_error(i, "db_update_failed", format!("{e:#}"))),
            }
        }

        let rejected = errors.len();
        if rejected > 0 {
            tracing::warn!(updated, rejected, "bulk score upsert had rejected items");
        }
        let mut result = json!({ "updated": updated });
        if rejected > 0 {
            if let Some(obj) = result.as_object_mut() {
                obj.insert("rejected".into(), json!(rejected));
                obj.insert("errors".into(), json!(errors));
            }
        }
        Ok(result)
    })
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> Value {
    respond(req, || {
        let conn = db_conn(state)?;
        let class_id = required_text(&req.params, CLASS_ID_KEYS)?;
        let term = required_text(&req.params, TERM_KEYS)?;
        let session = required_text(&req.params, SESSION_KEYS)?;
        let subject = text_field(&req.params, SUBJECT_KEYS);

        let store = SqliteStore::new(conn);
        if !store.class_exists(&class_id).map_err(db_failed("db_query_failed"))? {
            return Err(HandlerErr::new("not_found", "class not found"));
        }
        let config = load_grading_config(conn).map_err(db_failed("db_query_failed"))?;
        let students = store
            .students_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;
        let mut master = store
            .list_subjects_for_class(&class_id)
            .map_err(db_failed("db_query_failed"))?;
        if let Some(wanted) = subject.as_deref() {
            let key = subject_key(wanted);
            master.retain(|s| subject_key(s) == key);
            if master.is_empty() {
                master.push(wanted.to_string());
            }
        }

        let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
        let scores = store
            .fetch_scores(&ids, subject.as_deref(), &term, &session)
            .map_err(db_failed("db_query_failed"))?;

        let rows: Vec<Value> = students
            .iter()
            .map(|s| {
                let own: Vec<ComponentScore> = scores
                    .iter()
                    .filter(|c| c.student_id == s.id)
                    .cloned()
                    .collect();
                json!({
                    "studentId": s.id,
                    "displayName": s.display_name,
                    "active": s.active,
                    "records": aggregate_subject_records(&own, &master, &config),
                })
            })
            .collect();
        Ok(json!({ "classId": class_id, "term": term, "session": session, "rows": rows }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "scores.validate" => Some(handle_scores_validate(state, req)),
        "scores.upsert" => Some(handle_scores_upsert(state, req)),
        "scores.bulkUpsert" => Some(handle_scores_bulk_upsert(state, req)),
        "scores.list" => Some(handle_scores_list(state, req)),
        _ => None,
    }
}

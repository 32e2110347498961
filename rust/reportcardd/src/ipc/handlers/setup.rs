use crate::calc::{GradeBand, GradeThresholdConfig, GradingConfig};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const GRADING_KEY: &str = "setup.grading";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SetupSection {
    Grading,
}

impl SetupSection {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "grading" => Some(SetupSection::Grading),
            _ => None,
        }
    }
}

fn grading_to_json(cfg: &GradingConfig) -> Value {
    json!({
        "caMax": cfg.caps.ca_max,
        "examMax": cfg.caps.exam_max,
        "bands": cfg.thresholds.bands,
        "fallbackRemark": cfg.thresholds.fallback_remark,
    })
}

fn parse_number(v: &Value, key: &str) -> Result<f64, String> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("{} must be a number", key))
}

/// Apply `patch` to a copy of `current`; the result must pass validation.
/// A `preset` is applied before any explicit `bands`/`fallbackRemark`.
fn merge_grading_patch(
    current: &GradingConfig,
    patch: &Map<String, Value>,
) -> Result<GradingConfig, String> {
    let mut next = current.clone();
    if let Some(v) = patch.get("preset") {
        let name = v.as_str().ok_or("preset must be a string")?;
        next.thresholds = GradeThresholdConfig::preset(name)
            .ok_or_else(|| format!("unknown preset: {} (expected reportCard or gradebook)", name))?;
    }
    for (k, v) in patch {
        match k.as_str() {
            "preset" => {}
            "caMax" => next.caps.ca_max = parse_number(v, k)?,
            "examMax" => next.caps.exam_max = parse_number(v, k)?,
            "bands" => {
                next.thresholds.bands = serde_json::from_value::<Vec<GradeBand>>(v.clone())
                    .map_err(|e| format!("bands: {}", e))?;
            }
            "fallbackRemark" => {
                next.thresholds.fallback_remark = v
                    .as_str()
                    .ok_or("fallbackRemark must be a string")?
                    .trim()
                    .to_string();
            }
            _ => return Err(format!("unknown grading field: {}", k)),
        }
    }
    next.check().map_err(|e| e.to_string())?;
    Ok(next)
}

/// Grading configuration for the open workspace. A malformed saved value is
/// logged and replaced by the defaults so score entry keeps working.
pub fn load_grading_config(conn: &Connection) -> anyhow::Result<GradingConfig> {
    let defaults = GradingConfig::default();
    let Some(saved) = db::settings_get_json(conn, GRADING_KEY)? else {
        return Ok(defaults);
    };
    let Some(saved_obj) = saved.as_object() else {
        tracing::warn!("saved grading config is not an object, using defaults");
        return Ok(defaults);
    };
    match merge_grading_patch(&defaults, saved_obj) {
        Ok(cfg) => Ok(cfg),
        Err(msg) => {
            tracing::warn!(error = %msg, "saved grading config is invalid, using defaults");
            Ok(defaults)
        }
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_grading_config(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "grading": grading_to_json(&grading) }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(SetupSection::Grading) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current = match load_grading_config(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let next = match merge_grading_patch(&current, patch_obj) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let stored = grading_to_json(&next);
    if let Err(e) = db::settings_set_json(conn, GRADING_KEY, &stored) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(ca_max = next.caps.ca_max, exam_max = next.caps.exam_max, "grading config updated");
    ok(&req.id, json!({ "grading": stored }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

mod test_support;

use serde_json::json;
use test_support::{error_code, request_err, request_ok, seed_class, spawn_sidecar, temp_dir};

const TERM: &str = "First Term";
const SESSION: &str = "2024/2025";

fn key(student_id: &str) -> serde_json::Value {
    json!({ "studentId": student_id, "term": TERM, "session": SESSION })
}

fn with(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    if let (Some(b), Some(e)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            b.insert(k.clone(), v.clone());
        }
    }
    base
}

#[test]
fn compile_fills_defaults_and_zero_scores_for_master_subjects() {
    let workspace = temp_dir("reportcard-compile-defaults");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Okafor", "Ada")],
        &["Mathematics", "English", "Basic Science"],
    );
    let sid = &seeded.student_ids[0];

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.upsert",
        with(key(sid), json!({ "subject": "Mathematics", "ca": 35, "exam": 50 })),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.upsert",
        with(key(sid), json!({ "subject": "English", "ca": 28, "exam": 40 })),
    );

    let compiled = request_ok(&mut stdin, &mut reader, "3", "reports.compile", key(sid));
    assert!(compiled.get("reportId").and_then(|v| v.as_str()).is_some());
    let report = compiled.get("report").expect("report");
    assert_eq!(report["studentId"].as_str(), Some(sid.as_str()));
    assert_eq!(report["status"], "draft");
    assert_eq!(report["teacherComment"], "No comment yet.");
    assert_eq!(report["principalComment"], "No comment yet.");
    assert_eq!(report["position"], "-");
    assert_eq!(report["totalStudents"], "-");
    assert_eq!(report["attendance"]["total"].as_u64(), Some(0));
    assert!(report["skills"].as_object().map(|m| m.is_empty()).unwrap_or(false));

    let records = report["academicRecords"].as_array().expect("records");
    let view: Vec<(&str, f64, &str)> = records
        .iter()
        .map(|r| {
            (
                r["subject"].as_str().unwrap_or(""),
                r["total"].as_f64().unwrap_or(-1.0),
                r["grade"].as_str().unwrap_or(""),
            )
        })
        .collect();
    assert_eq!(
        view,
        vec![
            ("Basic Science", 0.0, "F"),
            ("English", 68.0, "B"),
            ("Mathematics", 85.0, "A"),
        ]
    );

    let summary = compiled.get("summary").expect("summary");
    assert_eq!(summary["subjectCount"].as_u64(), Some(3));
    assert_eq!(summary["grandTotal"].as_f64(), Some(153.0));
    assert_eq!(summary["average"].as_f64(), Some(51.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn compile_rejects_blank_key_fields_and_unknown_students() {
    let workspace = temp_dir("reportcard-compile-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, &workspace, &[("Okafor", "Ada")], &["Mathematics"]);
    let sid = &seeded.student_ids[0];

    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "reports.compile",
        json!({ "studentId": sid, "term": "   ", "session": SESSION }),
    );
    assert_eq!(error_code(&e), "validation_failed");
    assert_eq!(e["details"]["field"], "term");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "reports.compile",
        json!({ "term": TERM, "session": SESSION }),
    );
    assert_eq!(e["details"]["field"], "studentId");

    let e = request_err(&mut stdin, &mut reader, "3", "reports.compile", key("ghost"));
    assert_eq!(error_code(&e), "not_found");

    // A student with no scores still gets a report over the master list.
    let empty = request_ok(&mut stdin, &mut reader, "4", "reports.compile", key(sid));
    let records = empty["report"]["academicRecords"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["remark"], "Needs Improvement");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn update_meta_merges_ratings_and_keeps_status() {
    let workspace = temp_dir("reportcard-compile-meta");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(&mut stdin, &mut reader, &workspace, &[("Okafor", "Ada")], &["Mathematics"]);
    let sid = &seeded.student_ids[0];

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.updateMeta",
        with(
            key(sid),
            json!({
                "meta": {
                    "status": "published",
                    "attendance": { "present": 50, "absent": 2, "late": 1, "total": 52 },
                    "skills": { "Punctuality": "5", "Neatness": "4" },
                    "psychomotor": { "Handwriting": 3 },
                    "teacherComment": "Diligent and curious.",
                    "position": 3,
                    "totalStudents": "40"
                }
            }),
        ),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.updateMeta",
        with(
            key(sid),
            json!({ "meta": { "skills": { "Neatness": "" }, "principalComment": "Keep it up." } }),
        ),
    );
    let report = &second["report"];
    assert_eq!(report["status"], "draft");
    assert_eq!(report["attendance"]["present"].as_u64(), Some(50));
    assert_eq!(report["skills"], json!({ "Punctuality": "5" }));
    assert_eq!(report["psychomotor"], json!({ "Handwriting": "3" }));
    assert_eq!(report["teacherComment"], "Diligent and curious.");
    assert_eq!(report["principalComment"], "Keep it up.");
    assert_eq!(report["position"], "3");
    assert_eq!(report["totalStudents"], "40");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "reports.updateMeta",
        with(key(sid), json!({ "meta": { "attendance": { "present": -1 } } })),
    );
    assert_eq!(error_code(&e), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_summary_and_csv_export_cover_every_active_student() {
    let workspace = temp_dir("reportcard-class-summary");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed_class(
        &mut stdin,
        &mut reader,
        &workspace,
        &[("Okafor", "Ada"), ("Bello", "Musa")],
        &["Mathematics", "English"],
    );
    let (s1, s2) = (&seeded.student_ids[0], &seeded.student_ids[1]);
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.bulkUpsert",
        json!({
            "term": TERM,
            "session": SESSION,
            "items": [
                { "studentId": s1, "subject": "Mathematics", "ca": 30, "exam": 50 },
                { "studentId": s1, "subject": "English", "ca": 20, "exam": 30 },
                { "studentId": s2, "subject": "Mathematics", "ca": 10, "exam": 20 }
            ]
        }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.classSummary",
        json!({ "classId": seeded.class_id, "term": TERM, "session": SESSION }),
    );
    let students = summary["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    assert_eq!(students[0]["displayName"], "Okafor, Ada");
    assert_eq!(students[0]["grandTotal"].as_f64(), Some(130.0));
    assert_eq!(students[0]["average"].as_f64(), Some(65.0));
    assert_eq!(students[0]["failedSubjects"].as_u64(), Some(0));
    assert_eq!(students[1]["grandTotal"].as_f64(), Some(30.0));
    assert_eq!(students[1]["failedSubjects"].as_u64(), Some(2));
    assert_eq!(summary["statusCounts"]["draft"].as_u64(), Some(2));
    assert_eq!(summary["statusCounts"]["published"].as_u64(), Some(0));

    let csv_path = workspace.join("exports").join("reports.csv");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exchange.exportReportsCsv",
        json!({
            "classId": seeded.class_id, "term": TERM, "session": SESSION,
            "outPath": csv_path.to_string_lossy()
        }),
    );
    assert_eq!(exported["rowsExported"].as_u64(), Some(4));
    let text = std::fs::read_to_string(&csv_path).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines[0].starts_with("student_id,display_name,"));
    assert!(lines[1].contains("\"Okafor, Ada\""));
    assert!(
        lines[1].ends_with(",draft,English,20,30,50,C,Good"),
        "{}",
        lines[1]
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

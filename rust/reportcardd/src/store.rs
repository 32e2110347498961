use crate::calc::{subject_key, ComponentScore};
use crate::publication::PublicationStatus;
use crate::report::{Attendance, Ratings, ReportKey, ReportMeta};
use anyhow::{bail, Context};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

const RATING_SKILLS: &str = "skills";
const RATING_PSYCHOMOTOR: &str = "psychomotor";

/// Read side for component scores. Happy-path sources hold at most one row
/// per (student, subject, term, session).
pub trait ScoreSource {
    fn fetch_scores(
        &self,
        student_ids: &[String],
        subject: Option<&str>,
        term: &str,
        session: &str,
    ) -> anyhow::Result<Vec<ComponentScore>>;
}

/// Write side for component scores. Keyed by (student, subject, term,
/// session); writing the same score twice leaves the same state.
pub trait ScoreSink {
    fn upsert_score(&self, score: &ComponentScore) -> anyhow::Result<()>;
}

pub trait ReportSink {
    fn set_report_status(&self, key: &ReportKey, status: PublicationStatus) -> anyhow::Result<()>;
}

pub trait SubjectSource {
    fn list_subjects_for_class(&self, class_id: &str) -> anyhow::Result<Vec<String>>;
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub class_id: String,
    pub last_name: String,
    pub first_name: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub student_count: i64,
    pub subject_count: i64,
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    let last_name: String = r.get(2)?;
    let first_name: String = r.get(3)?;
    Ok(StudentRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        display_name: format!("{}, {}", last_name, first_name),
        last_name,
        first_name,
        sort_order: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
    })
}

fn count_from_db(v: Option<i64>) -> u32 {
    v.and_then(|n| u32::try_from(n).ok()).unwrap_or(0)
}

/// SQLite-backed collaborator for every read and write the scoring core needs.
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn class_exists(&self, class_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()?
            .is_some())
    }

    /// Classes by name, with roster and master-list sizes.
    pub fn list_classes(&self) -> anyhow::Result<Vec<ClassRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id),
               (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id)
             FROM classes c
             ORDER BY c.name",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ClassRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    student_count: r.get(2)?,
                    subject_count: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_class(&self, name: &str) -> anyhow::Result<String> {
        let name = name.trim();
        if name.is_empty() {
            bail!("class name must not be empty");
        }
        let class_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO classes(id, name) VALUES(?, ?)",
                params![class_id, name],
            )
            .context("failed to insert class")?;
        Ok(class_id)
    }

    pub fn student(&self, student_id: &str) -> anyhow::Result<Option<StudentRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, class_id, last_name, first_name, sort_order, active
                 FROM students
                 WHERE id = ?",
                [student_id],
                student_from_row,
            )
            .optional()?)
    }

    pub fn students_for_class(&self, class_id: &str) -> anyhow::Result<Vec<StudentRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, class_id, last_name, first_name, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )?;
        let rows = stmt
            .query_map([class_id], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replace the subject master list of a class. Blank names and case-folded
    /// duplicates are dropped; the first spelling wins.
    pub fn set_subjects_for_class(
        &self,
        class_id: &str,
        subjects: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM class_subjects WHERE class_id = ?", [class_id])?;
        let mut seen = std::collections::HashSet::new();
        let mut kept = Vec::new();
        for name in subjects {
            let key = subject_key(name);
            if key.is_empty() || !seen.insert(key.clone()) {
                continue;
            }
            let display = name.trim().to_string();
            tx.execute(
                "INSERT INTO class_subjects(class_id, subject, subject_key, sort_order)
                 VALUES(?, ?, ?, ?)",
                params![class_id, display, key, kept.len() as i64],
            )?;
            kept.push(display);
        }
        tx.commit()?;
        Ok(kept)
    }

    /// Report row id for `key`, creating an empty draft row when missing.
    pub fn ensure_report(&self, key: &ReportKey) -> anyhow::Result<String> {
        self.conn.execute(
            "INSERT INTO reports(id, student_id, term, session, status, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, term, session) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                key.student_id,
                key.term,
                key.session,
                PublicationStatus::Draft.as_str(),
                now_millis()
            ],
        )?;
        self.report_id(key)?
            .context("report row missing after insert")
    }

    pub fn report_id(&self, key: &ReportKey) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM reports WHERE student_id = ? AND term = ? AND session = ?",
                (&key.student_id, &key.term, &key.session),
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn load_report_meta(&self, key: &ReportKey) -> anyhow::Result<Option<ReportMeta>> {
        type ReportRow = (
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            [Option<i64>; 4],
        );
        let row: Option<ReportRow> = self
            .conn
            .query_row(
                "SELECT id, status, teacher_comment, principal_comment, position, total_students,
                        attendance_present, attendance_absent, attendance_late, attendance_total
                 FROM reports
                 WHERE student_id = ? AND term = ? AND session = ?",
                (&key.student_id, &key.term, &key.session),
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        [r.get(6)?, r.get(7)?, r.get(8)?, r.get(9)?],
                    ))
                },
            )
            .optional()?;
        let Some((id, status, teacher_comment, principal_comment, position, total_students, att)) =
            row
        else {
            return Ok(None);
        };

        let status = match PublicationStatus::parse(&status) {
            Some(s) => s,
            None => {
                tracing::warn!(report = %key, status = %status, "unknown stored status, treating as draft");
                PublicationStatus::Draft
            }
        };
        let attendance = if att.iter().all(Option::is_none) {
            None
        } else {
            Some(Attendance {
                present: count_from_db(att[0]),
                absent: count_from_db(att[1]),
                late: count_from_db(att[2]),
                total: count_from_db(att[3]),
            })
        };

        let mut skills: Option<Ratings> = None;
        let mut psychomotor: Option<Ratings> = None;
        let mut stmt = self.conn.prepare(
            "SELECT kind, domain, rating FROM report_ratings WHERE report_id = ? ORDER BY domain",
        )?;
        let ratings = stmt
            .query_map([&id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (kind, domain, rating) in ratings {
            let target = match kind.as_str() {
                RATING_SKILLS => &mut skills,
                RATING_PSYCHOMOTOR => &mut psychomotor,
                _ => continue,
            };
            target.get_or_insert_with(Ratings::new).insert(domain, rating);
        }

        Ok(Some(ReportMeta {
            status: Some(status),
            attendance,
            skills,
            psychomotor,
            teacher_comment,
            principal_comment,
            position,
            total_students,
        }))
    }

    /// Persist hand-entered report content. Status is not
    /// written here; it only moves through [`ReportSink::set_report_status`].
    pub fn save_report_meta(&self, key: &ReportKey, meta: &ReportMeta) -> anyhow::Result<()> {
        let report_id = self.ensure_report(key)?;
        let tx = self.conn.unchecked_transaction()?;
        let att = meta.attendance;
        tx.execute(
            "UPDATE reports SET
               teacher_comment = ?,
               principal_comment = ?,
               position = ?,
               total_students = ?,
               attendance_present = ?,
               attendance_absent = ?,
               attendance_late = ?,
               attendance_total = ?,
               updated_at = ?
             WHERE id = ?",
            params![
                meta.teacher_comment,
                meta.principal_comment,
                meta.position,
                meta.total_students,
                att.map(|a| a.present),
                att.map(|a| a.absent),
                att.map(|a| a.late),
                att.map(|a| a.total),
                now_millis(),
                report_id
            ],
        )?;
        for (kind, ratings) in [
            (RATING_SKILLS, meta.skills.as_ref()),
            (RATING_PSYCHOMOTOR, meta.psychomotor.as_ref()),
        ] {
            let Some(ratings) = ratings else { continue };
            tx.execute(
                "DELETE FROM report_ratings WHERE report_id = ? AND kind = ?",
                (&report_id, kind),
            )?;
            for (domain, rating) in ratings {
                tx.execute(
                    "INSERT INTO report_ratings(report_id, kind, domain, rating) VALUES(?, ?, ?, ?)",
                    (&report_id, kind, domain, rating),
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl ScoreSource for SqliteStore<'_> {
    fn fetch_scores(
        &self,
        student_ids: &[String],
        subject: Option<&str>,
        term: &str,
        session: &str,
    ) -> anyhow::Result<Vec<ComponentScore>> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; student_ids.len()].join(",");
        let sql = format!(
            "SELECT student_id, subject, subject_key, term, session, ca, exam, updated_at
             FROM scores
             WHERE student_id IN ({}) AND term = ? AND session = ?
             ORDER BY student_id, subject_key",
            placeholders
        );
        let mut bind_values: Vec<Value> = Vec::with_capacity(student_ids.len() + 2);
        for id in student_ids {
            bind_values.push(Value::Text(id.clone()));
        }
        bind_values.push(Value::Text(term.to_string()));
        bind_values.push(Value::Text(session.to_string()));

        let wanted_key = subject.map(subject_key);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |r| {
                Ok((
                    r.get::<_, String>(2)?,
                    ComponentScore {
                        student_id: r.get(0)?,
                        subject: r.get(1)?,
                        term: r.get(3)?,
                        session: r.get(4)?,
                        continuous_assessment: r.get(5)?,
                        exam_score: r.get(6)?,
                        updated_at: r.get(7)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|(key, _)| wanted_key.as_ref().map(|w| w == key).unwrap_or(true))
            .map(|(_, score)| score)
            .collect())
    }
}

impl ScoreSink for SqliteStore<'_> {
    fn upsert_score(&self, score: &ComponentScore) -> anyhow::Result<()> {
        let key = subject_key(&score.subject);
        if key.is_empty() {
            bail!("subject must not be empty");
        }
        let report_key = ReportKey::new(&score.student_id, &score.term, &score.session)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO scores(id, student_id, subject, subject_key, term, session, ca, exam, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_key, term, session) DO UPDATE SET
               subject = excluded.subject,
               ca = excluded.ca,
               exam = excluded.exam,
               updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                report_key.student_id,
                score.subject.trim(),
                key,
                report_key.term,
                report_key.session,
                score.continuous_assessment,
                score.exam_score,
                now_millis()
            ],
        )?;
        // The first recorded score opens the report card for that term.
        self.ensure_report(&report_key)?;
        tx.commit()?;
        Ok(())
    }
}

impl ReportSink for SqliteStore<'_> {
    fn set_report_status(&self, key: &ReportKey, status: PublicationStatus) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO reports(id, student_id, term, session, status, updated_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, term, session) DO UPDATE SET
               status = excluded.status,
               updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                key.student_id,
                key.term,
                key.session,
                status.as_str(),
                now_millis()
            ],
        )?;
        Ok(())
    }
}

impl SubjectSource for SqliteStore<'_> {
    fn list_subjects_for_class(&self, class_id: &str) -> anyhow::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject FROM class_subjects WHERE class_id = ? ORDER BY sort_order",
        )?;
        let subjects = stmt
            .query_map([class_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subjects)
    }
}

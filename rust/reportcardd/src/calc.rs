use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_CA_MAX: f64 = 40.0;
pub const DEFAULT_EXAM_MAX: f64 = 60.0;

/// Half-up 1-decimal rounding used for displayed averages:
/// `Int(10*x + 0.5) / 10`
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCaps {
    pub ca_max: f64,
    pub exam_max: f64,
}

impl Default for ScoreCaps {
    fn default() -> Self {
        Self {
            ca_max: DEFAULT_CA_MAX,
            exam_max: DEFAULT_EXAM_MAX,
        }
    }
}

impl ScoreCaps {
    pub fn max_total(&self) -> f64 {
        self.ca_max + self.exam_max
    }
}

/// A component value exactly as it arrived from an entry screen.
#[derive(Debug, Clone, PartialEq)]
pub enum RawScore {
    Missing,
    Number(f64),
    Text(String),
}

impl From<f64> for RawScore {
    fn from(v: f64) -> Self {
        RawScore::Number(v)
    }
}

impl From<&str> for RawScore {
    fn from(v: &str) -> Self {
        RawScore::Text(v.to_string())
    }
}

impl From<Option<f64>> for RawScore {
    fn from(v: Option<f64>) -> Self {
        v.map(RawScore::Number).unwrap_or(RawScore::Missing)
    }
}

impl From<&serde_json::Value> for RawScore {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Number(n) => n.as_f64().map(RawScore::Number).unwrap_or(RawScore::Missing),
            serde_json::Value::String(s) => RawScore::Text(s.clone()),
            _ => RawScore::Missing,
        }
    }
}

/// Coerce one component into `[0, cap]`. Never fails: anything that is not a
/// finite positive number becomes 0, anything above the cap becomes the cap.
pub fn sanitize_component(raw: &RawScore, cap: f64) -> f64 {
    let v = match raw {
        RawScore::Missing => 0.0,
        RawScore::Number(n) => *n,
        RawScore::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
    };
    if !v.is_finite() || v <= 0.0 {
        return 0.0;
    }
    let cap = if cap.is_finite() && cap > 0.0 { cap } else { 0.0 };
    v.min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedScore {
    pub ca: f64,
    pub exam: f64,
}

impl ValidatedScore {
    pub fn total(&self) -> f64 {
        self.ca + self.exam
    }
}

pub fn validate(ca: &RawScore, exam: &RawScore, caps: ScoreCaps) -> ValidatedScore {
    ValidatedScore {
        ca: sanitize_component(ca, caps.ca_max),
        exam: sanitize_component(exam, caps.exam_max),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GradeLetter {
    A,
    B,
    C,
    D,
    F,
}

impl GradeLetter {
    fn rank(self) -> u8 {
        match self {
            GradeLetter::A => 4,
            GradeLetter::B => 3,
            GradeLetter::C => 2,
            GradeLetter::D => 1,
            GradeLetter::F => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradeLetter::A => "A",
            GradeLetter::B => "B",
            GradeLetter::C => "C",
            GradeLetter::D => "D",
            GradeLetter::F => "F",
        }
    }
}

impl PartialOrd for GradeLetter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GradeLetter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for GradeLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_total: f64,
    pub grade: GradeLetter,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub grade: GradeLetter,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingConfigError {
    #[error("threshold {min_total} for grade {grade} is outside 0..={max_total}")]
    ThresholdOutOfRange {
        grade: GradeLetter,
        min_total: f64,
        max_total: f64,
    },
    #[error("threshold for grade {grade} must be below the previous band")]
    ThresholdsNotDescending { grade: GradeLetter },
    #[error("grade {grade} must rank below the previous band")]
    GradesNotDescending { grade: GradeLetter },
    #[error("remark for grade {grade} must not be empty")]
    EmptyRemark { grade: GradeLetter },
    #[error("fallback remark must not be empty")]
    EmptyFallbackRemark,
    #[error("caps must be finite and positive (caMax={ca_max}, examMax={exam_max})")]
    InvalidCaps { ca_max: f64, exam_max: f64 },
}

/// Inclusive lower bounds evaluated top-down; the first matching band wins and
/// anything below every band is an F with `fallback_remark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeThresholdConfig {
    pub bands: Vec<GradeBand>,
    pub fallback_remark: String,
}

fn band(min_total: f64, grade: GradeLetter, remark: &str) -> GradeBand {
    GradeBand {
        min_total,
        grade,
        remark: remark.to_string(),
    }
}

impl GradeThresholdConfig {
    /// Table used on printed report cards.
    pub fn report_card() -> Self {
        Self {
            bands: vec![
                band(75.0, GradeLetter::A, "Excellent"),
                band(65.0, GradeLetter::B, "Very Good"),
                band(50.0, GradeLetter::C, "Good"),
                band(45.0, GradeLetter::D, "Fair"),
            ],
            fallback_remark: "Needs Improvement".to_string(),
        }
    }

    /// Table used by the teacher gradebook view.
    pub fn gradebook() -> Self {
        Self {
            bands: vec![
                band(70.0, GradeLetter::A, "Excellent"),
                band(60.0, GradeLetter::B, "Very Good"),
                band(50.0, GradeLetter::C, "Good"),
                band(45.0, GradeLetter::D, "Pass"),
            ],
            fallback_remark: "Fail".to_string(),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "reportcard" | "report_card" => Some(Self::report_card()),
            "gradebook" => Some(Self::gradebook()),
            _ => None,
        }
    }

    pub fn check(&self, max_total: f64) -> Result<(), GradingConfigError> {
        if self.fallback_remark.trim().is_empty() {
            return Err(GradingConfigError::EmptyFallbackRemark);
        }
        let mut prev: Option<&GradeBand> = None;
        for b in &self.bands {
            if !b.min_total.is_finite() || b.min_total < 0.0 || b.min_total > max_total {
                return Err(GradingConfigError::ThresholdOutOfRange {
                    grade: b.grade,
                    min_total: b.min_total,
                    max_total,
                });
            }
            if b.remark.trim().is_empty() {
                return Err(GradingConfigError::EmptyRemark { grade: b.grade });
            }
            if let Some(p) = prev {
                if b.min_total >= p.min_total {
                    return Err(GradingConfigError::ThresholdsNotDescending { grade: b.grade });
                }
                if b.grade >= p.grade {
                    return Err(GradingConfigError::GradesNotDescending { grade: b.grade });
                }
            }
            prev = Some(b);
        }
        Ok(())
    }

    pub fn classify(&self, total: f64) -> Classification {
        if total.is_finite() {
            for b in &self.bands {
                if total >= b.min_total {
                    return Classification {
                        grade: b.grade,
                        remark: b.remark.clone(),
                    };
                }
            }
        }
        Classification {
            grade: GradeLetter::F,
            remark: self.fallback_remark.clone(),
        }
    }
}

impl Default for GradeThresholdConfig {
    fn default() -> Self {
        Self::report_card()
    }
}

/// Everything the scoring pipeline needs from workspace configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GradingConfig {
    pub caps: ScoreCaps,
    pub thresholds: GradeThresholdConfig,
}

impl GradingConfig {
    pub fn check(&self) -> Result<(), GradingConfigError> {
        let ScoreCaps { ca_max, exam_max } = self.caps;
        if !ca_max.is_finite() || !exam_max.is_finite() || ca_max <= 0.0 || exam_max <= 0.0 {
            return Err(GradingConfigError::InvalidCaps { ca_max, exam_max });
        }
        self.thresholds.check(self.caps.max_total())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    pub student_id: String,
    pub subject: String,
    pub term: String,
    pub session: String,
    pub continuous_assessment: f64,
    pub exam_score: f64,
    /// Unix millis of the last write, when the source knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    pub subject: String,
    pub ca: f64,
    pub exam: f64,
    pub total: f64,
    pub grade: GradeLetter,
    pub remark: String,
}

impl SubjectRecord {
    pub fn from_components(subject: &str, ca: f64, exam: f64, config: &GradingConfig) -> Self {
        let ca = sanitize_component(&RawScore::Number(ca), config.caps.ca_max);
        let exam = sanitize_component(&RawScore::Number(exam), config.caps.exam_max);
        let total = ca + exam;
        let Classification { grade, remark } = config.thresholds.classify(total);
        SubjectRecord {
            subject: subject.to_string(),
            ca,
            exam,
            total,
            grade,
            remark,
        }
    }
}

/// Subjects are matched on their trimmed, case-folded name.
pub fn subject_key(subject: &str) -> String {
    subject.trim().to_lowercase()
}

/// One record per subject in `subjects_master ∪ subjects(scores)`, sorted by
/// subject key. Blank subject names are ignored. When the same subject is
/// scored more than once the newest `updated_at` wins; ties (including
/// records without a timestamp) go to the one appearing later in `scores`.
pub fn aggregate_subject_records(
    scores: &[ComponentScore],
    subjects_master: &[String],
    config: &GradingConfig,
) -> Vec<SubjectRecord> {
    let mut chosen: BTreeMap<String, &ComponentScore> = BTreeMap::new();
    for s in scores {
        let key = subject_key(&s.subject);
        if key.is_empty() {
            continue;
        }
        match chosen.get(&key) {
            Some(current) if s.updated_at < current.updated_at => {}
            _ => {
                chosen.insert(key, s);
            }
        }
    }

    let mut names: BTreeMap<String, String> = BTreeMap::new();
    for name in subjects_master {
        let key = subject_key(name);
        if key.is_empty() {
            continue;
        }
        names.entry(key).or_insert_with(|| name.trim().to_string());
    }
    for (key, s) in &chosen {
        names
            .entry(key.clone())
            .or_insert_with(|| s.subject.trim().to_string());
    }

    names
        .into_iter()
        .map(|(key, display)| match chosen.get(&key) {
            Some(s) => SubjectRecord::from_components(
                &display,
                s.continuous_assessment,
                s.exam_score,
                config,
            ),
            None => SubjectRecord::from_components(&display, 0.0, 0.0, config),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsSummary {
    pub subject_count: usize,
    pub grand_total: f64,
    pub average: f64,
}

pub fn summarize_records(records: &[SubjectRecord]) -> RecordsSummary {
    let grand_total: f64 = records.iter().map(|r| r.total).sum();
    let average = if records.is_empty() {
        0.0
    } else {
        round_off_1_decimal(grand_total / records.len() as f64)
    };
    RecordsSummary {
        subject_count: records.len(),
        grand_total,
        average,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(subject: &str, ca: f64, exam: f64, updated_at: Option<i64>) -> ComponentScore {
        ComponentScore {
            student_id: "s1".to_string(),
            subject: subject.to_string(),
            term: "First Term".to_string(),
            session: "2024/2025".to_string(),
            continuous_assessment: ca,
            exam_score: exam,
            updated_at,
        }
    }

    #[test]
    fn round_off_is_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(64.6666), 64.7);
    }

    #[test]
    fn validate_clamps_and_zeroes_malformed_input() {
        let caps = ScoreCaps::default();
        let v = validate(&RawScore::from("abc"), &RawScore::from(-10.0), caps);
        assert_eq!(v, ValidatedScore { ca: 0.0, exam: 0.0 });

        let v = validate(&RawScore::from(40.0), &RawScore::from(65.0), caps);
        assert_eq!(v, ValidatedScore { ca: 40.0, exam: 60.0 });
        assert_eq!(v.total(), 100.0);

        let v = validate(&RawScore::from(" 12.5 "), &RawScore::Missing, caps);
        assert_eq!(v, ValidatedScore { ca: 12.5, exam: 0.0 });
    }

    #[test]
    fn validate_stays_in_bounds_for_awkward_values() {
        let caps = ScoreCaps {
            ca_max: 30.0,
            exam_max: 70.0,
        };
        let inputs = [
            RawScore::Missing,
            RawScore::from(f64::NAN),
            RawScore::from(f64::INFINITY),
            RawScore::from(f64::NEG_INFINITY),
            RawScore::from(-0.0),
            RawScore::from(1e300),
            RawScore::from(""),
            RawScore::from("NaN"),
            RawScore::from("inf"),
            RawScore::from("29.99"),
            RawScore::from("500"),
        ];
        for ca in &inputs {
            for exam in &inputs {
                let v = validate(ca, exam, caps);
                assert!((0.0..=caps.ca_max).contains(&v.ca), "{ca:?} -> {}", v.ca);
                assert!((0.0..=caps.exam_max).contains(&v.exam), "{exam:?} -> {}", v.exam);
            }
        }
    }

    #[test]
    fn raw_score_from_json_accepts_numbers_and_strings_only() {
        assert_eq!(RawScore::from(&serde_json::json!(12)), RawScore::Number(12.0));
        assert_eq!(
            RawScore::from(&serde_json::json!("7")),
            RawScore::Text("7".to_string())
        );
        assert_eq!(RawScore::from(&serde_json::json!(true)), RawScore::Missing);
        assert_eq!(RawScore::from(&serde_json::Value::Null), RawScore::Missing);
    }

    #[test]
    fn report_card_table_boundaries() {
        let t = GradeThresholdConfig::report_card();
        let cases = [
            (100.0, GradeLetter::A, "Excellent"),
            (75.0, GradeLetter::A, "Excellent"),
            (74.9, GradeLetter::B, "Very Good"),
            (65.0, GradeLetter::B, "Very Good"),
            (64.5, GradeLetter::C, "Good"),
            (50.0, GradeLetter::C, "Good"),
            (49.0, GradeLetter::D, "Fair"),
            (45.0, GradeLetter::D, "Fair"),
            (44.9, GradeLetter::F, "Needs Improvement"),
            (0.0, GradeLetter::F, "Needs Improvement"),
        ];
        for (total, grade, remark) in cases {
            let c = t.classify(total);
            assert_eq!(c.grade, grade, "total {total}");
            assert_eq!(c.remark, remark, "total {total}");
        }
    }

    #[test]
    fn gradebook_preset_uses_lower_thresholds() {
        let t = GradeThresholdConfig::gradebook();
        assert_eq!(t.classify(70.0).grade, GradeLetter::A);
        assert_eq!(t.classify(60.0).grade, GradeLetter::B);
        assert_eq!(t.classify(45.0).remark, "Pass");
        assert_eq!(t.classify(10.0).remark, "Fail");
        assert_eq!(GradeThresholdConfig::preset("reportCard"), Some(GradeThresholdConfig::report_card()));
        assert_eq!(GradeThresholdConfig::preset("nope"), None);
    }

    #[test]
    fn classify_is_monotonic() {
        for t in [GradeThresholdConfig::report_card(), GradeThresholdConfig::gradebook()] {
            let mut prev = t.classify(0.0).grade;
            let mut total = 0.0;
            while total <= 100.0 {
                let g = t.classify(total).grade;
                assert!(g >= prev, "grade dropped at {total}");
                prev = g;
                total += 0.25;
            }
        }
    }

    #[test]
    fn classify_nan_falls_back_to_f() {
        let c = GradeThresholdConfig::report_card().classify(f64::NAN);
        assert_eq!(c.grade, GradeLetter::F);
    }

    #[test]
    fn grade_letters_order_a_highest() {
        assert!(GradeLetter::A > GradeLetter::B);
        assert!(GradeLetter::D > GradeLetter::F);
    }

    #[test]
    fn config_check_rejects_inverted_tables() {
        let mut t = GradeThresholdConfig::report_card();
        t.bands.swap(0, 1);
        assert!(matches!(
            t.check(100.0),
            Err(GradingConfigError::ThresholdsNotDescending { .. })
        ));

        let mut t = GradeThresholdConfig::report_card();
        t.bands[1].grade = GradeLetter::A;
        assert!(matches!(
            t.check(100.0),
            Err(GradingConfigError::GradesNotDescending { .. })
        ));

        let t = GradeThresholdConfig::report_card();
        assert!(matches!(
            t.check(60.0),
            Err(GradingConfigError::ThresholdOutOfRange { .. })
        ));

        let bad_caps = GradingConfig {
            caps: ScoreCaps {
                ca_max: 0.0,
                exam_max: 60.0,
            },
            thresholds: GradeThresholdConfig::default(),
        };
        assert!(matches!(bad_caps.check(), Err(GradingConfigError::InvalidCaps { .. })));
        assert!(GradingConfig::default().check().is_ok());
    }

    #[test]
    fn aggregate_scores_the_worked_examples() {
        let cfg = GradingConfig::default();
        let out = aggregate_subject_records(
            &[score("Math", 35.0, 58.0, None), score("Physics", 40.0, 65.0, None)],
            &[],
            &cfg,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subject, "Math");
        assert_eq!(out[0].total, 93.0);
        assert_eq!(out[0].grade, GradeLetter::A);
        assert_eq!(out[0].remark, "Excellent");
        assert_eq!(out[1].exam, 60.0);
        assert_eq!(out[1].total, 100.0);
    }

    #[test]
    fn aggregate_zero_fills_master_subjects() {
        let cfg = GradingConfig::default();
        let master = vec!["Math".to_string(), "English".to_string(), "Biology".to_string()];
        let out = aggregate_subject_records(&[score("Math", 20.0, 30.0, None)], &master, &cfg);
        let subjects: Vec<&str> = out.iter().map(|r| r.subject.as_str()).collect();
        assert_eq!(subjects, vec!["Biology", "English", "Math"]);
        for r in out.iter().filter(|r| r.subject != "Math") {
            assert_eq!((r.ca, r.exam, r.total), (0.0, 0.0, 0.0));
            assert_eq!(r.grade, GradeLetter::F);
        }
    }

    #[test]
    fn aggregate_keeps_scored_subjects_missing_from_master() {
        let cfg = GradingConfig::default();
        let master = vec!["English".to_string()];
        let out = aggregate_subject_records(&[score("Chemistry", 30.0, 40.0, None)], &master, &cfg);
        let subjects: Vec<&str> = out.iter().map(|r| r.subject.as_str()).collect();
        assert_eq!(subjects, vec!["Chemistry", "English"]);
    }

    #[test]
    fn aggregate_duplicates_prefer_newest_then_last() {
        let cfg = GradingConfig::default();
        let out = aggregate_subject_records(
            &[
                score("Math", 10.0, 10.0, Some(200)),
                score("math ", 20.0, 20.0, Some(100)),
            ],
            &[],
            &cfg,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total, 20.0);

        let out = aggregate_subject_records(
            &[score("Math", 10.0, 10.0, None), score("Math", 30.0, 30.0, None)],
            &[],
            &cfg,
        );
        assert_eq!(out[0].total, 60.0);
    }

    #[test]
    fn aggregate_master_name_wins_display_and_blanks_are_dropped() {
        let cfg = GradingConfig::default();
        let master = vec!["Further Maths".to_string(), "  ".to_string()];
        let out = aggregate_subject_records(
            &[score("further maths", 30.0, 30.0, None), score("", 40.0, 60.0, None)],
            &master,
            &cfg,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "Further Maths");
        assert_eq!(out[0].total, 60.0);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let cfg = GradingConfig::default();
        let scores = vec![
            score("Zoology", 12.0, 33.0, None),
            score("Art", 40.0, 60.0, Some(5)),
            score("art", 1.0, 1.0, Some(4)),
            score("Civics", 22.0, 28.0, None),
        ];
        let master = vec!["History".to_string()];
        let a = aggregate_subject_records(&scores, &master, &cfg);
        let b = aggregate_subject_records(&scores, &master, &cfg);
        assert_eq!(
            serde_json::to_string(&a).expect("json"),
            serde_json::to_string(&b).expect("json")
        );
    }

    #[test]
    fn aggregate_reclamps_stored_components() {
        let cfg = GradingConfig {
            caps: ScoreCaps {
                ca_max: 30.0,
                exam_max: 70.0,
            },
            thresholds: GradeThresholdConfig::default(),
        };
        let out = aggregate_subject_records(&[score("Math", 40.0, -3.0, None)], &[], &cfg);
        assert_eq!((out[0].ca, out[0].exam, out[0].total), (30.0, 0.0, 30.0));
    }

    #[test]
    fn summarize_averages_totals() {
        let cfg = GradingConfig::default();
        let recs = aggregate_subject_records(
            &[score("A", 30.0, 40.0, None), score("B", 20.0, 20.0, None), score("C", 15.0, 0.0, None)],
            &[],
            &cfg,
        );
        let s = summarize_records(&recs);
        assert_eq!(s.subject_count, 3);
        assert_eq!(s.grand_total, 125.0);
        assert_eq!(s.average, 41.7);
        assert_eq!(summarize_records(&[]).average, 0.0);
    }
}

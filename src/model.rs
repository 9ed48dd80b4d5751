use serde::{Deserialize, Serialize};
use std::fmt;

/// Schooling levels recognized by the system. The level decides the grading
/// period structure and the valid grade scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcademicLevel {
    Elementary,
    JuniorHigh,
    SeniorHigh,
    College,
}

impl AcademicLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcademicLevel::Elementary => "elementary",
            AcademicLevel::JuniorHigh => "junior_high",
            AcademicLevel::SeniorHigh => "senior_high",
            AcademicLevel::College => "college",
        }
    }

    pub fn parse(s: &str) -> Option<AcademicLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "elementary" => Some(AcademicLevel::Elementary),
            "junior_high" | "junior high" => Some(AcademicLevel::JuniorHigh),
            "senior_high" | "senior high" => Some(AcademicLevel::SeniorHigh),
            "college" => Some(AcademicLevel::College),
            _ => None,
        }
    }

    /// Inclusive valid range for a recorded grade at this level.
    /// College uses the inverted 1.0–5.0 scale (1.0 is best); comparisons in
    /// the qualifier stay numeric regardless of level.
    pub fn grade_range(&self) -> (f64, f64) {
        match self {
            AcademicLevel::College => (1.0, 5.0),
            _ => (0.0, 100.0),
        }
    }

    pub fn is_quarter_based(&self) -> bool {
        matches!(self, AcademicLevel::Elementary | AcademicLevel::JuniorHigh)
    }

    /// Year-of-study bounds on criteria only apply where the system tracks a
    /// year of study, which is college only.
    pub fn tracks_year_of_study(&self) -> bool {
        matches!(self, AcademicLevel::College)
    }
}

impl fmt::Display for AcademicLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AcademicLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AcademicLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AcademicLevel::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown academic level: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SemesterPart {
    Midterm,
    PreFinal,
}

/// One grading period. Quarters belong to elementary/junior high; semester
/// sub-periods belong to senior high and college.
///
/// Canonical text forms: `Q1`..`Q4`, `S1:MID`, `S1:PRE`, `S2:MID`, `S2:PRE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodCode {
    Quarter(u8),
    Semester { semester: u8, part: SemesterPart },
}

impl PeriodCode {
    pub fn parse(s: &str) -> Option<PeriodCode> {
        let t = s.trim().to_ascii_uppercase();
        if let Some(rest) = t.strip_prefix('Q') {
            let n: u8 = rest.parse().ok()?;
            if (1..=4).contains(&n) {
                return Some(PeriodCode::Quarter(n));
            }
            return None;
        }
        let rest = t.strip_prefix('S')?;
        let (sem, part) = rest.split_once(':')?;
        let semester: u8 = sem.parse().ok()?;
        if !(1..=2).contains(&semester) {
            return None;
        }
        let part = match part {
            "MID" | "MIDTERM" => SemesterPart::Midterm,
            "PRE" | "PREFINAL" | "PRE_FINAL" => SemesterPart::PreFinal,
            _ => return None,
        };
        Some(PeriodCode::Semester { semester, part })
    }

    pub fn code(&self) -> String {
        match self {
            PeriodCode::Quarter(n) => format!("Q{n}"),
            PeriodCode::Semester { semester, part } => {
                let p = match part {
                    SemesterPart::Midterm => "MID",
                    SemesterPart::PreFinal => "PRE",
                };
                format!("S{semester}:{p}")
            }
        }
    }

    pub fn semester(&self) -> Option<u8> {
        match self {
            PeriodCode::Semester { semester, .. } => Some(*semester),
            PeriodCode::Quarter(_) => None,
        }
    }

    /// Whether this period shape is legal at the given level.
    pub fn valid_for(&self, level: AcademicLevel) -> bool {
        match self {
            PeriodCode::Quarter(_) => level.is_quarter_based(),
            PeriodCode::Semester { .. } => !level.is_quarter_based(),
        }
    }
}

impl fmt::Display for PeriodCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl Serialize for PeriodCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.code())
    }
}

impl<'de> Deserialize<'de> for PeriodCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeriodCode::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown period code: {s}")))
    }
}

/// Default quarter weight when the entry carries none (four equal quarters).
pub const DEFAULT_QUARTER_WEIGHT: f64 = 25.0;

/// One recorded grade for one student in one subject for one period.
/// `grade == None` means "not yet recorded" and must never be folded in as 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    pub student_id: String,
    pub subject_id: String,
    pub level: AcademicLevel,
    pub period: PeriodCode,
    pub grade: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// One configurable qualification rule for one honor tier at one level.
/// Read-only to the qualifier; registrar portals manage the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HonorCriterion {
    pub id: String,
    pub level: AcademicLevel,
    pub honor_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_gpa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_gpa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_grade_all: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_year: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_year: Option<i64>,
    pub require_consistent_honor: bool,
    pub sort_order: i64,
}

impl HonorCriterion {
    /// A criterion with no bound at all matches nothing; treating it as
    /// match-everything would hand out honors on a blank rule.
    pub fn has_any_bound(&self) -> bool {
        self.min_gpa.is_some()
            || self.max_gpa.is_some()
            || self.min_grade.is_some()
            || self.min_grade_all.is_some()
    }

    /// Bounds sanity: when both ends of a range are present, min must not
    /// exceed max. Violations are configuration errors, skipped with a
    /// warning rather than failing the whole evaluation.
    pub fn bounds_ok(&self) -> bool {
        if let (Some(lo), Some(hi)) = (self.min_gpa, self.max_gpa) {
            if lo > hi {
                return false;
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_year, self.max_year) {
            if lo > hi {
                return false;
            }
        }
        true
    }
}

/// Boundary normalization for criterion payloads. The portals historically
/// sent both snake_case and camelCase spellings for the same field; this is
/// the single place both are accepted, so nothing downstream ever looks for a
/// fallback spelling again.
pub fn criterion_from_params(
    id: String,
    sort_order: i64,
    params: &serde_json::Value,
) -> Result<HonorCriterion, String> {
    fn field<'a>(
        params: &'a serde_json::Value,
        snake: &str,
        camel: &str,
    ) -> Option<&'a serde_json::Value> {
        params.get(snake).or_else(|| params.get(camel))
    }
    fn num_field(params: &serde_json::Value, snake: &str, camel: &str) -> Result<Option<f64>, String> {
        match field(params, snake, camel) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| format!("{snake} must be a number or null")),
        }
    }
    fn int_field(params: &serde_json::Value, snake: &str, camel: &str) -> Result<Option<i64>, String> {
        match field(params, snake, camel) {
            None => Ok(None),
            Some(v) if v.is_null() => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| format!("{snake} must be an integer or null")),
        }
    }

    let level_raw = field(params, "academic_level", "academicLevel")
        .or_else(|| params.get("level"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing academic_level".to_string())?;
    let level =
        AcademicLevel::parse(level_raw).ok_or_else(|| format!("unknown academic level: {level_raw}"))?;

    let honor_type = field(params, "honor_type", "honorType")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing honor_type".to_string())?;

    let require_consistent_honor = field(params, "require_consistent_honor", "requireConsistentHonor")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    Ok(HonorCriterion {
        id,
        level,
        honor_type,
        min_gpa: num_field(params, "min_gpa", "minGpa")?,
        max_gpa: num_field(params, "max_gpa", "maxGpa")?,
        min_grade: num_field(params, "min_grade", "minGrade")?,
        min_grade_all: num_field(params, "min_grade_all", "minGradeAll")?,
        min_year: int_field(params, "min_year", "minYear")?,
        max_year: int_field(params, "max_year", "maxYear")?,
        require_consistent_honor,
        sort_order,
    })
}

/// One period's recorded value inside a subject breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodGrade {
    pub period: PeriodCode,
    pub grade: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectBreakdown {
    pub subject_id: String,
    /// None when no period in the subject has a value; such subjects are
    /// excluded from the overall mean, never counted as zero.
    pub average: Option<f64>,
    pub periods: Vec<PeriodGrade>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodAverage {
    pub period: String,
    pub average: f64,
}

/// Derived aggregation for one student in one school year. Never persisted by
/// the core; the IPC layer serializes it straight out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub average_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_grade: Option<f64>,
    pub period_averages: Vec<PeriodAverage>,
    pub subjects: Vec<SubjectBreakdown>,
    pub total_subjects: usize,
    pub graded_periods: usize,
}

impl AggregatedResult {
    /// The "no grades" sentinel: average 0, empty breakdown, ineligible for
    /// honors by construction.
    pub fn empty() -> AggregatedResult {
        AggregatedResult {
            average_grade: 0.0,
            min_grade: None,
            max_grade: None,
            period_averages: Vec::new(),
            subjects: Vec::new(),
            total_subjects: 0,
            graded_periods: 0,
        }
    }

    pub fn has_grades(&self) -> bool {
        self.graded_periods > 0
    }
}

/// One individual grade that violated a strict floor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedGrade {
    pub subject_id: String,
    pub period: PeriodCode,
    pub grade: f64,
}

/// Metrics captured alongside a satisfied criterion so reporting callers can
/// show how the student measured against it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualificationMetrics {
    pub average_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_grade: Option<f64>,
    pub total_subjects: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Qualification {
    pub honor_type: String,
    pub criterion: HonorCriterion,
    pub metrics: QualificationMetrics,
}

/// Primary output of the qualifier for one student and school year.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualificationResult {
    pub qualified: bool,
    /// All satisfied criteria; the headline tier is first.
    pub qualifications: Vec<Qualification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub honor_type: Option<String>,
    pub average_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_grade: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_grade: Option<f64>,
    pub period_averages: Vec<PeriodAverage>,
    pub total_subjects: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_grades: Vec<FailedGrade>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_parse_round_trips() {
        for lvl in [
            AcademicLevel::Elementary,
            AcademicLevel::JuniorHigh,
            AcademicLevel::SeniorHigh,
            AcademicLevel::College,
        ] {
            assert_eq!(AcademicLevel::parse(lvl.as_str()), Some(lvl));
        }
        assert_eq!(AcademicLevel::parse("Senior High"), Some(AcademicLevel::SeniorHigh));
        assert_eq!(AcademicLevel::parse("grade school"), None);
    }

    #[test]
    fn period_codes_parse_and_print() {
        assert_eq!(PeriodCode::parse("Q1"), Some(PeriodCode::Quarter(1)));
        assert_eq!(PeriodCode::parse("q4"), Some(PeriodCode::Quarter(4)));
        assert_eq!(PeriodCode::parse("Q5"), None);
        assert_eq!(
            PeriodCode::parse("S1:MID"),
            Some(PeriodCode::Semester {
                semester: 1,
                part: SemesterPart::Midterm
            })
        );
        assert_eq!(
            PeriodCode::parse("s2:pre_final"),
            Some(PeriodCode::Semester {
                semester: 2,
                part: SemesterPart::PreFinal
            })
        );
        assert_eq!(PeriodCode::parse("S3:MID"), None);
        assert_eq!(
            PeriodCode::parse("S2:PRE").map(|p| p.code()),
            Some("S2:PRE".to_string())
        );
    }

    #[test]
    fn period_shape_matches_level() {
        let q = PeriodCode::Quarter(2);
        let s = PeriodCode::Semester {
            semester: 1,
            part: SemesterPart::Midterm,
        };
        assert!(q.valid_for(AcademicLevel::Elementary));
        assert!(!q.valid_for(AcademicLevel::College));
        assert!(s.valid_for(AcademicLevel::SeniorHigh));
        assert!(!s.valid_for(AcademicLevel::JuniorHigh));
    }

    #[test]
    fn criterion_accepts_both_field_spellings() {
        let snake = json!({
            "academic_level": "senior_high",
            "honor_type": "With High Honors",
            "min_gpa": 95.0,
            "min_grade_all": 90.0,
            "require_consistent_honor": true
        });
        let camel = json!({
            "academicLevel": "senior_high",
            "honorType": "With High Honors",
            "minGpa": 95.0,
            "minGradeAll": 90.0,
            "requireConsistentHonor": true
        });
        let a = criterion_from_params("c1".into(), 0, &snake).expect("snake");
        let b = criterion_from_params("c1".into(), 0, &camel).expect("camel");
        assert_eq!(a, b);
        assert_eq!(a.honor_type, "With High Honors");
        assert_eq!(a.min_gpa, Some(95.0));
        assert!(a.require_consistent_honor);
    }

    #[test]
    fn criterion_bounds_sanity() {
        let base = HonorCriterion {
            id: "c".into(),
            level: AcademicLevel::Elementary,
            honor_type: "With Honors".into(),
            min_gpa: None,
            max_gpa: None,
            min_grade: None,
            min_grade_all: None,
            min_year: None,
            max_year: None,
            require_consistent_honor: false,
            sort_order: 0,
        };
        assert!(!base.has_any_bound());

        let mut bounded = base.clone();
        bounded.min_gpa = Some(98.0);
        bounded.max_gpa = Some(90.0);
        assert!(bounded.has_any_bound());
        assert!(!bounded.bounds_ok());

        bounded.max_gpa = Some(100.0);
        assert!(bounded.bounds_ok());
    }
}

use serde::Serialize;
use std::collections::HashMap;

use crate::model::{
    AcademicLevel, AggregatedResult, GradeEntry, PeriodAverage, PeriodCode, PeriodGrade,
    SubjectBreakdown, DEFAULT_QUARTER_WEIGHT,
};

/// Display rounding to 2 decimals. Applied by the IPC layer only; threshold
/// comparisons inside the core always use unrounded values.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Knobs that vary per call rather than per entry. College semester weights
/// come from configuration; everything else is fixed by the level.
#[derive(Debug, Clone)]
pub struct AggregateOptions {
    /// Weights for semesters 1 and 2 at the college level. Renormalized over
    /// the semesters that actually have values.
    pub semester_weights: [f64; 2],
}

impl Default for AggregateOptions {
    fn default() -> Self {
        AggregateOptions {
            semester_weights: [1.0, 1.0],
        }
    }
}

/// Weighted mean of (grade, weight) pairs. Zero total weight yields 0.0, not
/// a division by zero.
pub fn weighted_average(pairs: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0;
    let mut denom = 0.0;
    for (grade, weight) in pairs {
        sum += grade * weight;
        denom += weight;
    }
    if denom > 0.0 {
        sum / denom
    } else {
        0.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn validate_entry(level: AcademicLevel, entry: &GradeEntry) -> Result<(), CalcError> {
    if !entry.period.valid_for(level) {
        return Err(CalcError::new(
            "invalid_period",
            format!(
                "period {} does not belong to the {} period structure",
                entry.period, level
            ),
        )
        .with_details(serde_json::json!({
            "subjectId": entry.subject_id,
            "period": entry.period.code(),
        })));
    }
    if let Some(grade) = entry.grade {
        let (lo, hi) = level.grade_range();
        if !grade.is_finite() || grade < lo || grade > hi {
            return Err(CalcError::new(
                "invalid_grade",
                format!("grade {grade} is outside the {level} scale {lo}-{hi}"),
            )
            .with_details(serde_json::json!({
                "subjectId": entry.subject_id,
                "period": entry.period.code(),
                "grade": grade,
            })));
        }
    }
    Ok(())
}

/// Per-subject average for a quarter-based level: weighted mean over the
/// quarters that carry a grade. Null grades are excluded, never counted as 0.
fn quarter_subject_average(entries: &[&GradeEntry]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = entries
        .iter()
        .filter_map(|e| {
            e.grade
                .map(|g| (g, e.weight.unwrap_or(DEFAULT_QUARTER_WEIGHT)))
        })
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(weighted_average(&pairs))
    }
}

/// Semester values for a semester-based subject: mean of the sub-periods that
/// carry a grade. A semester with neither sub-period recorded yields nothing.
fn semester_values(entries: &[&GradeEntry]) -> [Option<f64>; 2] {
    let mut per_semester: [Vec<f64>; 2] = [Vec::new(), Vec::new()];
    for e in entries {
        let (Some(sem), Some(grade)) = (e.period.semester(), e.grade) else {
            continue;
        };
        per_semester[(sem - 1) as usize].push(grade);
    }
    [mean(&per_semester[0]), mean(&per_semester[1])]
}

fn semester_subject_average(
    level: AcademicLevel,
    entries: &[&GradeEntry],
    opts: &AggregateOptions,
) -> (Option<f64>, [Option<f64>; 2]) {
    let semesters = semester_values(entries);
    let present: Vec<(usize, f64)> = semesters
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|x| (i, x)))
        .collect();
    if present.is_empty() {
        return (None, semesters);
    }

    let average = match level {
        AcademicLevel::College => {
            let total_weight: f64 = present.iter().map(|(i, _)| opts.semester_weights[*i]).sum();
            let pairs: Vec<(f64, f64)> = if total_weight > 0.0 {
                present
                    .iter()
                    .map(|(i, v)| (*v, opts.semester_weights[*i]))
                    .collect()
            } else {
                // Degenerate weight config: fall back to an equal split.
                present.iter().map(|(_, v)| (*v, 1.0)).collect()
            };
            weighted_average(&pairs)
        }
        _ => {
            let vals: Vec<f64> = present.iter().map(|(_, v)| *v).collect();
            mean(&vals).unwrap_or(0.0)
        }
    };
    (Some(average), semesters)
}

/// Period Aggregator: one student's grade entries for one school year, folded
/// into per-subject, per-period, and overall averages using the level's
/// formula. Pure; callers own the store and the criteria.
pub fn aggregate(
    level: AcademicLevel,
    entries: &[GradeEntry],
    opts: &AggregateOptions,
) -> Result<AggregatedResult, CalcError> {
    if entries.is_empty() {
        return Ok(AggregatedResult::empty());
    }
    for entry in entries {
        validate_entry(level, entry)?;
    }

    // Group by subject, first-seen order so output is stable.
    let mut subject_order: Vec<String> = Vec::new();
    let mut by_subject: HashMap<String, Vec<&GradeEntry>> = HashMap::new();
    for e in entries {
        if !by_subject.contains_key(&e.subject_id) {
            subject_order.push(e.subject_id.clone());
        }
        by_subject.entry(e.subject_id.clone()).or_default().push(e);
    }

    let mut subjects: Vec<SubjectBreakdown> = Vec::new();
    let mut min_grade: Option<f64> = None;
    let mut max_grade: Option<f64> = None;
    let mut graded_periods: usize = 0;
    // Keyed by period label; semester levels fold sub-periods into S1/S2.
    let mut period_values: HashMap<String, Vec<f64>> = HashMap::new();
    let mut period_order: Vec<String> = Vec::new();

    for subject_id in &subject_order {
        let subject_entries = &by_subject[subject_id];

        let mut periods: Vec<PeriodGrade> = Vec::new();
        for e in subject_entries.iter() {
            let Some(grade) = e.grade else {
                continue;
            };
            graded_periods += 1;
            min_grade = Some(min_grade.map_or(grade, |m: f64| m.min(grade)));
            max_grade = Some(max_grade.map_or(grade, |m: f64| m.max(grade)));
            periods.push(PeriodGrade {
                period: e.period,
                grade,
            });
        }

        let average = if level.is_quarter_based() {
            for e in subject_entries.iter() {
                let (PeriodCode::Quarter(_), Some(grade)) = (e.period, e.grade) else {
                    continue;
                };
                let label = e.period.code();
                if !period_values.contains_key(&label) {
                    period_order.push(label.clone());
                }
                period_values.entry(label).or_default().push(grade);
            }
            quarter_subject_average(subject_entries)
        } else {
            let (average, semesters) = semester_subject_average(level, subject_entries, opts);
            for (i, sem_value) in semesters.iter().enumerate() {
                let Some(v) = sem_value else { continue };
                let label = format!("S{}", i + 1);
                if !period_values.contains_key(&label) {
                    period_order.push(label.clone());
                }
                period_values.entry(label).or_default().push(*v);
            }
            average
        };

        subjects.push(SubjectBreakdown {
            subject_id: subject_id.clone(),
            average,
            periods,
        });
    }

    let defined: Vec<f64> = subjects.iter().filter_map(|s| s.average).collect();
    let average_grade = mean(&defined).unwrap_or(0.0);

    period_order.sort();
    let period_averages: Vec<PeriodAverage> = period_order
        .iter()
        .map(|label| PeriodAverage {
            period: label.clone(),
            average: mean(&period_values[label]).unwrap_or(0.0),
        })
        .collect();

    Ok(AggregatedResult {
        average_grade,
        min_grade,
        max_grade,
        period_averages,
        total_subjects: subjects.len(),
        subjects,
        graded_periods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SemesterPart;

    fn quarter_entry(subject: &str, quarter: u8, grade: Option<f64>, weight: Option<f64>) -> GradeEntry {
        GradeEntry {
            student_id: "stu-1".into(),
            subject_id: subject.into(),
            level: AcademicLevel::Elementary,
            period: PeriodCode::Quarter(quarter),
            grade,
            weight,
        }
    }

    fn semester_entry(
        level: AcademicLevel,
        subject: &str,
        semester: u8,
        part: SemesterPart,
        grade: Option<f64>,
    ) -> GradeEntry {
        GradeEntry {
            student_id: "stu-1".into(),
            subject_id: subject.into(),
            level,
            period: PeriodCode::Semester { semester, part },
            grade,
            weight: None,
        }
    }

    #[test]
    fn quarter_average_is_weighted_and_normalized() {
        let entries = vec![
            quarter_entry("math", 1, Some(88.0), Some(25.0)),
            quarter_entry("math", 2, Some(90.0), Some(25.0)),
            quarter_entry("math", 3, Some(92.0), Some(25.0)),
            quarter_entry("math", 4, Some(91.0), Some(25.0)),
        ];
        let agg = aggregate(AcademicLevel::Elementary, &entries, &AggregateOptions::default())
            .expect("aggregate");
        assert!((agg.average_grade - 90.25).abs() < 1e-9);
        assert_eq!(agg.total_subjects, 1);
        assert_eq!(agg.graded_periods, 4);
        assert_eq!(agg.min_grade, Some(88.0));
        assert_eq!(agg.max_grade, Some(92.0));
    }

    #[test]
    fn quarter_weights_need_not_sum_to_100() {
        // Two quarters recorded with uneven weights: (90*40 + 80*10) / 50.
        let entries = vec![
            quarter_entry("sci", 1, Some(90.0), Some(40.0)),
            quarter_entry("sci", 2, Some(80.0), Some(10.0)),
        ];
        let agg = aggregate(AcademicLevel::JuniorHigh, &entries, &AggregateOptions::default())
            .expect("aggregate");
        assert!((agg.average_grade - 88.0).abs() < 1e-9);
    }

    #[test]
    fn null_quarter_grades_are_excluded_not_zeroed() {
        let entries = vec![
            quarter_entry("math", 1, Some(90.0), None),
            quarter_entry("math", 2, None, None),
            quarter_entry("math", 3, Some(94.0), None),
        ];
        let agg = aggregate(AcademicLevel::Elementary, &entries, &AggregateOptions::default())
            .expect("aggregate");
        assert!((agg.average_grade - 92.0).abs() < 1e-9);
        assert_eq!(agg.graded_periods, 2);
    }

    #[test]
    fn zero_weight_total_falls_back_to_zero() {
        assert_eq!(weighted_average(&[]), 0.0);
        assert_eq!(weighted_average(&[(90.0, 0.0)]), 0.0);
        let entries = vec![quarter_entry("math", 1, Some(90.0), Some(0.0))];
        let agg = aggregate(AcademicLevel::Elementary, &entries, &AggregateOptions::default())
            .expect("aggregate");
        // The subject still has a defined (zero) average; no NaN, no panic.
        assert_eq!(agg.subjects[0].average, Some(0.0));
    }

    #[test]
    fn all_null_subject_is_excluded_from_overall() {
        let entries = vec![
            quarter_entry("math", 1, Some(90.0), None),
            quarter_entry("pe", 1, None, None),
            quarter_entry("pe", 2, None, None),
        ];
        let agg = aggregate(AcademicLevel::Elementary, &entries, &AggregateOptions::default())
            .expect("aggregate");
        assert_eq!(agg.total_subjects, 2);
        let pe = agg.subjects.iter().find(|s| s.subject_id == "pe").unwrap();
        assert_eq!(pe.average, None);
        assert!((agg.average_grade - 90.0).abs() < 1e-9);
    }

    #[test]
    fn senior_high_semester_is_mean_of_present_subperiods() {
        let lvl = AcademicLevel::SeniorHigh;
        let entries = vec![
            semester_entry(lvl, "stem", 1, SemesterPart::Midterm, Some(91.0)),
            semester_entry(lvl, "stem", 1, SemesterPart::PreFinal, Some(93.0)),
        ];
        let agg = aggregate(lvl, &entries, &AggregateOptions::default()).expect("aggregate");
        assert!((agg.average_grade - 92.0).abs() < 1e-9);
        assert_eq!(agg.period_averages.len(), 1);
        assert_eq!(agg.period_averages[0].period, "S1");
        assert!((agg.period_averages[0].average - 92.0).abs() < 1e-9);
    }

    #[test]
    fn senior_high_missing_semester_is_excluded() {
        let lvl = AcademicLevel::SeniorHigh;
        let entries = vec![
            semester_entry(lvl, "stem", 1, SemesterPart::Midterm, Some(91.0)),
            semester_entry(lvl, "stem", 1, SemesterPart::PreFinal, Some(93.0)),
            semester_entry(lvl, "stem", 2, SemesterPart::Midterm, None),
            semester_entry(lvl, "stem", 2, SemesterPart::PreFinal, None),
        ];
        let agg = aggregate(lvl, &entries, &AggregateOptions::default()).expect("aggregate");
        // S2 contributes nothing; the overall is S1's 92, not 92/2.
        assert!((agg.average_grade - 92.0).abs() < 1e-9);

        let one_sub = vec![semester_entry(lvl, "stem", 2, SemesterPart::PreFinal, Some(88.0))];
        let agg = aggregate(lvl, &one_sub, &AggregateOptions::default()).expect("aggregate");
        assert!((agg.average_grade - 88.0).abs() < 1e-9);
    }

    #[test]
    fn senior_high_subject_without_semesters_is_undefined() {
        let lvl = AcademicLevel::SeniorHigh;
        let entries = vec![
            semester_entry(lvl, "stem", 1, SemesterPart::Midterm, Some(90.0)),
            semester_entry(lvl, "elective", 1, SemesterPart::Midterm, None),
        ];
        let agg = aggregate(lvl, &entries, &AggregateOptions::default()).expect("aggregate");
        let elective = agg.subjects.iter().find(|s| s.subject_id == "elective").unwrap();
        assert_eq!(elective.average, None);
        assert!((agg.average_grade - 90.0).abs() < 1e-9);
    }

    #[test]
    fn college_semester_value_is_exact_mean() {
        let lvl = AcademicLevel::College;
        let entries = vec![
            semester_entry(lvl, "calculus", 1, SemesterPart::Midterm, Some(1.5)),
            semester_entry(lvl, "calculus", 1, SemesterPart::PreFinal, Some(2.0)),
        ];
        let agg = aggregate(lvl, &entries, &AggregateOptions::default()).expect("aggregate");
        assert!((agg.average_grade - 1.75).abs() < 1e-9);
    }

    #[test]
    fn college_weighs_semesters_per_configuration() {
        let lvl = AcademicLevel::College;
        let entries = vec![
            semester_entry(lvl, "calculus", 1, SemesterPart::Midterm, Some(1.0)),
            semester_entry(lvl, "calculus", 2, SemesterPart::Midterm, Some(3.0)),
        ];
        let opts = AggregateOptions {
            semester_weights: [3.0, 1.0],
        };
        let agg = aggregate(lvl, &entries, &opts).expect("aggregate");
        assert!((agg.average_grade - 1.5).abs() < 1e-9);

        // Weights renormalize over present semesters: a one-semester student
        // keeps that semester's value.
        let one = vec![semester_entry(lvl, "calculus", 1, SemesterPart::Midterm, Some(2.25))];
        let agg = aggregate(lvl, &one, &opts).expect("aggregate");
        assert!((agg.average_grade - 2.25).abs() < 1e-9);
    }

    #[test]
    fn empty_input_yields_sentinel() {
        let agg = aggregate(AcademicLevel::SeniorHigh, &[], &AggregateOptions::default())
            .expect("aggregate");
        assert_eq!(agg.average_grade, 0.0);
        assert_eq!(agg.min_grade, None);
        assert_eq!(agg.max_grade, None);
        assert!(!agg.has_grades());
    }

    #[test]
    fn out_of_scale_grade_is_rejected_not_clamped() {
        let entries = vec![quarter_entry("math", 1, Some(104.0), None)];
        let err = aggregate(AcademicLevel::Elementary, &entries, &AggregateOptions::default())
            .expect_err("must reject");
        assert_eq!(err.code, "invalid_grade");

        let lvl = AcademicLevel::College;
        let entries = vec![semester_entry(lvl, "calculus", 1, SemesterPart::Midterm, Some(0.5))];
        let err = aggregate(lvl, &entries, &AggregateOptions::default()).expect_err("must reject");
        assert_eq!(err.code, "invalid_grade");
    }

    #[test]
    fn mismatched_period_shape_is_rejected() {
        let entries = vec![GradeEntry {
            student_id: "stu-1".into(),
            subject_id: "math".into(),
            level: AcademicLevel::College,
            period: PeriodCode::Quarter(1),
            grade: Some(1.5),
            weight: None,
        }];
        let err = aggregate(AcademicLevel::College, &entries, &AggregateOptions::default())
            .expect_err("must reject");
        assert_eq!(err.code, "invalid_period");
    }

    #[test]
    fn aggregation_is_idempotent() {
        let entries = vec![
            quarter_entry("math", 1, Some(88.5), Some(20.0)),
            quarter_entry("math", 2, Some(91.25), Some(30.0)),
            quarter_entry("sci", 1, Some(95.0), None),
        ];
        let a = aggregate(AcademicLevel::JuniorHigh, &entries, &AggregateOptions::default())
            .expect("first");
        let b = aggregate(AcademicLevel::JuniorHigh, &entries, &AggregateOptions::default())
            .expect("second");
        assert_eq!(a, b);
    }

    #[test]
    fn rounding_helper_is_two_decimals() {
        assert_eq!(round_2_decimals(90.248), 90.25);
        assert_eq!(round_2_decimals(92.0), 92.0);
        assert_eq!(round_2_decimals(1.6666666), 1.67);
    }
}

use crate::model::{
    AcademicLevel, AggregatedResult, FailedGrade, GradeEntry, HonorCriterion, Qualification,
    QualificationMetrics, QualificationResult,
};

/// Per-evaluation facts the store supplies alongside the grades: the
/// student's year of study (college only) and whether the student held an
/// honor in the immediately preceding school year (`None` = no record, which
/// fails a consistency check rather than passing it vacuously).
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub year_of_study: Option<i64>,
    pub prior_honor: Option<bool>,
}

/// Qualifier output plus configuration warnings (malformed criteria that were
/// skipped). Warnings go back to the caller; they never abort an evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub result: QualificationResult,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
enum CheckFailure {
    StrictFloor { floor: f64, failed: Vec<FailedGrade> },
    AverageBounds { min: Option<f64>, max: Option<f64> },
    WeakFloor { floor: f64 },
    Consistency,
}

fn base_result(aggregated: &AggregatedResult) -> QualificationResult {
    QualificationResult {
        qualified: false,
        qualifications: Vec::new(),
        honor_type: None,
        average_grade: aggregated.average_grade,
        min_grade: aggregated.min_grade,
        max_grade: aggregated.max_grade,
        period_averages: aggregated.period_averages.clone(),
        total_subjects: aggregated.total_subjects,
        reason: None,
        failed_grades: Vec::new(),
    }
}

fn recorded_grades(entries: &[GradeEntry]) -> impl Iterator<Item = (&GradeEntry, f64)> {
    entries.iter().filter_map(|e| e.grade.map(|g| (e, g)))
}

/// All four checks for one criterion, in reporting-priority order. The first
/// failure is kept for the disqualification reason; a criterion is satisfied
/// only when every check passes.
fn evaluate_criterion(
    criterion: &HonorCriterion,
    aggregated: &AggregatedResult,
    entries: &[GradeEntry],
    ctx: &EvalContext,
) -> Option<CheckFailure> {
    // Strict floor: every recorded grade, every subject, every period. The
    // primary disqualifier, so it is checked (and reported) first.
    if let Some(floor) = criterion.min_grade_all {
        let failed: Vec<FailedGrade> = recorded_grades(entries)
            .filter(|(_, g)| *g < floor)
            .map(|(e, g)| FailedGrade {
                subject_id: e.subject_id.clone(),
                period: e.period,
                grade: g,
            })
            .collect();
        if !failed.is_empty() {
            return Some(CheckFailure::StrictFloor { floor, failed });
        }
    }

    let avg = aggregated.average_grade;
    let below = criterion.min_gpa.map(|lo| avg < lo).unwrap_or(false);
    let above = criterion.max_gpa.map(|hi| avg > hi).unwrap_or(false);
    if below || above {
        return Some(CheckFailure::AverageBounds {
            min: criterion.min_gpa,
            max: criterion.max_gpa,
        });
    }

    // Weak floor: at least one recorded grade reaches it.
    if let Some(floor) = criterion.min_grade {
        let any = recorded_grades(entries).any(|(_, g)| g >= floor);
        if !any {
            return Some(CheckFailure::WeakFloor { floor });
        }
    }

    if criterion.require_consistent_honor && ctx.prior_honor != Some(true) {
        return Some(CheckFailure::Consistency);
    }

    None
}

fn failure_priority(f: &CheckFailure) -> u8 {
    match f {
        CheckFailure::StrictFloor { .. } => 0,
        CheckFailure::AverageBounds { .. } => 1,
        CheckFailure::WeakFloor { .. } => 2,
        CheckFailure::Consistency => 3,
    }
}

fn describe_failure(f: &CheckFailure, avg: f64) -> String {
    match f {
        CheckFailure::StrictFloor { floor, failed } => format!(
            "{} period grade(s) below the required minimum of {}",
            failed.len(),
            floor
        ),
        CheckFailure::AverageBounds { min, max } => match (min, max) {
            (Some(lo), Some(hi)) => {
                format!("average grade {avg:.2} is outside the required range {lo}-{hi}")
            }
            (Some(lo), None) => {
                format!("average grade {avg:.2} is below the required minimum of {lo}")
            }
            (None, Some(hi)) => {
                format!("average grade {avg:.2} is above the allowed maximum of {hi}")
            }
            (None, None) => format!("average grade {avg:.2} does not satisfy the criterion"),
        },
        CheckFailure::WeakFloor { floor } => {
            format!("no period grade reaches the minimum of {floor}")
        }
        CheckFailure::Consistency => {
            "no qualifying honor standing in the preceding school year".to_string()
        }
    }
}

/// Headline ordering: highest `min_gpa` wins; a criterion without one sorts
/// below any that has one; exact ties fall back to insertion order so the
/// outcome never depends on how configuration happened to be stored.
fn headline_gpa(c: &HonorCriterion) -> f64 {
    c.min_gpa.unwrap_or(f64::NEG_INFINITY)
}

/// Honor Qualifier: evaluate one student's aggregation against the configured
/// criteria for the student's level. Stateless; one call per student per
/// reporting run.
pub fn evaluate(
    level: AcademicLevel,
    aggregated: &AggregatedResult,
    entries: &[GradeEntry],
    criteria: &[HonorCriterion],
    ctx: &EvalContext,
) -> Evaluation {
    let mut result = base_result(aggregated);
    let mut warnings: Vec<String> = Vec::new();

    if !aggregated.has_grades() {
        result.reason = Some("no grades recorded".to_string());
        return Evaluation { result, warnings };
    }

    let mut applicable: Vec<&HonorCriterion> = Vec::new();
    for c in criteria.iter().filter(|c| c.level == level) {
        if !c.has_any_bound() {
            // A blank criterion matches nothing; matching everything would
            // hand out honors on a misconfigured row.
            warnings.push(format!(
                "criterion {} ({}) has no bounds and was skipped",
                c.id, c.honor_type
            ));
            continue;
        }
        if !c.bounds_ok() {
            warnings.push(format!(
                "criterion {} ({}) has min above max and was skipped",
                c.id, c.honor_type
            ));
            continue;
        }
        if level.tracks_year_of_study() {
            if c.min_year.is_some() || c.max_year.is_some() {
                let Some(year) = ctx.year_of_study else {
                    continue;
                };
                if c.min_year.map(|lo| year < lo).unwrap_or(false)
                    || c.max_year.map(|hi| year > hi).unwrap_or(false)
                {
                    continue;
                }
            }
        }
        applicable.push(c);
    }

    if applicable.is_empty() {
        result.reason = Some("no honor criteria configured".to_string());
        return Evaluation { result, warnings };
    }

    let mut passing: Vec<&HonorCriterion> = Vec::new();
    let mut failures: Vec<(&HonorCriterion, CheckFailure)> = Vec::new();
    for c in &applicable {
        match evaluate_criterion(c, aggregated, entries, ctx) {
            None => passing.push(c),
            Some(f) => failures.push((c, f)),
        }
    }

    if passing.is_empty() {
        // Report the most telling failure: a strict-floor violation beats an
        // average shortfall, which beats the softer gates.
        if let Some((_, failure)) = failures
            .iter()
            .min_by_key(|(c, f)| (failure_priority(f), c.sort_order))
        {
            result.reason = Some(describe_failure(failure, aggregated.average_grade));
            if let CheckFailure::StrictFloor { failed, .. } = failure {
                result.failed_grades = failed.clone();
            }
        }
        return Evaluation { result, warnings };
    }

    passing.sort_by(|a, b| {
        headline_gpa(b)
            .partial_cmp(&headline_gpa(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.sort_order.cmp(&b.sort_order))
    });

    let metrics = QualificationMetrics {
        average_grade: aggregated.average_grade,
        min_grade: aggregated.min_grade,
        max_grade: aggregated.max_grade,
        total_subjects: aggregated.total_subjects,
    };
    result.qualified = true;
    result.honor_type = Some(passing[0].honor_type.clone());
    result.qualifications = passing
        .iter()
        .map(|c| Qualification {
            honor_type: c.honor_type.clone(),
            criterion: (*c).clone(),
            metrics: metrics.clone(),
        })
        .collect();

    Evaluation { result, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{aggregate, AggregateOptions};
    use crate::model::{PeriodCode, SemesterPart};

    fn entry(subject: &str, quarter: u8, grade: f64) -> GradeEntry {
        GradeEntry {
            student_id: "stu-1".into(),
            subject_id: subject.into(),
            level: AcademicLevel::JuniorHigh,
            period: PeriodCode::Quarter(quarter),
            grade: Some(grade),
            weight: None,
        }
    }

    fn criterion(id: &str, honor_type: &str, sort_order: i64) -> HonorCriterion {
        HonorCriterion {
            id: id.into(),
            level: AcademicLevel::JuniorHigh,
            honor_type: honor_type.into(),
            min_gpa: None,
            max_gpa: None,
            min_grade: None,
            min_grade_all: None,
            min_year: None,
            max_year: None,
            require_consistent_honor: false,
            sort_order,
        }
    }

    fn aggregate_of(entries: &[GradeEntry]) -> AggregatedResult {
        aggregate(AcademicLevel::JuniorHigh, entries, &AggregateOptions::default())
            .expect("aggregate")
    }

    #[test]
    fn qualifies_on_open_ended_minimum_average() {
        let entries = vec![
            entry("math", 1, 88.0),
            entry("math", 2, 90.0),
            entry("math", 3, 92.0),
            entry("math", 4, 91.0),
        ];
        let agg = aggregate_of(&entries);
        let mut c = criterion("c1", "With Honors", 0);
        c.min_gpa = Some(90.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c],
            &EvalContext::default(),
        );
        assert!(eval.result.qualified);
        assert_eq!(eval.result.honor_type.as_deref(), Some("With Honors"));
        assert!((eval.result.average_grade - 90.25).abs() < 1e-9);
        assert!(eval.warnings.is_empty());
    }

    #[test]
    fn strict_floor_beats_high_average() {
        // Average ~95 but one 70: a single low grade anywhere disqualifies.
        let entries = vec![
            entry("math", 1, 98.0),
            entry("math", 2, 99.0),
            entry("sci", 1, 70.0),
            entry("sci", 2, 99.0),
            entry("eng", 1, 99.0),
            entry("eng", 2, 99.0),
        ];
        let agg = aggregate_of(&entries);
        assert!(agg.average_grade > 90.0);

        let mut c = criterion("c1", "With High Honors", 0);
        c.min_gpa = Some(90.0);
        c.min_grade_all = Some(85.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert_eq!(eval.result.failed_grades.len(), 1);
        let fail = &eval.result.failed_grades[0];
        assert_eq!(fail.subject_id, "sci");
        assert_eq!(fail.period, PeriodCode::Quarter(1));
        assert_eq!(fail.grade, 70.0);
        assert!(eval.result.reason.as_deref().unwrap().contains("85"));
    }

    #[test]
    fn highest_min_gpa_is_headline_among_multiple_passes() {
        let entries = vec![entry("math", 1, 96.0), entry("math", 2, 96.0)];
        let agg = aggregate_of(&entries);

        let mut honors = criterion("c1", "With Honors", 0);
        honors.min_gpa = Some(90.0);
        let mut high = criterion("c2", "With High Honors", 1);
        high.min_gpa = Some(95.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[honors, high],
            &EvalContext::default(),
        );
        assert!(eval.result.qualified);
        assert_eq!(eval.result.honor_type.as_deref(), Some("With High Honors"));
        assert_eq!(eval.result.qualifications.len(), 2);
        assert_eq!(eval.result.qualifications[0].honor_type, "With High Honors");
        assert_eq!(eval.result.qualifications[1].honor_type, "With Honors");
    }

    #[test]
    fn equal_thresholds_break_ties_by_insertion_order() {
        let entries = vec![entry("math", 1, 96.0)];
        let agg = aggregate_of(&entries);

        let mut first = criterion("c1", "Dean's List A", 0);
        first.min_gpa = Some(95.0);
        let mut second = criterion("c2", "Dean's List B", 1);
        second.min_gpa = Some(95.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[first, second],
            &EvalContext::default(),
        );
        assert!(eval.result.qualified);
        assert_eq!(eval.result.honor_type.as_deref(), Some("Dean's List A"));
        assert_eq!(eval.result.qualifications.len(), 2);
    }

    #[test]
    fn no_grades_never_qualifies() {
        let agg = AggregatedResult::empty();
        let mut c = criterion("c1", "With Honors", 0);
        c.min_gpa = Some(0.0);
        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &[],
            &[c],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert_eq!(eval.result.reason.as_deref(), Some("no grades recorded"));
    }

    #[test]
    fn missing_criteria_is_a_recoverable_state() {
        let entries = vec![entry("math", 1, 96.0)];
        let agg = aggregate_of(&entries);
        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert_eq!(
            eval.result.reason.as_deref(),
            Some("no honor criteria configured")
        );
    }

    #[test]
    fn blank_criterion_matches_nothing() {
        let entries = vec![entry("math", 1, 96.0)];
        let agg = aggregate_of(&entries);
        let blank = criterion("c1", "With Honors", 0);
        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[blank],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert_eq!(eval.warnings.len(), 1);
        assert_eq!(
            eval.result.reason.as_deref(),
            Some("no honor criteria configured")
        );
    }

    #[test]
    fn inverted_bounds_are_skipped_with_warning_not_fatal() {
        let entries = vec![entry("math", 1, 96.0)];
        let agg = aggregate_of(&entries);

        let mut broken = criterion("c1", "Broken", 0);
        broken.min_gpa = Some(98.0);
        broken.max_gpa = Some(90.0);
        let mut valid = criterion("c2", "With Honors", 1);
        valid.min_gpa = Some(90.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[broken, valid],
            &EvalContext::default(),
        );
        // The valid criterion still gets its evaluation.
        assert!(eval.result.qualified);
        assert_eq!(eval.result.honor_type.as_deref(), Some("With Honors"));
        assert_eq!(eval.warnings.len(), 1);
        assert!(eval.warnings[0].contains("c1"));
    }

    #[test]
    fn weak_floor_requires_one_grade_at_or_above() {
        let entries = vec![entry("math", 1, 80.0), entry("math", 2, 82.0)];
        let agg = aggregate_of(&entries);
        let mut c = criterion("c1", "With Honors", 0);
        c.min_grade = Some(85.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c.clone()],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert!(eval.result.reason.as_deref().unwrap().contains("85"));

        let entries = vec![entry("math", 1, 80.0), entry("math", 2, 86.0)];
        let agg = aggregate_of(&entries);
        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c],
            &EvalContext::default(),
        );
        assert!(eval.result.qualified);
    }

    #[test]
    fn consistency_check_fails_without_prior_data() {
        let entries = vec![entry("math", 1, 96.0)];
        let agg = aggregate_of(&entries);
        let mut c = criterion("c1", "Consistent Honors", 0);
        c.min_gpa = Some(90.0);
        c.require_consistent_honor = true;

        let no_data = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c.clone()],
            &EvalContext::default(),
        );
        assert!(!no_data.result.qualified);
        assert!(no_data
            .result
            .reason
            .as_deref()
            .unwrap()
            .contains("preceding"));

        let with_prior = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[c],
            &EvalContext {
                year_of_study: None,
                prior_honor: Some(true),
            },
        );
        assert!(with_prior.result.qualified);
    }

    #[test]
    fn year_bounds_apply_at_college_only() {
        let entries = vec![GradeEntry {
            student_id: "stu-1".into(),
            subject_id: "calculus".into(),
            level: AcademicLevel::College,
            period: PeriodCode::Semester {
                semester: 1,
                part: SemesterPart::Midterm,
            },
            grade: Some(1.25),
            weight: None,
        }];
        let agg = aggregate(AcademicLevel::College, &entries, &AggregateOptions::default())
            .expect("aggregate");

        let mut c = criterion("c1", "Dean's List", 0);
        c.level = AcademicLevel::College;
        c.min_gpa = Some(1.0);
        c.max_gpa = Some(1.5);
        c.min_year = Some(2);

        // Year below the bound: criterion filtered out.
        let eval = evaluate(
            AcademicLevel::College,
            &agg,
            &entries,
            &[c.clone()],
            &EvalContext {
                year_of_study: Some(1),
                prior_honor: None,
            },
        );
        assert!(!eval.result.qualified);

        // Year inside the bound.
        let eval = evaluate(
            AcademicLevel::College,
            &agg,
            &entries,
            &[c.clone()],
            &EvalContext {
                year_of_study: Some(3),
                prior_honor: None,
            },
        );
        assert!(eval.result.qualified);

        // Year untracked in the data: bounded criterion cannot apply.
        let eval = evaluate(
            AcademicLevel::College,
            &agg,
            &entries,
            &[c],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
    }

    #[test]
    fn reason_prioritizes_strict_floor_over_average_bounds() {
        let entries = vec![entry("math", 1, 80.0), entry("math", 2, 95.0)];
        let agg = aggregate_of(&entries);

        let mut avg_only = criterion("c1", "With Highest Honors", 0);
        avg_only.min_gpa = Some(98.0);
        let mut floor = criterion("c2", "With Honors", 1);
        floor.min_gpa = Some(85.0);
        floor.min_grade_all = Some(85.0);

        let eval = evaluate(
            AcademicLevel::JuniorHigh,
            &agg,
            &entries,
            &[avg_only, floor],
            &EvalContext::default(),
        );
        assert!(!eval.result.qualified);
        assert!(eval
            .result
            .reason
            .as_deref()
            .unwrap()
            .contains("below the required minimum of 85"));
        assert_eq!(eval.result.failed_grades.len(), 1);
        assert_eq!(eval.result.failed_grades[0].grade, 80.0);
    }
}

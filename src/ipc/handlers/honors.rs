use crate::calc::{self, AggregateOptions};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{AcademicLevel, AggregatedResult, QualificationResult};
use crate::qualify::{self, EvalContext};
use serde_json::json;
use uuid::Uuid;

fn parse_aggregate_options(params: &serde_json::Value) -> Result<AggregateOptions, String> {
    let Some(raw) = params.get("semesterWeights") else {
        return Ok(AggregateOptions::default());
    };
    if raw.is_null() {
        return Ok(AggregateOptions::default());
    }
    let arr = raw
        .as_array()
        .ok_or_else(|| "semesterWeights must be an array of two numbers".to_string())?;
    if arr.len() != 2 {
        return Err("semesterWeights must have exactly two entries".to_string());
    }
    let mut weights = [0.0_f64; 2];
    for (i, v) in arr.iter().enumerate() {
        weights[i] = v
            .as_f64()
            .ok_or_else(|| "semesterWeights entries must be numbers".to_string())?;
        if weights[i] < 0.0 {
            return Err("semesterWeights entries must not be negative".to_string());
        }
    }
    Ok(AggregateOptions {
        semester_weights: weights,
    })
}

/// Rounding happens here at the presentation boundary. The qualifier has
/// already compared against thresholds using the unrounded values.
fn round_aggregated(mut agg: AggregatedResult) -> AggregatedResult {
    agg.average_grade = calc::round_2_decimals(agg.average_grade);
    agg.min_grade = agg.min_grade.map(calc::round_2_decimals);
    agg.max_grade = agg.max_grade.map(calc::round_2_decimals);
    for p in &mut agg.period_averages {
        p.average = calc::round_2_decimals(p.average);
    }
    for s in &mut agg.subjects {
        s.average = s.average.map(calc::round_2_decimals);
    }
    agg
}

fn round_qualification(mut result: QualificationResult) -> QualificationResult {
    result.average_grade = calc::round_2_decimals(result.average_grade);
    result.min_grade = result.min_grade.map(calc::round_2_decimals);
    result.max_grade = result.max_grade.map(calc::round_2_decimals);
    for p in &mut result.period_averages {
        p.average = calc::round_2_decimals(p.average);
    }
    for q in &mut result.qualifications {
        q.metrics.average_grade = calc::round_2_decimals(q.metrics.average_grade);
        q.metrics.min_grade = q.metrics.min_grade.map(calc::round_2_decimals);
        q.metrics.max_grade = q.metrics.max_grade.map(calc::round_2_decimals);
    }
    result
}

struct StudentEvaluation {
    student_id: String,
    display_name: String,
    has_grades: bool,
    average_grade: f64,
    result: QualificationResult,
    warnings: Vec<String>,
}

fn evaluate_student(
    conn: &rusqlite::Connection,
    student: &db::StudentRow,
    school_year: &str,
    opts: &AggregateOptions,
) -> anyhow::Result<Result<StudentEvaluation, calc::CalcError>> {
    let entries = db::load_grade_entries(conn, &student.id, student.level, school_year)?;
    let aggregated = match calc::aggregate(student.level, &entries, opts) {
        Ok(a) => a,
        Err(e) => return Ok(Err(e)),
    };
    let criteria = db::load_criteria(conn, student.level)?;
    let ctx = EvalContext {
        year_of_study: student.year_of_study,
        prior_honor: db::prior_honor(conn, &student.id, school_year)?,
    };
    let evaluation = qualify::evaluate(student.level, &aggregated, &entries, &criteria, &ctx);
    Ok(Ok(StudentEvaluation {
        student_id: student.id.clone(),
        display_name: format!("{}, {}", student.last_name, student.first_name),
        has_grades: aggregated.has_grades(),
        average_grade: aggregated.average_grade,
        result: evaluation.result,
        warnings: evaluation.warnings,
    }))
}

fn handle_honors_aggregate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let school_year = match req.params.get("schoolYear").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolYear", None),
    };
    let opts = match parse_aggregate_options(&req.params) {
        Ok(o) => o,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let student = match db::load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let entries = match db::load_grade_entries(conn, &student_id, student.level, &school_year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match calc::aggregate(student.level, &entries, &opts) {
        Ok(agg) => ok(
            &req.id,
            json!({
                "level": student.level.as_str(),
                "schoolYear": school_year,
                "aggregated": round_aggregated(agg),
            }),
        ),
        Err(e) => err(&req.id, &e.code.clone(), e.message, e.details),
    }
}

fn handle_honors_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let school_year = match req.params.get("schoolYear").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolYear", None),
    };
    let opts = match parse_aggregate_options(&req.params) {
        Ok(o) => o,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let student = match db::load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match evaluate_student(conn, &student, &school_year, &opts) {
        Ok(Ok(eval)) => ok(
            &req.id,
            json!({
                "level": student.level.as_str(),
                "schoolYear": school_year,
                "result": round_qualification(eval.result),
                "warnings": eval.warnings,
            }),
        ),
        Ok(Err(e)) => err(&req.id, &e.code.clone(), e.message, e.details),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Batch honor roll for one level and school year. Every active student at
/// the level is evaluated independently; `commit: true` persists the outcome
/// so the following year's consistency checks can see it.
fn handle_honors_roll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let level = match req
        .params
        .get("level")
        .and_then(|v| v.as_str())
        .and_then(AcademicLevel::parse)
    {
        Some(l) => l,
        None => return err(&req.id, "bad_params", "missing or unknown level", None),
    };
    let school_year = match req.params.get("schoolYear").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing schoolYear", None),
    };
    let commit = req
        .params
        .get("commit")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let opts = match parse_aggregate_options(&req.params) {
        Ok(o) => o,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let student_ids: Result<Vec<String>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT id FROM students WHERE level = ? AND active = 1
             ORDER BY last_name, first_name",
        )?;
        let rows = stmt.query_map([level.as_str()], |r| r.get::<_, String>(0))?;
        rows.collect()
    })();
    let student_ids = match student_ids {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut evaluations: Vec<StudentEvaluation> = Vec::new();
    for student_id in &student_ids {
        let student = match db::load_student(conn, student_id) {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match evaluate_student(conn, &student, &school_year, &opts) {
            Ok(Ok(eval)) => evaluations.push(eval),
            Ok(Err(e)) => {
                return err(
                    &req.id,
                    &e.code.clone(),
                    format!("student {student_id}: {}", e.message),
                    e.details,
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    // Rank by average; the college scale is inverted so lower sorts first
    // there. Students without grades always trail.
    evaluations.sort_by(|a, b| {
        let key = |s: &StudentEvaluation| (!s.has_grades, s.average_grade);
        let (an, aavg) = key(a);
        let (bn, bavg) = key(b);
        an.cmp(&bn).then_with(|| {
            let ord = aavg.partial_cmp(&bavg).unwrap_or(std::cmp::Ordering::Equal);
            if level == AcademicLevel::College {
                ord
            } else {
                ord.reverse()
            }
        })
    });

    if commit {
        let tx = match conn.unchecked_transaction() {
            Ok(t) => t,
            Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
        };
        let evaluated_at = db::now_rfc3339();
        for eval in &evaluations {
            let inserted = tx.execute(
                "INSERT INTO honor_results(id, student_id, school_year, qualified, honor_type, average_grade, evaluated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, school_year) DO UPDATE SET
                   qualified = excluded.qualified,
                   honor_type = excluded.honor_type,
                   average_grade = excluded.average_grade,
                   evaluated_at = excluded.evaluated_at",
                (
                    Uuid::new_v4().to_string(),
                    &eval.student_id,
                    &school_year,
                    eval.result.qualified as i64,
                    eval.result.honor_type.as_deref(),
                    eval.average_grade,
                    &evaluated_at,
                ),
            );
            if let Err(e) = inserted {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "honor_results" })),
                );
            }
        }
        if let Err(e) = tx.commit() {
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
    }

    let qualified_count = evaluations.iter().filter(|e| e.result.qualified).count();
    let roll: Vec<serde_json::Value> = evaluations
        .into_iter()
        .map(|eval| {
            let warnings = eval.warnings;
            let result = round_qualification(eval.result);
            json!({
                "studentId": eval.student_id,
                "displayName": eval.display_name,
                "qualified": result.qualified,
                "honorType": result.honor_type,
                "averageGrade": result.average_grade,
                "reason": result.reason,
                "failedGrades": result.failed_grades,
                "warnings": warnings,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "level": level.as_str(),
            "schoolYear": school_year,
            "committed": commit,
            "evaluatedCount": roll.len(),
            "qualifiedCount": qualified_count,
            "roll": roll,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "honors.aggregate" => Some(handle_honors_aggregate(state, req)),
        "honors.evaluate" => Some(handle_honors_evaluate(state, req)),
        "honors.roll" => Some(handle_honors_roll(state, req)),
        _ => None,
    }
}

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::PeriodCode;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Batch upsert of grade entries for one student and school year. The store
/// owns the lifecycle rules: submitted rows are immutable and drafts close
/// for editing after the window elapses.
fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let entries = match req.params.get("entries").and_then(|v| v.as_array()) {
        Some(v) if !v.is_empty() => v.clone(),
        _ => return err(&req.id, "bad_params", "entries must be a non-empty array", None),
    };

    let student = match db::load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (scale_lo, scale_hi) = student.level.grade_range();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let now = Utc::now();
    let now_text = now.to_rfc3339();
    let mut inserted = 0_usize;
    let mut updated = 0_usize;

    for (i, raw) in entries.iter().enumerate() {
        let subject_id = match raw.get("subjectId").and_then(|v| v.as_str()) {
            Some(v) => v.to_string(),
            None => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "bad_params",
                    format!("entries[{i}]: missing subjectId"),
                    None,
                );
            }
        };
        let period = match raw.get("period").and_then(|v| v.as_str()).and_then(PeriodCode::parse) {
            Some(p) => p,
            None => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "bad_params",
                    format!("entries[{i}]: missing or unknown period"),
                    None,
                );
            }
        };
        if !period.valid_for(student.level) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "invalid_period",
                format!(
                    "entries[{i}]: period {} does not belong to the {} period structure",
                    period, student.level
                ),
                Some(json!({ "subjectId": subject_id, "period": period.code() })),
            );
        }

        let grade = match raw.get("grade") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_f64() {
                Some(g) => Some(g),
                None => {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "bad_params",
                        format!("entries[{i}]: grade must be a number or null"),
                        None,
                    );
                }
            },
        };
        if let Some(g) = grade {
            if !g.is_finite() || g < scale_lo || g > scale_hi {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "invalid_grade",
                    format!(
                        "entries[{i}]: grade {g} is outside the {} scale {scale_lo}-{scale_hi}",
                        student.level
                    ),
                    Some(json!({ "subjectId": subject_id, "period": period.code(), "grade": g })),
                );
            }
        }
        let weight = raw.get("weight").and_then(|v| v.as_f64());

        let subject_exists: Option<i64> = match tx
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if subject_exists.is_none() {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                format!("entries[{i}]: subject not found"),
                Some(json!({ "subjectId": subject_id })),
            );
        }

        let existing: Option<(String, String, String)> = match tx
            .query_row(
                "SELECT id, status, recorded_at FROM grade_entries
                 WHERE student_id = ? AND subject_id = ? AND school_year = ? AND period = ?",
                (&student_id, &subject_id, &school_year, period.code()),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        match existing {
            None => {
                if let Err(e) = tx.execute(
                    "INSERT INTO grade_entries(id, student_id, subject_id, school_year, period, grade, weight, status, recorded_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?, 'draft', ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &student_id,
                        &subject_id,
                        &school_year,
                        period.code(),
                        grade,
                        weight,
                        &now_text,
                    ),
                ) {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "db_insert_failed",
                        e.to_string(),
                        Some(json!({ "table": "grade_entries" })),
                    );
                }
                inserted += 1;
            }
            Some((entry_id, status, recorded_at)) => {
                if status == "submitted" {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "grade_locked",
                        format!("entries[{i}]: grade already submitted for validation"),
                        Some(json!({ "entryId": entry_id })),
                    );
                }
                if !db::edit_window_open(&recorded_at, now) {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "edit_window_closed",
                        format!(
                            "entries[{i}]: edit window of {} days has elapsed",
                            db::EDIT_WINDOW_DAYS
                        ),
                        Some(json!({ "entryId": entry_id, "recordedAt": recorded_at })),
                    );
                }
                if let Err(e) = tx.execute(
                    "UPDATE grade_entries SET grade = ?, weight = ?, updated_at = ? WHERE id = ?",
                    (grade, weight, &now_text, &entry_id),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                updated += 1;
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "inserted": inserted, "updated": updated }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT id, subject_id, period, grade, weight, status, recorded_at, updated_at
         FROM grade_entries
         WHERE student_id = ? AND school_year = ?
         ORDER BY subject_id, period",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &school_year), |row| {
            let id: String = row.get(0)?;
            let subject_id: String = row.get(1)?;
            let period: String = row.get(2)?;
            let grade: Option<f64> = row.get(3)?;
            let weight: Option<f64> = row.get(4)?;
            let status: String = row.get(5)?;
            let recorded_at: String = row.get(6)?;
            let updated_at: Option<String> = row.get(7)?;
            Ok(json!({
                "id": id,
                "subjectId": subject_id,
                "period": period,
                "grade": grade,
                "weight": weight,
                "status": status,
                "recordedAt": recorded_at,
                "updatedAt": updated_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Marks a student's draft grades as submitted for validation, after which
/// the store refuses edits regardless of the window.
fn handle_grades_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = req
        .params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let submitted = conn.execute(
        "UPDATE grade_entries SET status = 'submitted', updated_at = ?1
         WHERE student_id = ?2 AND school_year = ?3 AND status = 'draft'
           AND (?4 IS NULL OR subject_id = ?4)",
        (db::now_rfc3339(), &student_id, &school_year, subject_id),
    );
    match submitted {
        Ok(count) => ok(&req.id, json!({ "submitted": count })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.submit" => Some(handle_grades_submit(state, req)),
        _ => None,
    }
}

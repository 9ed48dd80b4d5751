use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{criterion_from_params, AcademicLevel, HonorCriterion};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Configuration sanity is advisory at write time: a registrar may stage a
/// criterion before filling the bounds in, so problems come back as warnings
/// while the row is still saved. The qualifier skips such rows at read time.
fn config_warnings(criterion: &HonorCriterion) -> Vec<String> {
    let mut warnings = Vec::new();
    if !criterion.has_any_bound() {
        warnings.push("criterion has no bounds and will never match".to_string());
    }
    if !criterion.bounds_ok() {
        warnings.push("criterion has min above max and will be skipped".to_string());
    }
    warnings
}

fn insert_criterion(conn: &Connection, c: &HonorCriterion) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO honor_criteria(id, level, honor_type, min_gpa, max_gpa, min_grade,
                                    min_grade_all, min_year, max_year, require_consistent_honor, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &c.id,
            c.level.as_str(),
            &c.honor_type,
            c.min_gpa,
            c.max_gpa,
            c.min_grade,
            c.min_grade_all,
            c.min_year,
            c.max_year,
            c.require_consistent_honor as i64,
            c.sort_order,
        ),
    )?;
    Ok(())
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM honor_criteria",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let criterion = match criterion_from_params(Uuid::new_v4().to_string(), next_sort, &req.params)
    {
        Ok(c) => c,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    if let Err(e) = insert_criterion(conn, &criterion) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "honor_criteria" })),
        );
    }

    ok(
        &req.id,
        json!({
            "criterion": criterion,
            "warnings": config_warnings(&criterion),
        }),
    )
}

fn handle_criteria_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "criteria": [] }));
    };

    let level_filter = match req.params.get("level").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match AcademicLevel::parse(raw) {
            Some(l) => Some(l),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown academic level: {raw}"),
                    None,
                )
            }
        },
    };

    let levels: Vec<AcademicLevel> = match level_filter {
        Some(l) => vec![l],
        None => vec![
            AcademicLevel::Elementary,
            AcademicLevel::JuniorHigh,
            AcademicLevel::SeniorHigh,
            AcademicLevel::College,
        ],
    };

    let mut criteria: Vec<HonorCriterion> = Vec::new();
    for level in levels {
        match crate::db::load_criteria(conn, level) {
            Ok(mut batch) => criteria.append(&mut batch),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    criteria.sort_by_key(|c| c.sort_order);

    let annotated: Vec<serde_json::Value> = criteria
        .iter()
        .map(|c| {
            json!({
                "criterion": c,
                "warnings": config_warnings(c),
            })
        })
        .collect();
    ok(&req.id, json!({ "criteria": annotated }))
}

fn handle_criteria_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let criterion_id = match req.params.get("criterionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing criterionId", None),
    };

    let sort_order: Option<i64> = match conn
        .query_row(
            "SELECT sort_order FROM honor_criteria WHERE id = ?",
            [&criterion_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(sort_order) = sort_order else {
        return err(&req.id, "not_found", "criterion not found", None);
    };

    let criterion = match criterion_from_params(criterion_id.clone(), sort_order, &req.params) {
        Ok(c) => c,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let updated = conn.execute(
        "UPDATE honor_criteria
         SET level = ?, honor_type = ?, min_gpa = ?, max_gpa = ?, min_grade = ?,
             min_grade_all = ?, min_year = ?, max_year = ?, require_consistent_honor = ?
         WHERE id = ?",
        (
            criterion.level.as_str(),
            &criterion.honor_type,
            criterion.min_gpa,
            criterion.max_gpa,
            criterion.min_grade,
            criterion.min_grade_all,
            criterion.min_year,
            criterion.max_year,
            criterion.require_consistent_honor as i64,
            &criterion_id,
        ),
    );
    if let Err(e) = updated {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "criterion": criterion,
            "warnings": config_warnings(&criterion),
        }),
    )
}

fn handle_criteria_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let criterion_id = match req.params.get("criterionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing criterionId", None),
    };

    match conn.execute("DELETE FROM honor_criteria WHERE id = ?", [&criterion_id]) {
        Ok(0) => err(&req.id, "not_found", "criterion not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "criteria.create" => Some(handle_criteria_create(state, req)),
        "criteria.list" => Some(handle_criteria_list(state, req)),
        "criteria.update" => Some(handle_criteria_update(state, req)),
        "criteria.delete" => Some(handle_criteria_delete(state, req)),
        _ => None,
    }
}

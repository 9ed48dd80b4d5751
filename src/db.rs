use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::model::{AcademicLevel, GradeEntry, HonorCriterion, PeriodCode};

pub const DB_FILE: &str = "honors.sqlite3";

/// Instructor edit window on a draft grade, counted from `recorded_at`.
/// Enforced here in the store; the aggregation core never sees mutable rows.
pub const EDIT_WINDOW_DAYS: i64 = 5;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            level TEXT NOT NULL,
            year_of_study INTEGER,
            active INTEGER NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_level ON students(level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            level TEXT NOT NULL,
            UNIQUE(code, level)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            period TEXT NOT NULL,
            grade REAL,
            weight REAL,
            status TEXT NOT NULL DEFAULT 'draft',
            recorded_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, school_year, period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student_year
         ON grade_entries(student_id, school_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_criteria(
            id TEXT PRIMARY KEY,
            level TEXT NOT NULL,
            honor_type TEXT NOT NULL,
            min_gpa REAL,
            max_gpa REAL,
            min_grade REAL,
            min_grade_all REAL,
            min_year INTEGER,
            max_year INTEGER,
            require_consistent_honor INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criteria_level ON honor_criteria(level)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS honor_results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            school_year TEXT NOT NULL,
            qualified INTEGER NOT NULL,
            honor_type TEXT,
            average_grade REAL NOT NULL,
            evaluated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, school_year)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Whether a draft grade recorded at `recorded_at` may still be edited.
/// Unparseable timestamps close the window rather than leaving it open.
pub fn edit_window_open(recorded_at: &str, now: DateTime<Utc>) -> bool {
    let Ok(recorded) = DateTime::parse_from_rfc3339(recorded_at) else {
        return false;
    };
    now - recorded.with_timezone(&Utc) <= Duration::days(EDIT_WINDOW_DAYS)
}

/// School years are `YYYY-YYYY` strings; the predecessor of 2025-2026 is
/// 2024-2025. Anything malformed has no predecessor.
pub fn previous_school_year(school_year: &str) -> Option<String> {
    let (start, end) = school_year.split_once('-')?;
    let start: i64 = start.trim().parse().ok()?;
    let end: i64 = end.trim().parse().ok()?;
    if end != start + 1 || start < 1 {
        return None;
    }
    Some(format!("{}-{}", start - 1, start))
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub level: AcademicLevel,
    pub year_of_study: Option<i64>,
    pub active: bool,
}

pub fn load_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<StudentRow>> {
    let row = conn
        .query_row(
            "SELECT id, last_name, first_name, level, year_of_study, active
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<i64>>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((id, last_name, first_name, level_raw, year_of_study, active)) = row else {
        return Ok(None);
    };
    let level = AcademicLevel::parse(&level_raw)
        .ok_or_else(|| anyhow::anyhow!("student {id} has unknown level {level_raw}"))?;
    Ok(Some(StudentRow {
        id,
        last_name,
        first_name,
        level,
        year_of_study,
        active: active != 0,
    }))
}

/// All grade entries for one student and school year, shaped for the
/// aggregation core. Rows with period codes the model no longer recognizes
/// are surfaced as errors instead of silently skewing an average.
pub fn load_grade_entries(
    conn: &Connection,
    student_id: &str,
    level: AcademicLevel,
    school_year: &str,
) -> anyhow::Result<Vec<GradeEntry>> {
    let mut stmt = conn.prepare(
        "SELECT subject_id, period, grade, weight
         FROM grade_entries
         WHERE student_id = ? AND school_year = ?
         ORDER BY subject_id, period",
    )?;
    let rows = stmt.query_map((student_id, school_year), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<f64>>(2)?,
            r.get::<_, Option<f64>>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (subject_id, period_raw, grade, weight) = row?;
        let period = PeriodCode::parse(&period_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown period code in store: {period_raw}"))?;
        entries.push(GradeEntry {
            student_id: student_id.to_string(),
            subject_id,
            level,
            period,
            grade,
            weight,
        });
    }
    Ok(entries)
}

pub fn load_criteria(conn: &Connection, level: AcademicLevel) -> anyhow::Result<Vec<HonorCriterion>> {
    let mut stmt = conn.prepare(
        "SELECT id, level, honor_type, min_gpa, max_gpa, min_grade, min_grade_all,
                min_year, max_year, require_consistent_honor, sort_order
         FROM honor_criteria
         WHERE level = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt.query_map([level.as_str()], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, Option<f64>>(3)?,
            r.get::<_, Option<f64>>(4)?,
            r.get::<_, Option<f64>>(5)?,
            r.get::<_, Option<f64>>(6)?,
            r.get::<_, Option<i64>>(7)?,
            r.get::<_, Option<i64>>(8)?,
            r.get::<_, i64>(9)?,
            r.get::<_, i64>(10)?,
        ))
    })?;

    let mut criteria = Vec::new();
    for row in rows {
        let (
            id,
            level_raw,
            honor_type,
            min_gpa,
            max_gpa,
            min_grade,
            min_grade_all,
            min_year,
            max_year,
            require_consistent_honor,
            sort_order,
        ) = row?;
        let level = AcademicLevel::parse(&level_raw)
            .ok_or_else(|| anyhow::anyhow!("criterion {id} has unknown level {level_raw}"))?;
        criteria.push(HonorCriterion {
            id,
            level,
            honor_type,
            min_gpa,
            max_gpa,
            min_grade,
            min_grade_all,
            min_year,
            max_year,
            require_consistent_honor: require_consistent_honor != 0,
            sort_order,
        });
    }
    Ok(criteria)
}

/// Committed honor standing for the school year preceding `school_year`.
/// `None` means no committed record exists; the qualifier treats that as a
/// failed consistency check, never as vacuously true.
pub fn prior_honor(
    conn: &Connection,
    student_id: &str,
    school_year: &str,
) -> anyhow::Result<Option<bool>> {
    let Some(prior_year) = previous_school_year(school_year) else {
        return Ok(None);
    };
    let row: Option<i64> = conn
        .query_row(
            "SELECT qualified FROM honor_results
             WHERE student_id = ? AND school_year = ?",
            (student_id, &prior_year),
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.map(|q| q != 0))
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_i64, get_optional_str, get_required_i64, get_required_str, load_subject,
    require_admin, require_session,
};
use crate::ipc::types::{AppState, Request};

fn program_total_semesters(conn: &Connection, program_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT total_semesters FROM programs WHERE id = ?",
        [program_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::new("not_found", "program not found"))
}

/// Field constraints shared by subject create and update.
fn validate_subject_scheme(
    semester: i64,
    total_semesters: i64,
    credits: i64,
    max_marks: i64,
    passing_marks: i64,
) -> Result<(), HandlerErr> {
    if semester < 1 || semester > total_semesters {
        return Err(HandlerErr::with_details(
            "bad_params",
            "semester is outside the program's range",
            json!({ "semester": semester, "totalSemesters": total_semesters }),
        ));
    }
    if credits <= 0 {
        return Err(HandlerErr::new("bad_params", "credits must be positive"));
    }
    if max_marks < 0 || passing_marks < 0 {
        return Err(HandlerErr::new("bad_params", "marks bounds must be >= 0"));
    }
    if passing_marks >= max_marks {
        return Err(HandlerErr::with_details(
            "bad_params",
            "passingMarks must be below maxMarks",
            json!({ "maxMarks": max_marks, "passingMarks": passing_marks }),
        ));
    }
    Ok(())
}

fn programs_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let name = get_required_str(params, "name")?;
    if name.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let duration_years = get_optional_i64(params, "durationYears").unwrap_or(2);
    let total_semesters = get_optional_i64(params, "totalSemesters").unwrap_or(4);
    if duration_years < 1 || total_semesters < 1 {
        return Err(HandlerErr::new(
            "bad_params",
            "durationYears and totalSemesters must be >= 1",
        ));
    }
    let description = get_optional_str(params, "description").unwrap_or_default();

    let program_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO programs(id, name, duration_years, total_semesters, description, is_active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (
            &program_id,
            name.trim(),
            duration_years,
            total_semesters,
            &description,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "programs" }),
        )
    })?;
    Ok(json!({ "programId": program_id }))
}

fn programs_update(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let program_id = get_required_str(params, "programId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing patch object"))?;

    // Verify existence up front so a typo'd id is not a silent no-op.
    program_total_semesters(conn, &program_id)?;

    if let Some(v) = patch.get("description").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE programs SET description = ? WHERE id = ?",
            (v, &program_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(v) = patch.get("totalSemesters").and_then(|v| v.as_i64()) {
        if v < 1 {
            return Err(HandlerErr::new("bad_params", "totalSemesters must be >= 1"));
        }
        conn.execute(
            "UPDATE programs SET total_semesters = ? WHERE id = ?",
            (v, &program_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(v) = patch.get("isActive").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE programs SET is_active = ? WHERE id = ?",
            (v as i64, &program_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(json!({ "ok": true }))
}

fn programs_list(
    state: &AppState,
    conn: &Connection,
) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, duration_years, total_semesters, description, is_active
             FROM programs ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    let programs = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "durationYears": r.get::<_, i64>(2)?,
                "totalSemesters": r.get::<_, i64>(3)?,
                "description": r.get::<_, String>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "programs": programs }))
}

fn subjects_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let program_id = get_required_str(params, "programId")?;
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let semester = get_required_i64(params, "semester")?;
    let credits = get_required_i64(params, "credits")?;
    let max_marks = get_optional_i64(params, "maxMarks").unwrap_or(100);
    let passing_marks = get_optional_i64(params, "passingMarks").unwrap_or(40);

    let total_semesters = program_total_semesters(conn, &program_id)?;
    validate_subject_scheme(semester, total_semesters, credits, max_marks, passing_marks)?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, program_id, code, name, semester, credits,
                              max_marks, passing_marks, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &subject_id,
            &program_id,
            code.trim(),
            name.trim(),
            semester,
            credits,
            max_marks,
            passing_marks,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "subjects" }),
        )
    })?;
    Ok(json!({ "subjectId": subject_id }))
}

fn subjects_update(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let subject_id = get_required_str(params, "subjectId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing patch object"))?;

    let current = load_subject(conn, &subject_id)?;
    let total_semesters = program_total_semesters(conn, &current.program_id)?;

    let name = patch
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(&current.name)
        .to_string();
    let semester = patch
        .get("semester")
        .and_then(|v| v.as_i64())
        .unwrap_or(current.semester);
    let credits = patch
        .get("credits")
        .and_then(|v| v.as_i64())
        .unwrap_or(current.credits);
    let max_marks = patch
        .get("maxMarks")
        .and_then(|v| v.as_i64())
        .unwrap_or(current.max_marks);
    let passing_marks = patch
        .get("passingMarks")
        .and_then(|v| v.as_i64())
        .unwrap_or(current.passing_marks);
    let is_active = patch
        .get("isActive")
        .and_then(|v| v.as_bool())
        .unwrap_or(current.is_active);

    validate_subject_scheme(semester, total_semesters, credits, max_marks, passing_marks)?;

    conn.execute(
        "UPDATE subjects
         SET name = ?, semester = ?, credits = ?, max_marks = ?, passing_marks = ?, is_active = ?
         WHERE id = ?",
        (
            name.trim(),
            semester,
            credits,
            max_marks,
            passing_marks,
            is_active as i64,
            &subject_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn subjects_list(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let program_id = get_optional_str(params, "programId");
    let semester = get_optional_i64(params, "semester");

    let mut sql = String::from(
        "SELECT id, program_id, code, name, semester, credits, max_marks, passing_marks, is_active
         FROM subjects WHERE 1=1",
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(pid) = &program_id {
        sql.push_str(" AND program_id = ?");
        binds.push(rusqlite::types::Value::Text(pid.clone()));
    }
    if let Some(sem) = semester {
        sql.push_str(" AND semester = ?");
        binds.push(rusqlite::types::Value::Integer(sem));
    }
    sql.push_str(" ORDER BY semester, code");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let subjects = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "programId": r.get::<_, String>(1)?,
                "code": r.get::<_, String>(2)?,
                "name": r.get::<_, String>(3)?,
                "semester": r.get::<_, i64>(4)?,
                "credits": r.get::<_, i64>(5)?,
                "maxMarks": r.get::<_, i64>(6)?,
                "passingMarks": r.get::<_, i64>(7)?,
                "isActive": r.get::<_, i64>(8)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "subjects": subjects }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&AppState, &Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(state, conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "programs.create" => Some(with_conn(state, req, programs_create)),
        "programs.update" => Some(with_conn(state, req, programs_update)),
        "programs.list" => Some(with_conn(state, req, |s, c, _| programs_list(s, c))),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.update" => Some(with_conn(state, req, subjects_update)),
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::accounts::insert_user;
use crate::ipc::helpers::{
    get_optional_bool, get_optional_i64, get_optional_str, get_required_i64, get_required_str,
    now_rfc3339, parse_page, require_admin, require_session,
};
use crate::ipc::types::{AppState, Request};

fn students_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let enrollment_number = get_required_str(params, "enrollmentNumber")?;
    let program_id = get_required_str(params, "programId")?;
    let batch_year = get_required_i64(params, "batchYear")?;
    let current_semester = get_optional_i64(params, "currentSemester").unwrap_or(1);
    let guardian_name = get_optional_str(params, "guardianName");
    let guardian_phone = get_optional_str(params, "guardianPhone");
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");

    if enrollment_number.trim().is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "enrollmentNumber must not be empty",
        ));
    }
    if !(2000..=2100).contains(&batch_year) {
        return Err(HandlerErr::new(
            "bad_params",
            "batchYear must be between 2000 and 2100",
        ));
    }

    let total_semesters: Option<i64> = conn
        .query_row(
            "SELECT total_semesters FROM programs WHERE id = ?",
            [&program_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(total_semesters) = total_semesters else {
        return Err(HandlerErr::new("not_found", "program not found"));
    };
    if current_semester < 1 || current_semester > total_semesters {
        return Err(HandlerErr::with_details(
            "bad_params",
            "currentSemester is outside the program's range",
            json!({ "currentSemester": current_semester, "totalSemesters": total_semesters }),
        ));
    }

    // Account and profile land together or not at all.
    let tx = conn.unchecked_transaction().map_err(|e| {
        HandlerErr::new("db_tx_failed", e.to_string())
    })?;
    let user_id = insert_user(
        &tx,
        &username,
        &password,
        Role::Student,
        &first_name,
        &last_name,
        email.as_deref(),
        phone.as_deref(),
    )?;
    let student_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO students(id, user_id, enrollment_number, program_id, batch_year,
                              current_semester, guardian_name, guardian_phone, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &student_id,
            &user_id,
            enrollment_number.trim(),
            &program_id,
            batch_year,
            current_semester,
            guardian_name.as_deref(),
            guardian_phone.as_deref(),
            now_rfc3339(),
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "students" }),
        )
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id, "userId": user_id }))
}

fn students_update(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing patch object"))?;

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    if let Some(v) = patch.get("currentSemester").and_then(|v| v.as_i64()) {
        if v < 1 {
            return Err(HandlerErr::new("bad_params", "currentSemester must be >= 1"));
        }
        conn.execute(
            "UPDATE students SET current_semester = ? WHERE id = ?",
            (v, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(v) = patch.get("isActive").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE students SET is_active = ? WHERE id = ?",
            (v as i64, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(v) = patch.get("guardianName").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET guardian_name = ? WHERE id = ?",
            (v, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    if let Some(v) = patch.get("guardianPhone").and_then(|v| v.as_str()) {
        conn.execute(
            "UPDATE students SET guardian_phone = ? WHERE id = ?",
            (v, &student_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(json!({ "ok": true }))
}

fn students_list(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    if session.role == Role::Student {
        return Err(HandlerErr::new("forbidden", "requires admin or teacher role"));
    }

    let program_id = get_optional_str(params, "programId");
    let semester = get_optional_i64(params, "semester");
    let active_only = get_optional_bool(params, "activeOnly").unwrap_or(false);
    let (page, page_size) = parse_page(params);

    let mut filter = String::from(" FROM students s JOIN users u ON u.id = s.user_id WHERE 1=1");
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(pid) = &program_id {
        filter.push_str(" AND s.program_id = ?");
        binds.push(rusqlite::types::Value::Text(pid.clone()));
    }
    if let Some(sem) = semester {
        filter.push_str(" AND s.current_semester = ?");
        binds.push(rusqlite::types::Value::Integer(sem));
    }
    if active_only {
        filter.push_str(" AND s.is_active = 1");
    }

    let count_sql = format!("SELECT COUNT(*){}", filter);
    let total: i64 = conn
        .query_row(
            &count_sql,
            rusqlite::params_from_iter(binds.clone()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let list_sql = format!(
        "SELECT s.id, s.enrollment_number, u.first_name, u.last_name, s.program_id,
                s.batch_year, s.current_semester, s.is_active{}
         ORDER BY s.enrollment_number LIMIT ? OFFSET ?",
        filter
    );
    binds.push(rusqlite::types::Value::Integer(page_size));
    binds.push(rusqlite::types::Value::Integer((page - 1) * page_size));

    let mut stmt = conn.prepare(&list_sql).map_err(HandlerErr::db)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentNumber": r.get::<_, String>(1)?,
                "displayName": format!("{} {}", first, last).trim().to_string(),
                "programId": r.get::<_, String>(4)?,
                "batchYear": r.get::<_, i64>(5)?,
                "currentSemester": r.get::<_, i64>(6)?,
                "isActive": r.get::<_, i64>(7)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "students": students,
        "page": page,
        "pageSize": page_size,
        "total": total,
    }))
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
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.list" => Some(with_conn(state, req, students_list)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::accounts::insert_user;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, require_admin, require_session, require_teacher,
};
use crate::ipc::types::{AppState, Request};

fn teachers_create(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let employee_id = get_required_str(params, "employeeId")?;
    let department = get_optional_str(params, "department").unwrap_or_default();
    let designation = get_optional_str(params, "designation").unwrap_or_default();
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");

    if employee_id.trim().is_empty() {
        return Err(HandlerErr::new("bad_params", "employeeId must not be empty"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let user_id = insert_user(
        &tx,
        &username,
        &password,
        Role::Teacher,
        &first_name,
        &last_name,
        email.as_deref(),
        phone.as_deref(),
    )?;
    let teacher_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO teachers(id, user_id, employee_id, department, designation, is_active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (
            &teacher_id,
            &user_id,
            employee_id.trim(),
            &department,
            &designation,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "teachers" }),
        )
    })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "teacherId": teacher_id, "userId": user_id }))
}

fn teachers_list(state: &AppState, conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.employee_id, u.first_name, u.last_name, t.department,
                    t.designation, t.is_active,
                    (SELECT COUNT(*) FROM teacher_subjects ts WHERE ts.teacher_id = t.id)
             FROM teachers t
             JOIN users u ON u.id = t.user_id
             ORDER BY t.employee_id",
        )
        .map_err(HandlerErr::db)?;
    let teachers = stmt
        .query_map([], |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "employeeId": r.get::<_, String>(1)?,
                "displayName": format!("{} {}", first, last).trim().to_string(),
                "department": r.get::<_, String>(4)?,
                "designation": r.get::<_, String>(5)?,
                "isActive": r.get::<_, i64>(6)? != 0,
                "subjectCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "teachers": teachers }))
}

/// Replaces the teacher's assignment set wholesale.
fn teachers_assign_subjects(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let Some(subject_ids_json) = params.get("subjectIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing subjectIds"));
    };
    let subject_ids: Vec<String> = subject_ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if subject_ids.len() != subject_ids_json.len() {
        return Err(HandlerErr::new("bad_params", "subjectIds must be strings"));
    }

    let teacher_exists = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !teacher_exists {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    }
    for subject_id in &subject_ids {
        let exists = conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(HandlerErr::db)?
            .is_some();
        if !exists {
            return Err(HandlerErr::with_details(
                "not_found",
                "subject not found",
                json!({ "subjectId": subject_id }),
            ));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [&teacher_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    for subject_id in &subject_ids {
        tx.execute(
            "INSERT OR IGNORE INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (&teacher_id, subject_id),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "teacher_subjects" }),
            )
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "assigned": subject_ids.len() }))
}

/// A teacher sees their own assignment set; an admin may pass teacherId
/// to inspect anyone's.
fn teachers_subjects(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    let teacher_id = match session.role {
        Role::Teacher => require_teacher(state, conn)?.teacher_id,
        Role::Admin => get_required_str(params, "teacherId")?,
        Role::Student => {
            return Err(HandlerErr::new("forbidden", "requires admin or teacher role"))
        }
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.code, s.name, s.semester, s.credits, s.max_marks,
                    s.passing_marks, s.program_id, s.is_active
             FROM teacher_subjects ts
             JOIN subjects s ON s.id = ts.subject_id
             WHERE ts.teacher_id = ?
             ORDER BY s.semester, s.code",
        )
        .map_err(HandlerErr::db)?;
    let subjects = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "semester": r.get::<_, i64>(3)?,
                "credits": r.get::<_, i64>(4)?,
                "maxMarks": r.get::<_, i64>(5)?,
                "passingMarks": r.get::<_, i64>(6)?,
                "programId": r.get::<_, String>(7)?,
                "isActive": r.get::<_, i64>(8)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "teacherId": teacher_id, "subjects": subjects }))
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
        "teachers.create" => Some(with_conn(state, req, teachers_create)),
        "teachers.list" => Some(with_conn(state, req, |s, c, _| teachers_list(s, c))),
        "teachers.assignSubjects" => Some(with_conn(state, req, teachers_assign_subjects)),
        "teachers.subjects" => Some(with_conn(state, req, teachers_subjects)),
        _ => None,
    }
}

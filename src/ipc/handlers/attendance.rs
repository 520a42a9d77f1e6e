use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_subject, now_rfc3339,
    require_assigned_subject, require_student, require_teacher, validate_academic_year, roster,
};
use crate::ipc::types::{AppState, Request};

struct RowSkip {
    student_id: String,
    code: &'static str,
    message: String,
}

struct AttendanceRow {
    student_id: String,
    total_classes: i64,
    attended_classes: i64,
}

fn parse_entry(entry: &serde_json::Value) -> Result<AttendanceRow, RowSkip> {
    let student_id = entry
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RowSkip {
            student_id: String::new(),
            code: "bad_params",
            message: "entry missing studentId".to_string(),
        })?;
    let total_classes = entry
        .get("totalClasses")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RowSkip {
            student_id: student_id.clone(),
            code: "bad_params",
            message: "totalClasses must be an integer".to_string(),
        })?;
    let attended_classes = entry
        .get("attendedClasses")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RowSkip {
            student_id: student_id.clone(),
            code: "bad_params",
            message: "attendedClasses must be an integer".to_string(),
        })?;
    if total_classes < 0 || attended_classes < 0 {
        return Err(RowSkip {
            student_id,
            code: "bad_params",
            message: "class counts must be >= 0".to_string(),
        });
    }
    if attended_classes > total_classes {
        return Err(RowSkip {
            student_id,
            code: "bad_params",
            message: "attendedClasses exceeds totalClasses".to_string(),
        });
    }
    Ok(AttendanceRow {
        student_id,
        total_classes,
        attended_classes,
    })
}

fn attendance_bulk_entry(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = require_teacher(state, conn)?;
    let subject_id = get_required_str(params, "subjectId")?;
    let academic_year = get_required_str(params, "academicYear")?;
    validate_academic_year(&academic_year)?;
    require_assigned_subject(conn, &teacher.teacher_id, &subject_id)?;
    let subject = load_subject(conn, &subject_id)?;
    if !subject.is_active {
        return Err(HandlerErr::new("bad_params", "subject is inactive"));
    }

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries[]"));
    };

    let roster_ids: HashSet<String> = roster(conn, &subject.program_id, subject.semester)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    let mut saved: usize = 0;
    let mut skips: Vec<RowSkip> = Vec::new();

    for entry in entries {
        let row = match parse_entry(entry) {
            Ok(v) => v,
            Err(skip) => {
                skips.push(skip);
                continue;
            }
        };
        if !roster_ids.contains(&row.student_id) {
            skips.push(RowSkip {
                student_id: row.student_id,
                code: "not_found",
                message: "student is not on this subject's roster".to_string(),
            });
            continue;
        }
        let percentage = calc::attendance_percentage(row.total_classes, row.attended_classes);
        let now = now_rfc3339();
        let outcome = conn.execute(
            "INSERT INTO attendance(id, student_id, subject_id, semester, academic_year,
                                    total_classes, attended_classes, percentage, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id, semester, academic_year) DO UPDATE SET
               total_classes = excluded.total_classes,
               attended_classes = excluded.attended_classes,
               percentage = excluded.percentage,
               updated_at = excluded.updated_at",
            (
                Uuid::new_v4().to_string(),
                &row.student_id,
                &subject_id,
                subject.semester,
                &academic_year,
                row.total_classes,
                row.attended_classes,
                percentage,
                &now,
            ),
        );
        match outcome {
            Ok(_) => saved += 1,
            Err(e) => skips.push(RowSkip {
                student_id: row.student_id,
                code: "db_insert_failed",
                message: e.to_string(),
            }),
        }
    }

    let errors: Vec<serde_json::Value> = skips
        .iter()
        .map(|s| {
            json!({
                "studentId": s.student_id,
                "code": s.code,
                "message": s.message,
            })
        })
        .collect();

    let mut result = json!({
        "saved": saved,
        "skipped": skips.len(),
    });
    if !errors.is_empty() {
        result
            .as_object_mut()
            .ok_or_else(|| HandlerErr::new("db_query_failed", "result envelope must be object"))?
            .insert("errors".into(), json!(errors));
    }
    Ok(result)
}

fn attendance_subject_records(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = require_teacher(state, conn)?;
    let subject_id = get_required_str(params, "subjectId")?;
    require_assigned_subject(conn, &teacher.teacher_id, &subject_id)?;
    let academic_year = get_optional_str(params, "academicYear");
    if let Some(year) = &academic_year {
        validate_academic_year(year)?;
    }

    let mut sql = String::from(
        "SELECT st.enrollment_number, u.first_name, u.last_name,
                a.total_classes, a.attended_classes, a.percentage, a.academic_year
         FROM attendance a
         JOIN students st ON st.id = a.student_id
         JOIN users u ON u.id = st.user_id
         WHERE a.subject_id = ?",
    );
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(subject_id.clone())];
    if let Some(year) = &academic_year {
        sql.push_str(" AND a.academic_year = ?");
        binds.push(rusqlite::types::Value::Text(year.clone()));
    }
    sql.push_str(" ORDER BY a.academic_year DESC, st.enrollment_number");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let records = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            let pct: f64 = r.get(5)?;
            Ok(json!({
                "enrollmentNumber": r.get::<_, String>(0)?,
                "displayName": format!("{} {}", first, last).trim().to_string(),
                "totalClasses": r.get::<_, i64>(3)?,
                "attendedClasses": r.get::<_, i64>(4)?,
                "percentage": pct,
                "status": calc::attendance_status(pct).as_str(),
                "academicYear": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "records": records }))
}

/// A student's own attendance for their current semester, plus the
/// overall percentage across those records.
fn attendance_student_overview(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student = require_student(state, conn)?;
    let semester = params
        .get("semester")
        .and_then(|v| v.as_i64())
        .unwrap_or(student.current_semester);

    let mut stmt = conn
        .prepare(
            "SELECT sub.code, sub.name, a.total_classes, a.attended_classes,
                    a.percentage, a.academic_year
             FROM attendance a
             JOIN subjects sub ON sub.id = a.subject_id
             WHERE a.student_id = ? AND a.semester = ?
             ORDER BY sub.code",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&student.student_id, semester), |r| {
            let pct: f64 = r.get(4)?;
            Ok((
                json!({
                    "subjectCode": r.get::<_, String>(0)?,
                    "subjectName": r.get::<_, String>(1)?,
                    "totalClasses": r.get::<_, i64>(2)?,
                    "attendedClasses": r.get::<_, i64>(3)?,
                    "percentage": pct,
                    "status": calc::attendance_status(pct).as_str(),
                    "academicYear": r.get::<_, String>(5)?,
                }),
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let total: i64 = rows.iter().map(|(_, t, _)| *t).sum();
    let attended: i64 = rows.iter().map(|(_, _, a)| *a).sum();
    let overall = calc::attendance_percentage(total, attended);

    let records: Vec<serde_json::Value> = rows.into_iter().map(|(j, _, _)| j).collect();
    Ok(json!({
        "semester": semester,
        "records": records,
        "overallPercentage": overall,
        "overallStatus": calc::attendance_status(overall).as_str(),
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
        "attendance.bulkEntry" => Some(with_conn(state, req, attendance_bulk_entry)),
        "attendance.subjectRecords" => Some(with_conn(state, req, attendance_subject_records)),
        "attendance.studentOverview" => Some(with_conn(state, req, attendance_student_overview)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, load_subject, now_rfc3339, require_assigned_subject,
    require_teacher, roster, validate_academic_year, SubjectRow,
};
use crate::ipc::types::{AppState, Request};

const BULK_ENTRY_MAX_ROWS: usize = 2000;

/// Why one roster row was skipped. The batch keeps going; nothing is
/// retried automatically.
struct RowSkip {
    student_id: String,
    code: &'static str,
    message: String,
}

struct MarksRow {
    student_id: String,
    internal: i64,
    external: i64,
    remarks: String,
}

fn parse_entry(entry: &serde_json::Value) -> Result<MarksRow, RowSkip> {
    let student_id = entry
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| RowSkip {
            student_id: String::new(),
            code: "bad_params",
            message: "entry missing studentId".to_string(),
        })?;
    let internal = entry
        .get("internal")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RowSkip {
            student_id: student_id.clone(),
            code: "bad_params",
            message: "internal must be an integer".to_string(),
        })?;
    let external = entry
        .get("external")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| RowSkip {
            student_id: student_id.clone(),
            code: "bad_params",
            message: "external must be an integer".to_string(),
        })?;
    if internal < 0 || external < 0 {
        return Err(RowSkip {
            student_id,
            code: "bad_params",
            message: "marks must be >= 0".to_string(),
        });
    }
    let remarks = entry
        .get("remarks")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Ok(MarksRow {
        student_id,
        internal,
        external,
        remarks,
    })
}

/// Finds or creates the (student, semester, academic_year) result shell.
fn get_or_create_result(
    conn: &Connection,
    student_id: &str,
    semester: i64,
    academic_year: &str,
) -> Result<String, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM semester_results
             WHERE student_id = ? AND semester = ? AND academic_year = ?",
            (student_id, semester, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO semester_results(id, student_id, semester, academic_year,
                                      sgpa, total_credits, credits_earned,
                                      is_published, published_date, remarks,
                                      created_at, updated_at)
         VALUES(?, ?, ?, ?, NULL, 0, 0, 0, NULL, '', ?, ?)",
        (&id, student_id, semester, academic_year, &now, &now),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "semester_results" }),
        )
    })?;
    Ok(id)
}

/// Derives total/grade/grade_point/is_passed and upserts the mark row.
/// Derived columns are always rewritten; an edited row can never keep
/// stale values.
fn upsert_mark(
    conn: &Connection,
    semester_result_id: &str,
    subject: &SubjectRow,
    teacher_id: &str,
    row: &MarksRow,
) -> Result<calc::DerivedMarks, HandlerErr> {
    let derived = calc::derive_marks(row.internal, row.external, &subject.scheme());
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO subject_marks(id, semester_result_id, subject_id, teacher_id,
                                   internal_marks, external_marks, total_marks,
                                   grade, grade_point, is_passed, remarks,
                                   entry_date, modified_date)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(semester_result_id, subject_id) DO UPDATE SET
           teacher_id = excluded.teacher_id,
           internal_marks = excluded.internal_marks,
           external_marks = excluded.external_marks,
           total_marks = excluded.total_marks,
           grade = excluded.grade,
           grade_point = excluded.grade_point,
           is_passed = excluded.is_passed,
           remarks = excluded.remarks,
           modified_date = excluded.modified_date",
        (
            Uuid::new_v4().to_string(),
            semester_result_id,
            &subject.id,
            teacher_id,
            row.internal,
            row.external,
            derived.total_marks,
            derived.grade.as_str(),
            derived.grade_point,
            derived.is_passed as i64,
            &row.remarks,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "subject_marks" }),
        )
    })?;
    Ok(derived)
}

fn marks_bulk_entry(
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
    if entries.len() > BULK_ENTRY_MAX_ROWS {
        return Err(HandlerErr::with_details(
            "bad_params",
            "bulk payload exceeds max rows",
            json!({ "rows": entries.len(), "maxRows": BULK_ENTRY_MAX_ROWS }),
        ));
    }

    let roster_ids: HashSet<String> = roster(conn, &subject.program_id, subject.semester)?
        .into_iter()
        .map(|s| s.id)
        .collect();

    // Per-row commit semantics: a failing row is recorded and skipped,
    // the rest of the batch proceeds.
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

        let result_id =
            match get_or_create_result(conn, &row.student_id, subject.semester, &academic_year) {
                Ok(v) => v,
                Err(e) => {
                    skips.push(RowSkip {
                        student_id: row.student_id,
                        code: e.code,
                        message: e.message,
                    });
                    continue;
                }
            };
        match upsert_mark(conn, &result_id, &subject, &teacher.teacher_id, &row) {
            Ok(_) => saved += 1,
            Err(e) => skips.push(RowSkip {
                student_id: row.student_id,
                code: e.code,
                message: e.message,
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

/// Marks for one subject as its assigned teacher sees them, plus the
/// pass/fail statistics block.
fn marks_subject_results(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher = require_teacher(state, conn)?;
    let subject_id = get_required_str(params, "subjectId")?;
    require_assigned_subject(conn, &teacher.teacher_id, &subject_id)?;
    let subject = load_subject(conn, &subject_id)?;
    let academic_year = get_optional_str(params, "academicYear");
    if let Some(year) = &academic_year {
        validate_academic_year(year)?;
    }

    let mut sql = String::from(
        "SELECT st.enrollment_number, u.first_name, u.last_name,
                m.internal_marks, m.external_marks, m.total_marks,
                m.grade, m.grade_point, m.is_passed, sr.academic_year, sr.is_published
         FROM subject_marks m
         JOIN semester_results sr ON sr.id = m.semester_result_id
         JOIN students st ON st.id = sr.student_id
         JOIN users u ON u.id = st.user_id
         WHERE m.subject_id = ?",
    );
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(subject_id.clone())];
    if let Some(year) = &academic_year {
        sql.push_str(" AND sr.academic_year = ?");
        binds.push(rusqlite::types::Value::Text(year.clone()));
    }
    sql.push_str(" ORDER BY sr.academic_year DESC, st.enrollment_number");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok((
                json!({
                    "enrollmentNumber": r.get::<_, String>(0)?,
                    "displayName": format!("{} {}", first, last).trim().to_string(),
                    "internalMarks": r.get::<_, i64>(3)?,
                    "externalMarks": r.get::<_, i64>(4)?,
                    "totalMarks": r.get::<_, i64>(5)?,
                    "grade": r.get::<_, String>(6)?,
                    "gradePoint": r.get::<_, f64>(7)?,
                    "isPassed": r.get::<_, i64>(8)? != 0,
                    "academicYear": r.get::<_, String>(9)?,
                    "isPublished": r.get::<_, i64>(10)? != 0,
                }),
                r.get::<_, i64>(5)?,
                r.get::<_, i64>(8)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let total = rows.len();
    let passed = rows.iter().filter(|(_, _, p)| *p).count();
    let marks_sum: i64 = rows.iter().map(|(_, t, _)| *t).sum();
    let avg_marks = if total > 0 {
        calc::round2(marks_sum as f64 / total as f64)
    } else {
        0.0
    };
    let pass_percentage = if total > 0 {
        calc::round2(passed as f64 / total as f64 * 100.0)
    } else {
        0.0
    };

    let marks: Vec<serde_json::Value> = rows.into_iter().map(|(j, _, _)| j).collect();
    Ok(json!({
        "subject": {
            "id": subject.id,
            "code": subject.code,
            "name": subject.name,
            "maxMarks": subject.max_marks,
            "passingMarks": subject.passing_marks,
        },
        "marks": marks,
        "stats": {
            "total": total,
            "passed": passed,
            "failed": total - passed,
            "avgMarks": avg_marks,
            "passPercentage": pass_percentage,
        }
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
        "marks.bulkEntry" => Some(with_conn(state, req, marks_bulk_entry)),
        "marks.subjectResults" => Some(with_conn(state, req, marks_subject_results)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    calculate_cgpa, get_optional_str, get_required_i64, get_required_str, now_rfc3339, parse_page,
    refresh_semester_summary, require_admin, require_session, require_student, result_percentage,
    validate_academic_year,
};
use crate::ipc::types::{AppState, Request};

/// Publishes every unpublished result matching the scope. Summary rows
/// are refreshed from source marks before the flag flips, so a published
/// SGPA always reflects the marks at publication time. The whole batch
/// plus its audit row commit together.
fn results_publish(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = require_admin(state)?;
    let semester = get_required_i64(params, "semester")?;
    let academic_year = get_required_str(params, "academicYear")?;
    validate_academic_year(&academic_year)?;
    let program_id = get_optional_str(params, "programId");
    let remarks = get_optional_str(params, "remarks").unwrap_or_default();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut sql = String::from(
        "SELECT sr.id FROM semester_results sr
         JOIN students st ON st.id = sr.student_id
         WHERE sr.semester = ? AND sr.academic_year = ? AND sr.is_published = 0",
    );
    let mut binds: Vec<rusqlite::types::Value> = vec![
        rusqlite::types::Value::Integer(semester),
        rusqlite::types::Value::Text(academic_year.clone()),
    ];
    if let Some(pid) = &program_id {
        sql.push_str(" AND st.program_id = ?");
        binds.push(rusqlite::types::Value::Text(pid.clone()));
    }

    let result_ids: Vec<String> = {
        let mut stmt = tx.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map(rusqlite::params_from_iter(binds), |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?
    };

    if result_ids.is_empty() {
        // Nothing to publish is not an error, but it leaves no audit trace.
        return Ok(json!({
            "published": 0,
            "warning": "no unpublished results matched the selection",
        }));
    }

    let published_date = now_rfc3339();
    for result_id in &result_ids {
        refresh_semester_summary(&tx, result_id)?;
        tx.execute(
            "UPDATE semester_results SET is_published = 1, published_date = ? WHERE id = ?",
            (&published_date, result_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }

    let publication_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO result_publications(id, semester, academic_year, program_id,
                                         published_by, published_date, total_students, remarks)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &publication_id,
            semester,
            &academic_year,
            &program_id,
            &session.user_id,
            &published_date,
            result_ids.len() as i64,
            &remarks,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({
        "published": result_ids.len(),
        "publicationId": publication_id,
        "publishedDate": published_date,
    }))
}

/// Clears the published flag on the matching scope. Audit rows are
/// append-only and stay put; the stale sgpa stays on the result row
/// until the next publish refreshes it.
fn results_unpublish(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let semester = get_required_i64(params, "semester")?;
    let academic_year = get_required_str(params, "academicYear")?;
    validate_academic_year(&academic_year)?;
    let program_id = get_optional_str(params, "programId");

    let mut sql = String::from(
        "UPDATE semester_results SET is_published = 0, published_date = NULL
         WHERE semester = ? AND academic_year = ? AND is_published = 1",
    );
    let mut binds: Vec<rusqlite::types::Value> = vec![
        rusqlite::types::Value::Integer(semester),
        rusqlite::types::Value::Text(academic_year),
    ];
    if let Some(pid) = program_id {
        sql.push_str(
            " AND student_id IN (SELECT id FROM students WHERE program_id = ?)",
        );
        binds.push(rusqlite::types::Value::Text(pid));
    }
    let unpublished = conn
        .execute(&sql, rusqlite::params_from_iter(binds))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "unpublished": unpublished }))
}

fn results_list(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let (page, page_size) = parse_page(params);

    let mut filters = String::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(pid) = get_optional_str(params, "programId") {
        filters.push_str(" AND st.program_id = ?");
        binds.push(rusqlite::types::Value::Text(pid));
    }
    if let Some(sem) = params.get("semester").and_then(|v| v.as_i64()) {
        filters.push_str(" AND sr.semester = ?");
        binds.push(rusqlite::types::Value::Integer(sem));
    }
    if let Some(year) = get_optional_str(params, "academicYear") {
        filters.push_str(" AND sr.academic_year = ?");
        binds.push(rusqlite::types::Value::Text(year));
    }
    match get_optional_str(params, "status").as_deref() {
        Some("published") => filters.push_str(" AND sr.is_published = 1"),
        Some("unpublished") => filters.push_str(" AND sr.is_published = 0"),
        Some(other) => {
            return Err(HandlerErr::with_details(
                "bad_params",
                "status must be published or unpublished",
                json!({ "status": other }),
            ))
        }
        None => {}
    }

    let count_sql = format!(
        "SELECT COUNT(*) FROM semester_results sr
         JOIN students st ON st.id = sr.student_id
         WHERE 1 = 1{}",
        filters
    );
    let total: i64 = conn
        .query_row(&count_sql, rusqlite::params_from_iter(binds.clone()), |r| {
            r.get(0)
        })
        .map_err(HandlerErr::db)?;

    let list_sql = format!(
        "SELECT sr.id, st.enrollment_number, u.first_name, u.last_name, p.name,
                sr.semester, sr.academic_year, sr.sgpa, sr.total_credits,
                sr.credits_earned, sr.is_published, sr.published_date
         FROM semester_results sr
         JOIN students st ON st.id = sr.student_id
         JOIN users u ON u.id = st.user_id
         JOIN programs p ON p.id = st.program_id
         WHERE 1 = 1{}
         ORDER BY sr.academic_year DESC, sr.semester DESC, st.enrollment_number
         LIMIT ? OFFSET ?",
        filters
    );
    binds.push(rusqlite::types::Value::Integer(page_size));
    binds.push(rusqlite::types::Value::Integer((page - 1) * page_size));

    let mut stmt = conn.prepare(&list_sql).map_err(HandlerErr::db)?;
    let results = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentNumber": r.get::<_, String>(1)?,
                "studentName": format!("{} {}", first, last).trim().to_string(),
                "programName": r.get::<_, String>(4)?,
                "semester": r.get::<_, i64>(5)?,
                "academicYear": r.get::<_, String>(6)?,
                "sgpa": r.get::<_, Option<f64>>(7)?,
                "totalCredits": r.get::<_, i64>(8)?,
                "creditsEarned": r.get::<_, i64>(9)?,
                "isPublished": r.get::<_, i64>(10)? != 0,
                "publishedDate": r.get::<_, Option<String>>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "results": results,
        "total": total,
        "page": page,
        "pageSize": page_size,
    }))
}

fn marks_breakdown(
    conn: &Connection,
    semester_result_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.code, sub.name, sub.credits, sub.max_marks, sub.passing_marks,
                    m.internal_marks, m.external_marks, m.total_marks,
                    m.grade, m.grade_point, m.is_passed
             FROM subject_marks m
             JOIN subjects sub ON sub.id = m.subject_id
             WHERE m.semester_result_id = ?
             ORDER BY sub.code",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([semester_result_id], |r| {
        Ok(json!({
            "subjectCode": r.get::<_, String>(0)?,
            "subjectName": r.get::<_, String>(1)?,
            "credits": r.get::<_, i64>(2)?,
            "maxMarks": r.get::<_, i64>(3)?,
            "passingMarks": r.get::<_, i64>(4)?,
            "internalMarks": r.get::<_, i64>(5)?,
            "externalMarks": r.get::<_, i64>(6)?,
            "totalMarks": r.get::<_, i64>(7)?,
            "grade": r.get::<_, String>(8)?,
            "gradePoint": r.get::<_, f64>(9)?,
            "isPassed": r.get::<_, i64>(10)? != 0,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

struct ResultHeader {
    student_id: String,
    semester: i64,
    academic_year: String,
    sgpa: Option<f64>,
    total_credits: i64,
    credits_earned: i64,
    is_published: bool,
    published_date: Option<String>,
    remarks: String,
}

fn load_result_header(
    conn: &Connection,
    result_id: &str,
) -> Result<ResultHeader, HandlerErr> {
    conn.query_row(
        "SELECT student_id, semester, academic_year, sgpa, total_credits,
                credits_earned, is_published, published_date, remarks
         FROM semester_results WHERE id = ?",
        [result_id],
        |r| {
            Ok(ResultHeader {
                student_id: r.get(0)?,
                semester: r.get(1)?,
                academic_year: r.get(2)?,
                sgpa: r.get(3)?,
                total_credits: r.get(4)?,
                credits_earned: r.get(5)?,
                is_published: r.get::<_, i64>(6)? != 0,
                published_date: r.get(7)?,
                remarks: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::new("not_found", "result not found"))
}

fn result_detail_payload(
    conn: &Connection,
    result_id: &str,
    header: &ResultHeader,
) -> Result<serde_json::Value, HandlerErr> {
    let marks = marks_breakdown(conn, result_id)?;
    let (enrollment, first, last, program): (String, String, String, String) = conn
        .query_row(
            "SELECT st.enrollment_number, u.first_name, u.last_name, p.name
             FROM students st
             JOIN users u ON u.id = st.user_id
             JOIN programs p ON p.id = st.program_id
             WHERE st.id = ?",
            [&header.student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "id": result_id,
        "student": {
            "id": header.student_id,
            "enrollmentNumber": enrollment,
            "displayName": format!("{} {}", first, last).trim().to_string(),
            "programName": program,
        },
        "semester": header.semester,
        "academicYear": header.academic_year,
        "sgpa": header.sgpa,
        "totalCredits": header.total_credits,
        "creditsEarned": header.credits_earned,
        "isPublished": header.is_published,
        "publishedDate": header.published_date,
        "remarks": header.remarks,
        "percentage": result_percentage(conn, result_id)?,
        "cgpa": calculate_cgpa(conn, &header.student_id)?,
        "marks": marks,
    }))
}

/// Admins see any result; a student sees their own, and only once it
/// has been published.
fn results_detail(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    let result_id = get_required_str(params, "resultId")?;
    let header = load_result_header(conn, &result_id)?;

    match session.role {
        Role::Admin => {}
        Role::Student => {
            let student = require_student(state, conn)?;
            if student.student_id != header.student_id || !header.is_published {
                return Err(HandlerErr::new("not_found", "result not found"));
            }
        }
        Role::Teacher => {
            return Err(HandlerErr::new(
                "forbidden",
                "teachers view marks per subject",
            ))
        }
    }
    result_detail_payload(conn, &result_id, &header)
}

fn results_dashboard(
    state: &AppState,
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    require_admin(state)?;
    let (total, published): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_published), 0) FROM semester_results",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db)?;

    let mut stmt = conn
        .prepare(
            "SELECT rp.id, rp.semester, rp.academic_year, p.name, rp.published_date,
                    rp.total_students, rp.remarks, u.username
             FROM result_publications rp
             LEFT JOIN programs p ON p.id = rp.program_id
             LEFT JOIN users u ON u.id = rp.published_by
             ORDER BY rp.published_date DESC
             LIMIT 10",
        )
        .map_err(HandlerErr::db)?;
    let recent = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semester": r.get::<_, i64>(1)?,
                "academicYear": r.get::<_, String>(2)?,
                "programName": r.get::<_, Option<String>>(3)?,
                "publishedDate": r.get::<_, String>(4)?,
                "totalStudents": r.get::<_, i64>(5)?,
                "remarks": r.get::<_, String>(6)?,
                "publishedBy": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "totalResults": total,
        "publishedResults": published,
        "pendingResults": total - published,
        "recentPublications": recent,
    }))
}

/// A student's own published results across semesters.
fn results_student_results(
    state: &AppState,
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student = require_student(state, conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, semester, academic_year, sgpa, total_credits,
                    credits_earned, published_date
             FROM semester_results
             WHERE student_id = ? AND is_published = 1
             ORDER BY academic_year, semester",
        )
        .map_err(HandlerErr::db)?;
    let ids_and_rows = stmt
        .query_map([&student.student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "semester": r.get::<_, i64>(1)?,
                    "academicYear": r.get::<_, String>(2)?,
                    "sgpa": r.get::<_, Option<f64>>(3)?,
                    "totalCredits": r.get::<_, i64>(4)?,
                    "creditsEarned": r.get::<_, i64>(5)?,
                    "publishedDate": r.get::<_, Option<String>>(6)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut results = Vec::with_capacity(ids_and_rows.len());
    for (id, mut row) in ids_and_rows {
        let pct = result_percentage(conn, &id)?;
        if let Some(obj) = row.as_object_mut() {
            obj.insert("percentage".into(), json!(pct));
        }
        results.push(row);
    }

    let (total_subjects, passed_subjects): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(m.is_passed), 0)
             FROM subject_marks m
             JOIN semester_results sr ON sr.id = m.semester_result_id
             WHERE sr.student_id = ? AND sr.is_published = 1",
            [&student.student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "results": results,
        "cgpa": calculate_cgpa(conn, &student.student_id)?,
        "summary": {
            "totalSubjects": total_subjects,
            "passedSubjects": passed_subjects,
            "failedSubjects": total_subjects - passed_subjects,
        }
    }))
}

/// One semester's published result for the logged-in student. Without an
/// academicYear the most recent matching year wins.
fn results_semester_detail(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student = require_student(state, conn)?;
    let semester = get_required_i64(params, "semester")?;
    let academic_year = get_optional_str(params, "academicYear");

    let result_id: Option<String> = match &academic_year {
        Some(year) => conn
            .query_row(
                "SELECT id FROM semester_results
                 WHERE student_id = ? AND semester = ? AND academic_year = ?
                   AND is_published = 1",
                (&student.student_id, semester, year),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?,
        None => conn
            .query_row(
                "SELECT id FROM semester_results
                 WHERE student_id = ? AND semester = ? AND is_published = 1
                 ORDER BY academic_year DESC LIMIT 1",
                (&student.student_id, semester),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?,
    };
    let Some(result_id) = result_id else {
        return Err(HandlerErr::new(
            "not_found",
            "no published result for that semester",
        ));
    };
    let header = load_result_header(conn, &result_id)?;
    result_detail_payload(conn, &result_id, &header)
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
        "results.publish" => Some(with_conn(state, req, results_publish)),
        "results.unpublish" => Some(with_conn(state, req, results_unpublish)),
        "results.list" => Some(with_conn(state, req, results_list)),
        "results.detail" => Some(with_conn(state, req, results_detail)),
        "results.dashboard" => Some(with_conn(state, req, results_dashboard)),
        "results.studentResults" => Some(with_conn(state, req, results_student_results)),
        "results.semesterDetail" => Some(with_conn(state, req, results_semester_detail)),
        _ => None,
    }
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::Role;
use crate::calc;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Session};

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---- param extraction ----

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing/invalid {}", key)))
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// Academic years are written "2024-25": a 4-digit start year, a dash,
/// and the 2-digit year that follows it.
pub fn validate_academic_year(value: &str) -> Result<(), HandlerErr> {
    let bad = || {
        HandlerErr::with_details(
            "bad_params",
            "academicYear must look like 2024-25",
            json!({ "academicYear": value }),
        )
    };
    let Some((start, end)) = value.split_once('-') else {
        return Err(bad());
    };
    if start.len() != 4 || end.len() != 2 {
        return Err(bad());
    }
    let start_year: i64 = start.parse().map_err(|_| bad())?;
    let end_year: i64 = end.parse().map_err(|_| bad())?;
    if (start_year + 1) % 100 != end_year {
        return Err(bad());
    }
    Ok(())
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 200;

/// 1-based page plus a clamped page size.
pub fn parse_page(params: &serde_json::Value) -> (i64, i64) {
    let page = get_optional_i64(params, "page").unwrap_or(1).max(1);
    let page_size = get_optional_i64(params, "pageSize")
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    (page, page_size)
}

// ---- session and capability checks ----

pub fn require_session(state: &AppState) -> Result<Session, HandlerErr> {
    state
        .session
        .clone()
        .ok_or_else(|| HandlerErr::new("not_authenticated", "login first"))
}

pub fn require_role(state: &AppState, role: Role) -> Result<Session, HandlerErr> {
    let session = require_session(state)?;
    if session.role != role {
        return Err(HandlerErr::with_details(
            "forbidden",
            format!("requires {} role", role.as_str()),
            json!({ "role": session.role.as_str() }),
        ));
    }
    Ok(session)
}

pub fn require_admin(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, Role::Admin)
}

#[derive(Debug, Clone)]
pub struct TeacherContext {
    pub teacher_id: String,
}

/// Resolves the session to its teacher profile row.
pub fn require_teacher(state: &AppState, conn: &Connection) -> Result<TeacherContext, HandlerErr> {
    let session = require_role(state, Role::Teacher)?;
    let teacher_id: Option<String> = conn
        .query_row(
            "SELECT id FROM teachers WHERE user_id = ? AND is_active = 1",
            [&session.user_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    teacher_id
        .map(|teacher_id| TeacherContext { teacher_id })
        .ok_or_else(|| HandlerErr::new("not_found", "teacher profile not found"))
}

#[derive(Debug, Clone)]
pub struct StudentContext {
    pub student_id: String,
    pub program_id: String,
    pub current_semester: i64,
}

pub fn require_student(state: &AppState, conn: &Connection) -> Result<StudentContext, HandlerErr> {
    let session = require_role(state, Role::Student)?;
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, program_id, current_semester FROM students WHERE user_id = ?",
            [&session.user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    row.map(|(student_id, program_id, current_semester)| StudentContext {
        student_id,
        program_id,
        current_semester,
    })
    .ok_or_else(|| HandlerErr::new("not_found", "student profile not found"))
}

/// A teacher may only touch subjects in their assignment set.
pub fn require_assigned_subject(
    conn: &Connection,
    teacher_id: &str,
    subject_id: &str,
) -> Result<(), HandlerErr> {
    let assigned = conn
        .query_row(
            "SELECT 1 FROM teacher_subjects WHERE teacher_id = ? AND subject_id = ?",
            (teacher_id, subject_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if !assigned {
        return Err(HandlerErr::with_details(
            "forbidden",
            "subject is not in your assignment set",
            json!({ "subjectId": subject_id }),
        ));
    }
    Ok(())
}

// ---- catalog and roster lookups ----

#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub id: String,
    pub program_id: String,
    pub code: String,
    pub name: String,
    pub semester: i64,
    pub credits: i64,
    pub max_marks: i64,
    pub passing_marks: i64,
    pub is_active: bool,
}

impl SubjectRow {
    pub fn scheme(&self) -> calc::SubjectScheme {
        calc::SubjectScheme {
            max_marks: self.max_marks,
            passing_marks: self.passing_marks,
            credits: self.credits,
        }
    }
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<SubjectRow, HandlerErr> {
    conn.query_row(
        "SELECT id, program_id, code, name, semester, credits, max_marks, passing_marks, is_active
         FROM subjects WHERE id = ?",
        [subject_id],
        |r| {
            Ok(SubjectRow {
                id: r.get(0)?,
                program_id: r.get(1)?,
                code: r.get(2)?,
                name: r.get(3)?,
                semester: r.get(4)?,
                credits: r.get(5)?,
                max_marks: r.get(6)?,
                passing_marks: r.get(7)?,
                is_active: r.get::<_, i64>(8)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::new("not_found", "subject not found"))
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub enrollment_number: String,
    pub display_name: String,
}

/// The roster for marks/attendance scoping: active students of the
/// subject's program and semester, ordered by enrollment number.
pub fn roster(
    conn: &Connection,
    program_id: &str,
    semester: i64,
) -> Result<Vec<RosterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.enrollment_number, u.first_name, u.last_name
             FROM students s
             JOIN users u ON u.id = s.user_id
             WHERE s.program_id = ? AND s.current_semester = ? AND s.is_active = 1
             ORDER BY s.enrollment_number",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map((program_id, semester), |r| {
        let first: String = r.get(2)?;
        let last: String = r.get(3)?;
        Ok(RosterStudent {
            id: r.get(0)?,
            enrollment_number: r.get(1)?,
            display_name: format!("{} {}", first, last).trim().to_string(),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

// ---- result aggregation ----

/// Loads the credited marks for one semester result.
pub fn credited_marks(
    conn: &Connection,
    semester_result_id: &str,
) -> Result<Vec<calc::CreditedMark>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT m.grade_point, sub.credits, m.is_passed
             FROM subject_marks m
             JOIN subjects sub ON sub.id = m.subject_id
             WHERE m.semester_result_id = ?",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([semester_result_id], |r| {
        Ok(calc::CreditedMark {
            grade_point: r.get(0)?,
            credits: r.get(1)?,
            is_passed: r.get::<_, i64>(2)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

/// Recomputes the SGPA summary from source marks and persists it onto the
/// semester result row. sgpa stays NULL while the result has no marks.
pub fn refresh_semester_summary(
    conn: &Connection,
    semester_result_id: &str,
) -> Result<calc::SemesterSummary, HandlerErr> {
    let marks = credited_marks(conn, semester_result_id)?;
    let has_marks = !marks.is_empty();
    let summary = calc::semester_summary(marks);
    let sgpa: Option<f64> = if has_marks { Some(summary.sgpa) } else { None };
    conn.execute(
        "UPDATE semester_results
         SET sgpa = ?, total_credits = ?, credits_earned = ?, updated_at = ?
         WHERE id = ?",
        (
            sgpa,
            summary.total_credits,
            summary.credits_earned,
            now_rfc3339(),
            semester_result_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(summary)
}

/// CGPA over all marks belonging to the student's published results.
/// Always recomputed from source rows; unpublished semesters never
/// contribute.
pub fn calculate_cgpa(conn: &Connection, student_id: &str) -> Result<f64, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT m.grade_point, sub.credits
             FROM subject_marks m
             JOIN subjects sub ON sub.id = m.subject_id
             JOIN semester_results sr ON sr.id = m.semester_result_id
             WHERE sr.student_id = ? AND sr.is_published = 1",
        )
        .map_err(HandlerErr::db)?;
    let marks = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(calc::cumulative_gpa(marks))
}

/// Obtained-over-maximum percentage across a result's marks.
pub fn result_percentage(
    conn: &Connection,
    semester_result_id: &str,
) -> Result<f64, HandlerErr> {
    let (obtained, max): (i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(m.total_marks), 0), COALESCE(SUM(sub.max_marks), 0)
             FROM subject_marks m
             JOIN subjects sub ON sub.id = m.subject_id
             WHERE m.semester_result_id = ?",
            [semester_result_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(HandlerErr::db)?;
    if max == 0 {
        return Ok(0.0);
    }
    Ok(calc::round2(obtained as f64 / max as f64 * 100.0))
}

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

use crate::auth::Role;
use crate::calc;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    calculate_cgpa, get_optional_str, get_required_i64, get_required_str, require_session,
    require_student, result_percentage, validate_academic_year,
};
use crate::ipc::types::{AppState, Request};

struct PerformanceTarget {
    student_id: String,
    current_semester: i64,
    include_unpublished: bool,
}

/// Admins can inspect any student; a student only themselves. Teachers
/// get the per-subject views instead.
fn resolve_target(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<PerformanceTarget, HandlerErr> {
    let session = require_session(state)?;
    match session.role {
        Role::Admin => {
            let student_id = get_required_str(params, "studentId")?;
            let current_semester: Option<i64> = conn
                .query_row(
                    "SELECT current_semester FROM students WHERE id = ?",
                    [&student_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db)?;
            let current_semester = current_semester
                .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;
            Ok(PerformanceTarget {
                student_id,
                current_semester,
                include_unpublished: true,
            })
        }
        Role::Student => {
            if let Some(requested) = get_optional_str(params, "studentId") {
                let own = require_student(state, conn)?;
                if requested != own.student_id {
                    return Err(HandlerErr::new(
                        "forbidden",
                        "students may only view their own performance",
                    ));
                }
            }
            let own = require_student(state, conn)?;
            Ok(PerformanceTarget {
                student_id: own.student_id,
                current_semester: own.current_semester,
                include_unpublished: false,
            })
        }
        Role::Teacher => Err(HandlerErr::new(
            "forbidden",
            "teachers view performance per subject",
        )),
    }
}

fn analytics_student_performance(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let target = resolve_target(state, conn, params)?;

    // SGPA trend over published semesters.
    let published: Vec<(String, i64, Option<f64>)> = {
        let mut stmt = conn
            .prepare(
                "SELECT id, semester, sgpa FROM semester_results
                 WHERE student_id = ? AND is_published = 1
                 ORDER BY academic_year, semester",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map([&target.student_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };
    let mut sgpa_data = Vec::with_capacity(published.len());
    for (result_id, semester, sgpa) in &published {
        sgpa_data.push(json!({
            "semester": semester,
            "sgpa": sgpa,
            "percentage": result_percentage(conn, result_id)?,
        }));
    }

    // Current-semester subject marks. Students only see marks once the
    // result is published; the admin view includes work in progress.
    let subject_performance: Vec<serde_json::Value> = {
        let mut sql = String::from(
            "SELECT sub.code, sub.name, m.total_marks, sub.max_marks,
                    m.grade, m.grade_point, m.is_passed
             FROM subject_marks m
             JOIN subjects sub ON sub.id = m.subject_id
             JOIN semester_results sr ON sr.id = m.semester_result_id
             WHERE sr.student_id = ? AND sr.semester = ?",
        );
        if !target.include_unpublished {
            sql.push_str(" AND sr.is_published = 1");
        }
        sql.push_str(" ORDER BY sub.code");
        let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
        stmt.query_map((&target.student_id, target.current_semester), |r| {
            let total: i64 = r.get(2)?;
            let max: i64 = r.get(3)?;
            let pct = if max == 0 {
                0.0
            } else {
                calc::round2(total as f64 / max as f64 * 100.0)
            };
            Ok(json!({
                "subjectCode": r.get::<_, String>(0)?,
                "subjectName": r.get::<_, String>(1)?,
                "totalMarks": total,
                "maxMarks": max,
                "percentage": pct,
                "grade": r.get::<_, String>(4)?,
                "gradePoint": r.get::<_, f64>(5)?,
                "isPassed": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };

    let attendance_data: Vec<serde_json::Value> = {
        let mut stmt = conn
            .prepare(
                "SELECT sub.code, sub.name, a.total_classes, a.attended_classes, a.percentage
                 FROM attendance a
                 JOIN subjects sub ON sub.id = a.subject_id
                 WHERE a.student_id = ? AND a.semester = ?
                 ORDER BY sub.code",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map((&target.student_id, target.current_semester), |r| {
            let pct: f64 = r.get(4)?;
            Ok(json!({
                "subjectCode": r.get::<_, String>(0)?,
                "subjectName": r.get::<_, String>(1)?,
                "totalClasses": r.get::<_, i64>(2)?,
                "attendedClasses": r.get::<_, i64>(3)?,
                "percentage": pct,
                "status": calc::attendance_status(pct).as_str(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };

    // Grade histogram plus the pass/fail tally over published marks.
    let published_marks: Vec<(String, bool)> = {
        let mut stmt = conn
            .prepare(
                "SELECT m.grade, m.is_passed
                 FROM subject_marks m
                 JOIN semester_results sr ON sr.id = m.semester_result_id
                 WHERE sr.student_id = ? AND sr.is_published = 1",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map([&target.student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };
    let mut histogram: BTreeMap<String, i64> = BTreeMap::new();
    for (grade, _) in &published_marks {
        *histogram.entry(grade.clone()).or_insert(0) += 1;
    }
    let grade_distribution: Vec<serde_json::Value> = histogram
        .into_iter()
        .map(|(grade, count)| json!({ "grade": grade, "count": count }))
        .collect();

    let total_subjects = published_marks.len();
    let passed_subjects = published_marks.iter().filter(|(_, p)| *p).count();
    let pass_percentage = if total_subjects > 0 {
        calc::round2(passed_subjects as f64 / total_subjects as f64 * 100.0)
    } else {
        0.0
    };

    Ok(json!({
        "sgpaData": sgpa_data,
        "subjectPerformance": subject_performance,
        "attendanceData": attendance_data,
        "gradeDistribution": grade_distribution,
        "cgpa": calculate_cgpa(conn, &target.student_id)?,
        "summary": {
            "totalSubjects": total_subjects,
            "passedSubjects": passed_subjects,
            "failedSubjects": total_subjects - passed_subjects,
            "passPercentage": pass_percentage,
        }
    }))
}

/// Class-level rollup for one (program, semester, academic year) slice.
/// "Passed" means the student earned every credit they attempted.
fn analytics_class_summary(
    state: &AppState,
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = require_session(state)?;
    if session.role == Role::Student {
        return Err(HandlerErr::new("forbidden", "requires admin or teacher role"));
    }
    let program_id = get_required_str(params, "programId")?;
    let semester = get_required_i64(params, "semester")?;
    let academic_year = get_required_str(params, "academicYear")?;
    validate_academic_year(&academic_year)?;

    let rows: Vec<(String, String, Option<f64>, i64, i64)> = {
        let mut stmt = conn
            .prepare(
                "SELECT st.enrollment_number, u.first_name || ' ' || u.last_name,
                        sr.sgpa, sr.total_credits, sr.credits_earned
                 FROM semester_results sr
                 JOIN students st ON st.id = sr.student_id
                 JOIN users u ON u.id = st.user_id
                 WHERE st.program_id = ? AND sr.semester = ? AND sr.academic_year = ?",
            )
            .map_err(HandlerErr::db)?;
        stmt.query_map((&program_id, semester, &academic_year), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?
    };

    let total_students = rows.len();
    let sgpas: Vec<f64> = rows.iter().filter_map(|(_, _, s, _, _)| *s).collect();
    let avg_sgpa = if sgpas.is_empty() {
        0.0
    } else {
        calc::round2(sgpas.iter().sum::<f64>() / sgpas.len() as f64)
    };
    let passed = rows
        .iter()
        .filter(|(_, _, _, total, earned)| *total > 0 && earned == total)
        .count();
    let pass_percentage = if total_students > 0 {
        calc::round2(passed as f64 / total_students as f64 * 100.0)
    } else {
        0.0
    };

    let mut ranked: Vec<&(String, String, Option<f64>, i64, i64)> =
        rows.iter().filter(|(_, _, s, _, _)| s.is_some()).collect();
    ranked.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let top_performers: Vec<serde_json::Value> = ranked
        .iter()
        .take(5)
        .map(|(enrollment, name, sgpa, _, _)| {
            json!({
                "enrollmentNumber": enrollment,
                "displayName": name.trim(),
                "sgpa": sgpa,
            })
        })
        .collect();

    Ok(json!({
        "totalStudents": total_students,
        "avgSgpa": avg_sgpa,
        "passed": passed,
        "failed": total_students - passed,
        "passPercentage": pass_percentage,
        "topPerformers": top_performers,
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
        "analytics.studentPerformance" => {
            Some(with_conn(state, req, analytics_student_performance))
        }
        "analytics.classSummary" => Some(with_conn(state, req, analytics_class_summary)),
        _ => None,
    }
}

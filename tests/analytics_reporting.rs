use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_srmd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn srmd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(stdin, reader, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result")
}

struct Seeded {
    program_id: String,
    student_a: String,
    student_b: String,
}

/// One subject, two students: one clearly passing, one failing the
/// subject. Marks are entered and optionally published, leaving the
/// admin logged in.
fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
    publish: bool,
) -> Seeded {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "users.create",
        json!({
            "username": "admin",
            "password": "admin-pass",
            "role": "admin",
            "firstName": "Site",
            "lastName": "Admin"
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    let program = request_ok(
        stdin,
        reader,
        "s4",
        "programs.create",
        json!({ "name": "Analytics BCA", "totalSemesters": 6 }),
    );
    let program_id = program["programId"].as_str().expect("programId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "ANA101",
            "name": "Analysis",
            "semester": 1,
            "credits": 4
        }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let teacher = request_ok(
        stdin,
        reader,
        "s6",
        "teachers.create",
        json!({
            "username": "t.ana",
            "password": "teach-pass",
            "firstName": "Ana",
            "lastName": "Teacher",
            "employeeId": "EMP-400"
        }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s7",
        "teachers.assignSubjects",
        json!({ "teacherId": teacher_id, "subjectIds": [subject_id] }),
    );
    let a = request_ok(
        stdin,
        reader,
        "s8",
        "students.create",
        json!({
            "username": "s.ana-a",
            "password": "stud-pass",
            "firstName": "Ana",
            "lastName": "Able",
            "enrollmentNumber": "ANA-2024-001",
            "programId": program_id,
            "batchYear": 2024
        }),
    );
    let b = request_ok(
        stdin,
        reader,
        "s9",
        "students.create",
        json!({
            "username": "s.ana-b",
            "password": "stud-pass",
            "firstName": "Ana",
            "lastName": "Baker",
            "enrollmentNumber": "ANA-2024-002",
            "programId": program_id,
            "batchYear": 2024
        }),
    );
    let student_a = a["studentId"].as_str().expect("studentId").to_string();
    let student_b = b["studentId"].as_str().expect("studentId").to_string();

    let _ = request_ok(
        stdin,
        reader,
        "s10",
        "auth.login",
        json!({ "username": "t.ana", "password": "teach-pass" }),
    );
    // 92 -> O, 30 -> F and below the passing marks.
    let entry = request_ok(
        stdin,
        reader,
        "s11",
        "marks.bulkEntry",
        json!({
            "subjectId": subject_id,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": student_a, "internal": 30, "external": 62 },
                { "studentId": student_b, "internal": 10, "external": 20 }
            ]
        }),
    );
    assert_eq!(entry["saved"], json!(2));
    let _ = request_ok(
        stdin,
        reader,
        "s12",
        "attendance.bulkEntry",
        json!({
            "subjectId": subject_id,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": student_a, "totalClasses": 40, "attendedClasses": 36 },
                { "studentId": student_b, "totalClasses": 40, "attendedClasses": 20 }
            ]
        }),
    );

    let _ = request_ok(
        stdin,
        reader,
        "s13",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    if publish {
        let published = request_ok(
            stdin,
            reader,
            "s14",
            "results.publish",
            json!({ "semester": 1, "academicYear": "2024-25" }),
        );
        assert_eq!(published["published"], json!(2));
    }
    Seeded {
        program_id,
        student_a,
        student_b,
    }
}

#[test]
fn student_performance_reports_trend_attendance_and_grades() {
    let workspace = temp_dir("srmd-ana-student");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace, true);

    let perf = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "analytics.studentPerformance",
        json!({ "studentId": seeded.student_a }),
    );
    let sgpa_data = perf["sgpaData"].as_array().expect("sgpaData");
    assert_eq!(sgpa_data.len(), 1);
    assert_eq!(sgpa_data[0]["semester"], json!(1));
    assert_eq!(sgpa_data[0]["sgpa"], json!(10.0));
    assert_eq!(sgpa_data[0]["percentage"], json!(92.0));

    let subjects = perf["subjectPerformance"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["grade"], json!("O"));

    let attendance = perf["attendanceData"].as_array().expect("attendance");
    assert_eq!(attendance.len(), 1);
    assert_eq!(attendance[0]["status"], json!("Good"));

    let distribution = perf["gradeDistribution"].as_array().expect("distribution");
    assert_eq!(distribution.len(), 1);
    assert_eq!(distribution[0]["grade"], json!("O"));
    assert_eq!(distribution[0]["count"], json!(1));

    assert_eq!(perf["cgpa"], json!(10.0));
    assert_eq!(perf["summary"]["totalSubjects"], json!(1));
    assert_eq!(perf["summary"]["passedSubjects"], json!(1));
    assert_eq!(perf["summary"]["failedSubjects"], json!(0));
    assert_eq!(perf["summary"]["passPercentage"], json!(100.0));

    // The failing student's summary counts the miss.
    let perf_b = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "analytics.studentPerformance",
        json!({ "studentId": seeded.student_b }),
    );
    assert_eq!(perf_b["summary"]["failedSubjects"], json!(1));
    assert_eq!(perf_b["summary"]["passPercentage"], json!(0.0));
    assert_eq!(perf_b["cgpa"], json!(0.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_cannot_read_each_others_performance() {
    let workspace = temp_dir("srmd-ana-privacy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace, true);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "username": "s.ana-a", "password": "stud-pass" }),
    );
    let own = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "analytics.studentPerformance",
        json!({}),
    );
    assert_eq!(own["cgpa"], json!(10.0));

    let other = request(
        &mut stdin,
        &mut reader,
        "3",
        "analytics.studentPerformance",
        json!({ "studentId": seeded.student_b }),
    );
    assert_eq!(other["ok"], json!(false));
    assert_eq!(other["error"]["code"], json!("forbidden"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_analytics_omits_marks_until_publication() {
    let workspace = temp_dir("srmd-ana-unpublished");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace, false);

    // The admin sees work in progress.
    let admin_view = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "analytics.studentPerformance",
        json!({ "studentId": seeded.student_a }),
    );
    assert_eq!(
        admin_view["subjectPerformance"]
            .as_array()
            .expect("subjects")
            .len(),
        1
    );
    assert_eq!(admin_view["sgpaData"].as_array().expect("sgpaData").len(), 0);

    // The student sees no marks anywhere before publication.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "s.ana-a", "password": "stud-pass" }),
    );
    let before = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "analytics.studentPerformance",
        json!({}),
    );
    assert_eq!(
        before["subjectPerformance"]
            .as_array()
            .expect("subjects")
            .len(),
        0
    );
    assert_eq!(before["sgpaData"].as_array().expect("sgpaData").len(), 0);
    assert_eq!(
        before["gradeDistribution"]
            .as_array()
            .expect("distribution")
            .len(),
        0
    );
    assert_eq!(before["cgpa"], json!(0.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.publish",
        json!({ "semester": 1, "academicYear": "2024-25" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "username": "s.ana-a", "password": "stud-pass" }),
    );
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "analytics.studentPerformance",
        json!({}),
    );
    let subjects = after["subjectPerformance"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 1);
    assert_eq!(subjects[0]["grade"], json!("O"));
    assert_eq!(after["cgpa"], json!(10.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_summary_counts_full_credit_earners_as_passed() {
    let workspace = temp_dir("srmd-ana-class");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace, true);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "analytics.classSummary",
        json!({
            "programId": seeded.program_id,
            "semester": 1,
            "academicYear": "2024-25"
        }),
    );
    assert_eq!(summary["totalStudents"], json!(2));
    // SGPAs are 10.0 and 0.0.
    assert_eq!(summary["avgSgpa"], json!(5.0));
    assert_eq!(summary["passed"], json!(1));
    assert_eq!(summary["failed"], json!(1));
    assert_eq!(summary["passPercentage"], json!(50.0));

    let top = summary["topPerformers"].as_array().expect("topPerformers");
    assert_eq!(top.len(), 2);
    assert_eq!(top[0]["enrollmentNumber"], json!("ANA-2024-001"));
    assert_eq!(top[0]["sgpa"], json!(10.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("srmd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.srmbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First account on a fresh workspace bootstraps the admin.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
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
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "5", "auth.whoami", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.loginHistory",
        json!({}),
    );

    let program = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "programs.create",
        json!({ "name": "Smoke BCA", "durationYears": 3, "totalSemesters": 6 }),
    );
    let program_id = program["programId"].as_str().expect("programId").to_string();
    let _ = request_ok(&mut stdin, &mut reader, "8", "programs.list", json!({}));

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "BCA101",
            "name": "Programming Fundamentals",
            "semester": 1,
            "credits": 4
        }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.list",
        json!({ "programId": program_id }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "teachers.create",
        json!({
            "username": "t.smoke",
            "password": "teach-pass",
            "firstName": "Smoke",
            "lastName": "Teacher",
            "employeeId": "EMP-001"
        }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let _ = request_ok(&mut stdin, &mut reader, "12", "teachers.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "teachers.assignSubjects",
        json!({ "teacherId": teacher_id, "subjectIds": [subject_id] }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.create",
        json!({
            "username": "s.smoke",
            "password": "stud-pass",
            "firstName": "Smoke",
            "lastName": "Student",
            "enrollmentNumber": "BCA-2024-001",
            "programId": program_id,
            "batchYear": 2024
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "students.list",
        json!({ "programId": program_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "students.update",
        json!({ "studentId": student_id, "patch": { "guardianName": "Smoke Guardian" } }),
    );

    // Teacher enters marks and attendance.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "auth.login",
        json!({ "username": "t.smoke", "password": "teach-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "teachers.subjects",
        json!({}),
    );
    let entry = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "marks.bulkEntry",
        json!({
            "subjectId": subject_id,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": student_id, "internal": 28, "external": 57 }
            ]
        }),
    );
    assert_eq!(entry["saved"], json!(1));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "marks.subjectResults",
        json!({ "subjectId": subject_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "attendance.bulkEntry",
        json!({
            "subjectId": subject_id,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": student_id, "totalClasses": 40, "attendedClasses": 36 }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "attendance.subjectRecords",
        json!({ "subjectId": subject_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "analytics.classSummary",
        json!({ "programId": program_id, "semester": 1, "academicYear": "2024-25" }),
    );

    // Admin publishes and exports.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    let published = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "results.publish",
        json!({ "semester": 1, "academicYear": "2024-25" }),
    );
    assert_eq!(published["published"], json!(1));
    let _ = request_ok(&mut stdin, &mut reader, "26", "results.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "27",
        "results.dashboard",
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "analytics.studentPerformance",
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "29",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "30",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );

    // Import drops the session; the student logs back in for the
    // self-service views.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "31",
        "auth.login",
        json!({ "username": "s.smoke", "password": "stud-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "32",
        "results.studentResults",
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "33",
        "results.semesterDetail",
        json!({ "semester": 1 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "34",
        "attendance.studentOverview",
        json!({}),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "35",
        "analytics.studentPerformance",
        json!({}),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

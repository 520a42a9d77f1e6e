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
    subject1: String,
    subject2: String,
    student_a: String,
    student_b: String,
}

/// Two subjects in semester 1, assigned teacher, two students. Leaves
/// the teacher logged in.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Seeded {
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
        json!({ "name": "Attendance BCA", "totalSemesters": 6 }),
    );
    let program_id = program["programId"].as_str().expect("programId").to_string();
    let sub1 = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "ATT101",
            "name": "Subject One",
            "semester": 1,
            "credits": 4
        }),
    );
    let sub2 = request_ok(
        stdin,
        reader,
        "s6",
        "subjects.create",
        json!({
            "programId": program_id,
            "code": "ATT102",
            "name": "Subject Two",
            "semester": 1,
            "credits": 3
        }),
    );
    let subject1 = sub1["subjectId"].as_str().expect("subjectId").to_string();
    let subject2 = sub2["subjectId"].as_str().expect("subjectId").to_string();
    let teacher = request_ok(
        stdin,
        reader,
        "s7",
        "teachers.create",
        json!({
            "username": "t.att",
            "password": "teach-pass",
            "firstName": "Att",
            "lastName": "Teacher",
            "employeeId": "EMP-300"
        }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s8",
        "teachers.assignSubjects",
        json!({ "teacherId": teacher_id, "subjectIds": [subject1, subject2] }),
    );
    let a = request_ok(
        stdin,
        reader,
        "s9",
        "students.create",
        json!({
            "username": "s.att-a",
            "password": "stud-pass",
            "firstName": "Att",
            "lastName": "Able",
            "enrollmentNumber": "ATT-2024-001",
            "programId": program_id,
            "batchYear": 2024
        }),
    );
    let b = request_ok(
        stdin,
        reader,
        "s10",
        "students.create",
        json!({
            "username": "s.att-b",
            "password": "stud-pass",
            "firstName": "Att",
            "lastName": "Baker",
            "enrollmentNumber": "ATT-2024-002",
            "programId": program_id,
            "batchYear": 2024
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s11",
        "auth.login",
        json!({ "username": "t.att", "password": "teach-pass" }),
    );
    Seeded {
        subject1,
        subject2,
        student_a: a["studentId"].as_str().expect("studentId").to_string(),
        student_b: b["studentId"].as_str().expect("studentId").to_string(),
    }
}

#[test]
fn bulk_entry_stores_percentage_and_rejects_impossible_counts() {
    let workspace = temp_dir("srmd-att-entry");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    // Attending more classes than were held is a per-row rejection; the
    // valid row still lands.
    let entry = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject1,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 40, "attendedClasses": 30 },
                { "studentId": seeded.student_b, "totalClasses": 40, "attendedClasses": 41 }
            ]
        }),
    );
    assert_eq!(entry["saved"], json!(1));
    assert_eq!(entry["skipped"], json!(1));
    let errors = entry["errors"].as_array().expect("errors");
    assert_eq!(errors[0]["code"], json!("bad_params"));

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.subjectRecords",
        json!({ "subjectId": seeded.subject1 }),
    );
    let rows = records["records"].as_array().expect("records");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["percentage"], json!(75.0));
    assert_eq!(rows[0]["status"], json!("Good"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn status_bands_follow_percentage_thresholds() {
    let workspace = temp_dir("srmd-att-bands");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject1,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 100, "attendedClasses": 60 },
                { "studentId": seeded.student_b, "totalClasses": 100, "attendedClasses": 59 }
            ]
        }),
    );
    let records = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.subjectRecords",
        json!({ "subjectId": seeded.subject1 }),
    );
    let rows = records["records"].as_array().expect("records");
    assert_eq!(rows[0]["enrollmentNumber"], json!("ATT-2024-001"));
    assert_eq!(rows[0]["status"], json!("Average"));
    assert_eq!(rows[1]["status"], json!("Poor"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_overview_aggregates_across_subjects() {
    let workspace = temp_dir("srmd-att-overview");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject1,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 40, "attendedClasses": 36 }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject2,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 20, "attendedClasses": 9 }
            ]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "s.att-a", "password": "stud-pass" }),
    );
    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.studentOverview",
        json!({}),
    );
    let records = overview["records"].as_array().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["subjectCode"], json!("ATT101"));
    assert_eq!(records[0]["percentage"], json!(90.0));
    assert_eq!(records[1]["percentage"], json!(45.0));
    // 45 of 60 classes overall.
    assert_eq!(overview["overallPercentage"], json!(75.0));
    assert_eq!(overview["overallStatus"], json!("Good"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn inactive_subjects_and_malformed_years_are_rejected() {
    let workspace = temp_dir("srmd-att-inactive");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let bad_year = request(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.subjectRecords",
        json!({ "subjectId": seeded.subject1, "academicYear": "2024-2025" }),
    );
    assert_eq!(bad_year["ok"], json!(false));
    assert_eq!(bad_year["error"]["code"], json!("bad_params"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "username": "admin", "password": "admin-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.update",
        json!({ "subjectId": seeded.subject2, "patch": { "isActive": false } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "username": "t.att", "password": "teach-pass" }),
    );
    let inactive = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject2,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 40, "attendedClasses": 30 }
            ]
        }),
    );
    assert_eq!(inactive["ok"], json!(false));
    assert_eq!(inactive["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn zero_classes_yield_zero_percent_without_error() {
    let workspace = temp_dir("srmd-att-zero");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let seeded = seed(&mut stdin, &mut reader, &workspace);

    let entry = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkEntry",
        json!({
            "subjectId": seeded.subject1,
            "academicYear": "2024-25",
            "entries": [
                { "studentId": seeded.student_a, "totalClasses": 0, "attendedClasses": 0 }
            ]
        }),
    );
    assert_eq!(entry["saved"], json!(1));

    let records = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.subjectRecords",
        json!({ "subjectId": seeded.subject1 }),
    );
    let rows = records["records"].as_array().expect("records");
    assert_eq!(rows[0]["percentage"], json!(0.0));
    assert_eq!(rows[0]["status"], json!("Poor"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

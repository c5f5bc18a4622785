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
    let exe = env!("CARGO_BIN_EXE_schedulerd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schedulerd");
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn setup_context(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> i64 {
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(stdin, reader, "s2", "years.create", json!({ "year": 2567 }));
    let year_id = year.get("id").and_then(|v| v.as_i64()).expect("year id");
    request_ok(
        stdin,
        reader,
        "s3",
        "years.setActive",
        json!({ "yearId": year_id }),
    );
    let semester = request_ok(
        stdin,
        reader,
        "s4",
        "semesters.create",
        json!({ "name": "Semester 1/2567" }),
    );
    let semester_id = semester.get("id").and_then(|v| v.as_i64()).expect("semester id");
    request_ok(
        stdin,
        reader,
        "s5",
        "semesters.setActive",
        json!({ "semesterId": semester_id }),
    );
    semester_id
}

#[test]
fn room_uniqueness_and_type_are_enforced() {
    let workspace = temp_dir("schedulerd-crud-rooms");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "rooms.create",
        json!({ "semesterId": semester_id, "roomName": "R101", "roomType": "general" }),
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "rooms.create",
        json!({ "semesterId": semester_id, "roomName": "R101", "roomType": "computer-lab" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("duplicate"));
    assert_eq!(
        error.get("message").and_then(|v| v.as_str()),
        Some("Room already exists for this semester")
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "rooms.create",
        json!({ "semesterId": semester_id, "roomName": "R102", "roomType": "lecture-hall" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // Same name in another semester is a different room.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "rooms.create",
        json!({ "semesterId": semester_id + 1, "roomName": "R101", "roomType": "general" }),
    );
}

#[test]
fn class_uniqueness_and_section_validation() {
    let workspace = temp_dir("schedulerd-crud-classes");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({ "semesterId": semester_id, "gradeLevel": "M1", "section": 1 }),
    );
    assert_eq!(class.get("className").and_then(|v| v.as_str()), Some("M1/1"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "semesterId": semester_id, "gradeLevel": "M1", "section": 1 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("duplicate"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "semesterId": semester_id, "gradeLevel": "M1", "section": 0 }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}

#[test]
fn teacher_email_duplicates_and_full_name_projection() {
    let workspace = temp_dir("schedulerd-crud-teachers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "teachers.create",
        json!({
            "semesterId": semester_id,
            "title": "Mr.",
            "firstName": "Anan",
            "lastName": "Srisuk",
            "email": "anan@school.ac.th",
            "subjectGroup": "Mathematics"
        }),
    );
    assert_eq!(
        teacher.get("fullName").and_then(|v| v.as_str()),
        Some("Mr. Anan Srisuk")
    );

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({
            "semesterId": semester_id,
            "firstName": "Somchai",
            "lastName": "Srisuk",
            "email": "anan@school.ac.th",
            "subjectGroup": "Science"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("duplicate"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({
            "semesterId": semester_id,
            "firstName": "Somchai",
            "lastName": "Srisuk",
            "subjectGroup": "Science",
            "role": "janitor"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}

#[test]
fn updates_against_missing_rows_report_not_found() {
    let workspace = temp_dir("schedulerd-crud-notfound");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "teachers.update",
        json!({ "teacherId": 999, "semesterId": semester_id, "firstName": "Nobody" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "rooms.delete",
        json!({ "roomId": 999, "semesterId": semester_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    // A row that exists under another semester id is invisible here.
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({
            "semesterId": semester_id,
            "firstName": "Anan",
            "lastName": "Srisuk",
            "subjectGroup": "Mathematics"
        }),
    );
    let teacher_id = teacher.get("id").and_then(|v| v.as_i64()).expect("id");
    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.update",
        json!({ "teacherId": teacher_id, "semesterId": semester_id + 1, "firstName": "Anon" }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn referenced_rows_cannot_be_deleted() {
    let workspace = temp_dir("schedulerd-crud-refs");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    let teacher_id = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "teachers.create",
        json!({
            "semesterId": semester_id,
            "firstName": "Anan",
            "lastName": "Srisuk",
            "subjectGroup": "Mathematics"
        }),
    )
    .get("id")
    .and_then(|v| v.as_i64())
    .expect("teacher");
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "semesterId": semester_id, "gradeLevel": "M1", "section": 1 }),
    )
    .get("id")
    .and_then(|v| v.as_i64())
    .expect("class");
    let room_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "rooms.create",
        json!({ "semesterId": semester_id, "roomName": "R101", "roomType": "general" }),
    )
    .get("id")
    .and_then(|v| v.as_i64())
    .expect("room");

    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({
            "semesterId": semester_id,
            "teacherId": teacher_id,
            "classIds": [class_id],
            "subjectName": "Algebra",
            "periodsPerWeek": 3
        }),
    )
    .get("subjects")
    .and_then(|v| v.as_array())
    .and_then(|rows| rows[0].get("id"))
    .and_then(|v| v.as_i64())
    .expect("subject");

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedules.create",
        json!({
            "semesterId": semester_id,
            "subjectId": subject_id,
            "dayOfWeek": 1,
            "periodNo": 1,
            "roomId": room_id
        }),
    );

    // Teacher and class are pinned by the subject, the room and subject by
    // the schedule slot.
    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "teachers.delete",
        json!({ "teacherId": teacher_id, "semesterId": semester_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("in_use"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "classes.delete",
        json!({ "classId": class_id, "semesterId": semester_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("in_use"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "rooms.delete",
        json!({ "roomId": room_id, "semesterId": semester_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("in_use"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.delete",
        json!({ "subjectId": subject_id, "semesterId": semester_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("in_use"));

    // The blocked rows are all still present.
    let rooms = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "rooms.list",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(
        rooms.get("rooms").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "subjects.list",
        json!({ "semesterId": semester_id }),
    );
    assert_eq!(
        subjects
            .get("subjects")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    // Dropping the schedule slot unblocks the chain bottom-up.
    let schedules = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "schedules.list",
        json!({ "semesterId": semester_id }),
    );
    let schedule_id = schedules
        .get("schedules")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows[0].get("id"))
        .and_then(|v| v.as_i64())
        .expect("schedule id");
    request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "schedules.delete",
        json!({ "scheduleId": schedule_id, "semesterId": semester_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "subjects.delete",
        json!({ "subjectId": subject_id, "semesterId": semester_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "teachers.delete",
        json!({ "teacherId": teacher_id, "semesterId": semester_id }),
    );
}

#[test]
fn period_crud_validates_numbers_and_time_ranges() {
    let workspace = temp_dir("schedulerd-crud-periods");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let semester_id = setup_context(&mut stdin, &mut reader, &workspace);

    // The pair was seeded on activation; period 9 is free.
    let period = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "periods.create",
        json!({
            "semesterId": semester_id,
            "periodNo": 9,
            "periodName": "Period 9",
            "startTime": "15:30",
            "endTime": "16:20"
        }),
    );
    let period_id = period.get("id").and_then(|v| v.as_i64()).expect("period id");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "periods.create",
        json!({
            "semesterId": semester_id,
            "periodNo": 9,
            "periodName": "Period 9 again",
            "startTime": "16:20",
            "endTime": "17:10"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("duplicate"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "periods.create",
        json!({
            "semesterId": semester_id,
            "periodNo": 13,
            "periodName": "Period 13",
            "startTime": "17:10",
            "endTime": "18:00"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "periods.update",
        json!({
            "periodId": period_id,
            "semesterId": semester_id,
            "endTime": "15:00"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "periods.update",
        json!({
            "periodId": period_id,
            "semesterId": semester_id,
            "periodName": "Late study",
            "endTime": "16:30"
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "periods.delete",
        json!({ "periodId": period_id, "semesterId": semester_id }),
    );
}

use crate::db::{self, year_table};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_i64, get_required_i64, is_unique_violation, provision_failed,
    query_failed, require_db, resolve_year, translate_delete_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

const PERIOD_NO_MAX: i64 = 12;

struct SlotCandidate {
    semester_id: i64,
    subject_id: i64,
    day_of_week: i64,
    period_no: i64,
    room_id: Option<i64>,
    exclude_schedule_id: Option<i64>,
}

fn parse_candidate(params: &serde_json::Value) -> Result<SlotCandidate, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let subject_id = get_required_i64(params, "subjectId")?;
    let day_of_week = get_required_i64(params, "dayOfWeek")?;
    let period_no = get_required_i64(params, "periodNo")?;
    if !(1..=7).contains(&day_of_week) {
        return Err(HandlerErr::bad_params("dayOfWeek must be between 1 and 7"));
    }
    if !(1..=PERIOD_NO_MAX).contains(&period_no) {
        return Err(HandlerErr::bad_params(format!(
            "periodNo must be between 1 and {}",
            PERIOD_NO_MAX
        )));
    }
    Ok(SlotCandidate {
        semester_id,
        subject_id,
        day_of_week,
        period_no,
        room_id: get_opt_i64(params, "roomId"),
        exclude_schedule_id: get_opt_i64(params, "excludeScheduleId"),
    })
}

fn subject_exists(
    conn: &Connection,
    year: i64,
    subject_id: i64,
    semester_id: i64,
) -> Result<bool, HandlerErr> {
    let t = year_table("subjects", year);
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {t} WHERE id = ? AND semester_id = ?"),
            (subject_id, semester_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

fn period_active(conn: &Connection, year: i64, semester_id: i64, period_no: i64) -> Result<bool, HandlerErr> {
    let t = year_table("periods", year);
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT id FROM {t} WHERE semester_id = ? AND period_no = ? AND is_active = 1"
            ),
            (semester_id, period_no),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

/// Does any other slot at the same time belong to a subject taught by the
/// candidate subject's teacher?
fn teacher_conflict(conn: &Connection, year: i64, c: &SlotCandidate) -> Result<bool, HandlerErr> {
    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {schedules} sch
                 JOIN {subjects} sub1 ON sch.subject_id = sub1.id
                 JOIN {subjects} sub2 ON sub2.id = ?1
                 WHERE sch.semester_id = ?2 AND sch.day_of_week = ?3 AND sch.period_no = ?4
                   AND sub1.teacher_id = sub2.teacher_id
                   AND (?5 IS NULL OR sch.id <> ?5)
                 LIMIT 1"
            ),
            (
                c.subject_id,
                c.semester_id,
                c.day_of_week,
                c.period_no,
                c.exclude_schedule_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

/// Does any other slot at the same time belong to a subject for the candidate
/// subject's class? Group siblings carry distinct class rows, so two slots of
/// one subject group at the same time are not a class conflict.
fn class_conflict(conn: &Connection, year: i64, c: &SlotCandidate) -> Result<bool, HandlerErr> {
    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {schedules} sch
                 JOIN {subjects} sub1 ON sch.subject_id = sub1.id
                 JOIN {subjects} sub2 ON sub2.id = ?1
                 WHERE sch.semester_id = ?2 AND sch.day_of_week = ?3 AND sch.period_no = ?4
                   AND sub1.class_id = sub2.class_id
                   AND (?5 IS NULL OR sch.id <> ?5)
                 LIMIT 1"
            ),
            (
                c.subject_id,
                c.semester_id,
                c.day_of_week,
                c.period_no,
                c.exclude_schedule_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

fn room_conflict(conn: &Connection, year: i64, c: &SlotCandidate) -> Result<bool, HandlerErr> {
    let Some(room_id) = c.room_id else {
        return Ok(false);
    };
    let schedules = year_table("schedules", year);
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {schedules}
                 WHERE semester_id = ?1 AND day_of_week = ?2 AND period_no = ?3 AND room_id = ?4
                   AND (?5 IS NULL OR id <> ?5)
                 LIMIT 1"
            ),
            (
                c.semester_id,
                c.day_of_week,
                c.period_no,
                room_id,
                c.exclude_schedule_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

fn conflict_err(kinds: Vec<&'static str>) -> HandlerErr {
    let labels: Vec<&str> = kinds
        .iter()
        .map(|k| match *k {
            "teacher" => "Teacher is already scheduled",
            "class" => "Class is already scheduled",
            _ => "Room is already occupied",
        })
        .collect();
    HandlerErr {
        code: "schedule_conflict",
        message: format!("Schedule conflicts detected: {}", labels.join(", ")),
        details: Some(json!({ "kinds": kinds })),
    }
}

fn schedule_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let subject_id: i64 = row.get(2)?;
    let day_of_week: i64 = row.get(3)?;
    let period_no: i64 = row.get(4)?;
    let room_id: Option<i64> = row.get(5)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "subjectId": subject_id,
        "dayOfWeek": day_of_week,
        "periodNo": period_no,
        "roomId": room_id
    }))
}

fn schedules_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let c = parse_candidate(params)?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;
    db::ensure_default_periods(conn, year, c.semester_id).map_err(provision_failed)?;

    if !subject_exists(conn, year, c.subject_id, c.semester_id)? {
        return Err(HandlerErr::not_found("Subject not found"));
    }
    if !period_active(conn, year, c.semester_id, c.period_no)? {
        return Err(HandlerErr::bad_params(
            "Selected period does not exist for this semester",
        ));
    }

    // Insert-time gate: teacher and class only. Room occupancy is reported by
    // schedules.validate and enforced as a last line of defense by the unique
    // index, not by this pre-check.
    let mut kinds: Vec<&'static str> = Vec::new();
    if teacher_conflict(conn, year, &c)? {
        kinds.push("teacher");
    }
    if class_conflict(conn, year, &c)? {
        kinds.push("class");
    }
    if !kinds.is_empty() {
        return Err(conflict_err(kinds));
    }

    let t = year_table("schedules", year);
    conn.execute(
        &format!(
            "INSERT INTO {t}(semester_id, subject_id, day_of_week, period_no, room_id)
             VALUES(?, ?, ?, ?, ?)"
        ),
        (c.semester_id, c.subject_id, c.day_of_week, c.period_no, c.room_id),
    )
    .map_err(|e| translate_slot_insert_err(e))?;
    let schedule_id = conn.last_insert_rowid();

    conn.query_row(
        &format!(
            "SELECT id, semester_id, subject_id, day_of_week, period_no, room_id
             FROM {t} WHERE id = ?"
        ),
        [schedule_id],
        schedule_row_json,
    )
    .map_err(query_failed)
}

/// Constraint races arrive here after the pre-checks passed: the room unique
/// index is reported as the room conflict the pre-check deliberately skips,
/// the duplicate-slot index as a plain duplicate.
fn translate_slot_insert_err(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        let msg = e.to_string();
        if msg.contains(".room_id") {
            return conflict_err(vec!["room"]);
        }
        return HandlerErr::duplicate("Schedule slot already exists for this subject");
    }
    if let rusqlite::Error::SqliteFailure(f, Some(msg)) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation
            && msg.contains("FOREIGN KEY constraint failed")
        {
            return HandlerErr::bad_params("subjectId or roomId does not exist for this semester");
        }
    }
    HandlerErr::db("db_insert_failed", e)
}

fn schedules_validate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let c = parse_candidate(params)?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    Ok(json!({
        "teacher": teacher_conflict(conn, year, &c)?,
        "class": class_conflict(conn, year, &c)?,
        "room": room_conflict(conn, year, &c)?
    }))
}

fn schedules_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;
    db::ensure_default_periods(conn, year, semester_id).map_err(provision_failed)?;

    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let teachers = year_table("teachers", year);
    let classes = year_table("classes", year);
    let rooms = year_table("rooms", year);
    let periods = year_table("periods", year);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT sch.id, sch.semester_id, sch.subject_id, sch.day_of_week, sch.period_no,
                    sch.room_id,
                    sub.subject_name, sub.subject_code, sub.teacher_id, sub.class_id,
                    TRIM(COALESCE(t.title || ' ', '') || t.f_name || ' ' || t.l_name) AS teacher_name,
                    c.grade_level || '/' || c.section AS class_name,
                    r.room_name,
                    p.period_name, p.start_time, p.end_time
             FROM {schedules} sch
             JOIN {subjects} sub ON sch.subject_id = sub.id
             JOIN {teachers} t ON sub.teacher_id = t.id
             JOIN {classes} c ON sub.class_id = c.id
             LEFT JOIN {rooms} r ON sch.room_id = r.id
             LEFT JOIN {periods} p ON p.semester_id = sch.semester_id
                                  AND p.period_no = sch.period_no
                                  AND p.is_active = 1
             WHERE sch.semester_id = ?
             ORDER BY sch.day_of_week, sch.period_no"
        ))
        .map_err(query_failed)?;

    let rows = stmt
        .query_map([semester_id], |row| {
            let id: i64 = row.get(0)?;
            let semester_id: i64 = row.get(1)?;
            let subject_id: i64 = row.get(2)?;
            let day_of_week: i64 = row.get(3)?;
            let period_no: i64 = row.get(4)?;
            let room_id: Option<i64> = row.get(5)?;
            let subject_name: String = row.get(6)?;
            let subject_code: Option<String> = row.get(7)?;
            let teacher_id: i64 = row.get(8)?;
            let class_id: i64 = row.get(9)?;
            let teacher_name: String = row.get(10)?;
            let class_name: String = row.get(11)?;
            let room_name: Option<String> = row.get(12)?;
            let period_name: Option<String> = row.get(13)?;
            let start_time: Option<String> = row.get(14)?;
            let end_time: Option<String> = row.get(15)?;
            Ok(json!({
                "id": id,
                "semesterId": semester_id,
                "subjectId": subject_id,
                "dayOfWeek": day_of_week,
                "periodNo": period_no,
                "roomId": room_id,
                "subjectName": subject_name,
                "subjectCode": subject_code,
                "teacherId": teacher_id,
                "classId": class_id,
                "teacherName": teacher_name,
                "className": class_name,
                "roomName": room_name,
                "periodName": period_name,
                "startTime": start_time,
                "endTime": end_time
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "schedules": rows }))
}

fn schedules_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let schedule_id = get_required_i64(params, "scheduleId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("schedules", year);
    let changes = conn
        .execute(
            &format!("DELETE FROM {t} WHERE id = ? AND semester_id = ?"),
            (schedule_id, semester_id),
        )
        .map_err(|e| {
            translate_delete_err(
                e,
                "Cannot delete schedule while substitutions still reference it",
            )
        })?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Schedule not found"));
    }

    Ok(json!({ "scheduleId": schedule_id }))
}

struct ScanSlot {
    id: i64,
    day_of_week: i64,
    period_no: i64,
    teacher_id: i64,
    teacher_name: String,
    class_id: i64,
    class_name: String,
    room_id: Option<i64>,
    room_name: Option<String>,
}

/// Reconciliation scan over every stored slot, independent of how the slots
/// got in (the insert gate or out-of-band imports): any `(day, period)` group
/// with more than one slot along a dimension is a conflict record.
fn schedules_conflicts(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let teachers = year_table("teachers", year);
    let classes = year_table("classes", year);
    let rooms = year_table("rooms", year);

    let mut stmt = conn
        .prepare(&format!(
            "SELECT sch.id, sch.day_of_week, sch.period_no,
                    sub.teacher_id,
                    TRIM(COALESCE(t.title || ' ', '') || t.f_name || ' ' || t.l_name) AS teacher_name,
                    sub.class_id,
                    c.grade_level || '/' || c.section AS class_name,
                    sch.room_id, r.room_name
             FROM {schedules} sch
             JOIN {subjects} sub ON sch.subject_id = sub.id
             JOIN {teachers} t ON sub.teacher_id = t.id
             JOIN {classes} c ON sub.class_id = c.id
             LEFT JOIN {rooms} r ON sch.room_id = r.id
             WHERE sch.semester_id = ?
             ORDER BY sch.day_of_week, sch.period_no, sch.id"
        ))
        .map_err(query_failed)?;
    let slots = stmt
        .query_map([semester_id], |row| {
            Ok(ScanSlot {
                id: row.get(0)?,
                day_of_week: row.get(1)?,
                period_no: row.get(2)?,
                teacher_id: row.get(3)?,
                teacher_name: row.get(4)?,
                class_id: row.get(5)?,
                class_name: row.get(6)?,
                room_id: row.get(7)?,
                room_name: row.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut time_slots: BTreeMap<(i64, i64), Vec<&ScanSlot>> = BTreeMap::new();
    for slot in &slots {
        time_slots
            .entry((slot.day_of_week, slot.period_no))
            .or_default()
            .push(slot);
    }

    let mut conflicts: Vec<serde_json::Value> = Vec::new();
    for ((day, period), group) in &time_slots {
        if group.len() < 2 {
            continue;
        }

        let mut by_teacher: BTreeMap<i64, Vec<&ScanSlot>> = BTreeMap::new();
        let mut by_class: BTreeMap<i64, Vec<&ScanSlot>> = BTreeMap::new();
        let mut by_room: BTreeMap<i64, Vec<&ScanSlot>> = BTreeMap::new();
        for slot in group {
            by_teacher.entry(slot.teacher_id).or_default().push(slot);
            by_class.entry(slot.class_id).or_default().push(slot);
            if let Some(room_id) = slot.room_id {
                by_room.entry(room_id).or_default().push(slot);
            }
        }

        for (teacher_id, members) in &by_teacher {
            if members.len() > 1 {
                conflicts.push(json!({
                    "type": "teacher",
                    "dayOfWeek": day,
                    "periodNo": period,
                    "teacherId": teacher_id,
                    "name": members[0].teacher_name,
                    "scheduleIds": members.iter().map(|s| s.id).collect::<Vec<_>>()
                }));
            }
        }
        for (class_id, members) in &by_class {
            if members.len() > 1 {
                conflicts.push(json!({
                    "type": "class",
                    "dayOfWeek": day,
                    "periodNo": period,
                    "classId": class_id,
                    "name": members[0].class_name,
                    "scheduleIds": members.iter().map(|s| s.id).collect::<Vec<_>>()
                }));
            }
        }
        for (room_id, members) in &by_room {
            if members.len() > 1 {
                conflicts.push(json!({
                    "type": "room",
                    "dayOfWeek": day,
                    "periodNo": period,
                    "roomId": room_id,
                    "name": members[0].room_name,
                    "scheduleIds": members.iter().map(|s| s.id).collect::<Vec<_>>()
                }));
            }
        }
    }

    Ok(json!({
        "conflicts": conflicts,
        "conflictCount": conflicts.len(),
        "hasConflicts": !conflicts.is_empty()
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "schedules.create" => require_db(state).and_then(|c| schedules_create(c, &req.params)),
        "schedules.list" => require_db(state).and_then(|c| schedules_list(c, &req.params)),
        "schedules.delete" => require_db(state).and_then(|c| schedules_delete(c, &req.params)),
        "schedules.validate" => require_db(state).and_then(|c| schedules_validate(c, &req.params)),
        "schedules.conflicts" => {
            require_db(state).and_then(|c| schedules_conflicts(c, &req.params))
        }
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

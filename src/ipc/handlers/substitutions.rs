use crate::db::{self, year_table};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_required_i64, get_required_str, is_unique_violation, query_failed,
    require_db, resolve_year, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;

struct Absence {
    teacher_id: i64,
    day_of_week: i64,
    // period_no -> substitute teacher (None leaves the slot uncovered)
    periods: BTreeMap<i64, Option<i64>>,
}

fn check_date(raw: &str) -> Result<(), HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))
}

fn parse_absences(params: &serde_json::Value) -> Result<Vec<Absence>, HandlerErr> {
    let Some(arr) = params.get("absences").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing absences"));
    };
    if arr.is_empty() {
        return Err(HandlerErr::bad_params("absences must not be empty"));
    }

    let mut absences = Vec::with_capacity(arr.len());
    for entry in arr {
        let teacher_id = get_required_i64(entry, "teacherId")?;
        let day_of_week = get_required_i64(entry, "dayOfWeek")?;
        if !(1..=7).contains(&day_of_week) {
            return Err(HandlerErr::bad_params("dayOfWeek must be between 1 and 7"));
        }

        let Some(periods_obj) = entry.get("periods").and_then(|v| v.as_object()) else {
            return Err(HandlerErr::bad_params("missing periods"));
        };
        let mut periods = BTreeMap::new();
        for (period_key, substitute) in periods_obj {
            let Ok(period_no) = period_key.parse::<i64>() else {
                return Err(HandlerErr::bad_params("periods keys must be period numbers"));
            };
            let substitute_id = if substitute.is_null() {
                None
            } else {
                match substitute.as_i64() {
                    Some(id) => Some(id),
                    None => {
                        return Err(HandlerErr::bad_params(
                            "periods values must be teacher ids or null",
                        ))
                    }
                }
            };
            periods.insert(period_no, substitute_id);
        }
        absences.push(Absence {
            teacher_id,
            day_of_week,
            periods,
        });
    }
    Ok(absences)
}

fn existing_summary(
    conn: &Connection,
    year: i64,
    semester_id: i64,
    date: &str,
) -> Result<Vec<(i64, Option<String>, i64)>, HandlerErr> {
    let subs = year_table("substitutions", year);
    let teachers = year_table("teachers", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT sub.absent_teacher_id,
                    TRIM(COALESCE(t.title || ' ', '') || t.f_name || ' ' || t.l_name) AS teacher_name,
                    COUNT(*) AS period_count
             FROM {subs} sub
             LEFT JOIN {teachers} t ON sub.absent_teacher_id = t.id
             WHERE sub.semester_id = ? AND sub.absent_date = ?
             GROUP BY sub.absent_teacher_id
             ORDER BY sub.absent_teacher_id"
        ))
        .map_err(query_failed)?;
    stmt.query_map((semester_id, date), |r| {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

fn substitutions_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let date = get_required_str(params, "date")?;
    check_date(&date)?;
    let absences = parse_absences(params)?;
    let force = params
        .get("force")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let subs = year_table("substitutions", year);

    if !force {
        let existing = existing_summary(conn, year, semester_id, &date)?;
        if !existing.is_empty() {
            let existing_count: i64 = existing.iter().map(|(_, _, count)| count).sum();
            let teachers: Vec<serde_json::Value> = existing
                .iter()
                .map(|(teacher_id, teacher_name, count)| {
                    json!({
                        "teacherId": teacher_id,
                        "teacherName": teacher_name,
                        "periods": count
                    })
                })
                .collect();
            return Err(HandlerErr {
                code: "duplicate_date",
                message: "substitutions already recorded for this date".to_string(),
                details: Some(json!({
                    "date": date,
                    "existingCount": existing_count,
                    "teachers": teachers
                })),
            });
        }
    }

    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    if force {
        tx.execute(
            &format!("DELETE FROM {subs} WHERE semester_id = ? AND absent_date = ?"),
            (semester_id, &date),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    }

    let mut inserted_ids: Vec<i64> = Vec::new();
    let mut skipped = 0usize;
    for absence in &absences {
        for (period_no, substitute_id) in &absence.periods {
            // Resolve the slot the absent teacher actually holds at this time.
            // A tuple with no matching slot is not an error; the teacher has
            // no class there and the tuple is skipped.
            let slot: Option<(i64, i64)> = tx
                .query_row(
                    &format!(
                        "SELECT s.id, s.subject_id
                         FROM {schedules} s
                         JOIN {subjects} subj ON s.subject_id = subj.id
                         WHERE s.semester_id = ? AND subj.teacher_id = ?
                           AND s.day_of_week = ? AND s.period_no = ?"
                    ),
                    (semester_id, absence.teacher_id, absence.day_of_week, period_no),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(query_failed)?;
            let Some((schedule_id, subject_id)) = slot else {
                skipped += 1;
                continue;
            };

            tx.execute(
                &format!(
                    "INSERT INTO {subs}(semester_id, absent_date, absent_teacher_id, reason,
                                        schedule_id, subject_id, substitute_teacher_id, status)
                     VALUES(?, ?, ?, ?, ?, ?, ?, 'assigned')"
                ),
                (
                    semester_id,
                    &date,
                    absence.teacher_id,
                    params.get("reason").and_then(|v| v.as_str()),
                    schedule_id,
                    subject_id,
                    substitute_id,
                ),
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    HandlerErr::duplicate("Substitution already recorded for this slot and date")
                } else {
                    HandlerErr::db("db_insert_failed", e)
                }
            })?;
            inserted_ids.push(tx.last_insert_rowid());
        }
    }

    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    Ok(json!({
        "date": date,
        "insertedCount": inserted_ids.len(),
        "skippedCount": skipped,
        "ids": inserted_ids
    }))
}

fn ledger_exists(conn: &Connection, year: i64) -> Result<bool, HandlerErr> {
    db::table_exists(conn, &year_table("substitutions", year)).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Per-substitute counts. Years whose ledger was never provisioned answer
/// with an empty map, not an error.
fn substitutions_stats(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;

    if !ledger_exists(conn, year)? {
        return Ok(json!({ "stats": {} }));
    }

    let subs = year_table("substitutions", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT substitute_teacher_id, COUNT(*) AS total_count
             FROM {subs}
             WHERE semester_id = ? AND substitute_teacher_id IS NOT NULL
             GROUP BY substitute_teacher_id"
        ))
        .map_err(query_failed)?;
    let rows: Vec<(i64, i64)> = stmt
        .query_map([semester_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut stats = serde_json::Map::new();
    for (teacher_id, count) in rows {
        stats.insert(teacher_id.to_string(), json!(count));
    }

    Ok(json!({ "stats": stats }))
}

fn substitutions_by_date(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let date = get_required_str(params, "date")?;
    check_date(&date)?;
    let year = resolve_year(conn, params)?;

    if !ledger_exists(conn, year)? {
        return Ok(json!({ "date": date, "absentTeachers": [], "availableDates": [] }));
    }

    let subs = year_table("substitutions", year);
    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let classes = year_table("classes", year);
    let rooms = year_table("rooms", year);
    let teachers = year_table("teachers", year);

    let mut dates_stmt = conn
        .prepare(&format!(
            "SELECT absent_date, COUNT(*) AS count
             FROM {subs}
             WHERE semester_id = ?
             GROUP BY absent_date
             ORDER BY absent_date DESC
             LIMIT 30"
        ))
        .map_err(query_failed)?;
    let available_dates = dates_stmt
        .query_map([semester_id], |r| {
            let date: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok(json!({ "date": date, "count": count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT sub.absent_teacher_id,
                    TRIM(COALESCE(at.title || ' ', '') || at.f_name || ' ' || at.l_name) AS absent_name,
                    sched.period_no,
                    subj.subject_name,
                    c.grade_level || '/' || c.section AS class_name,
                    rm.room_name,
                    sub.substitute_teacher_id,
                    TRIM(COALESCE(st.title || ' ', '') || st.f_name || ' ' || st.l_name) AS substitute_name
             FROM {subs} sub
             JOIN {schedules} sched ON sub.schedule_id = sched.id
             LEFT JOIN {subjects} subj ON sub.subject_id = subj.id
             LEFT JOIN {classes} c ON subj.class_id = c.id
             LEFT JOIN {rooms} rm ON sched.room_id = rm.id
             LEFT JOIN {teachers} at ON sub.absent_teacher_id = at.id
             LEFT JOIN {teachers} st ON sub.substitute_teacher_id = st.id
             WHERE sub.semester_id = ? AND sub.absent_date = ?
             ORDER BY sub.absent_teacher_id, sched.period_no"
        ))
        .map_err(query_failed)?;
    let rows: Vec<(i64, Option<String>, i64, Option<String>, Option<String>, Option<String>, Option<i64>, Option<String>)> =
        stmt.query_map((semester_id, &date), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut grouped: Vec<(i64, Option<String>, Vec<serde_json::Value>)> = Vec::new();
    for (teacher_id, teacher_name, period_no, subject_name, class_name, room_name, sub_id, sub_name) in rows {
        let period = json!({
            "periodNo": period_no,
            "subjectName": subject_name,
            "className": class_name,
            "roomName": room_name,
            "substituteTeacherId": sub_id,
            "substituteTeacherName": sub_name
        });
        match grouped.last_mut() {
            Some((last_id, _, periods)) if *last_id == teacher_id => periods.push(period),
            _ => grouped.push((teacher_id, teacher_name, vec![period])),
        }
    }

    let absent_teachers: Vec<serde_json::Value> = grouped
        .into_iter()
        .map(|(teacher_id, teacher_name, periods)| {
            json!({
                "teacherId": teacher_id,
                "teacherName": teacher_name,
                "periods": periods
            })
        })
        .collect();

    Ok(json!({
        "date": date,
        "absentTeachers": absent_teachers,
        "availableDates": available_dates
    }))
}

fn substitutions_dates_for_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let teacher_id = get_required_i64(params, "teacherId")?;
    let year = resolve_year(conn, params)?;

    if !ledger_exists(conn, year)? {
        return Ok(json!({ "teacherId": teacher_id, "dates": [], "totalCount": 0 }));
    }

    let subs = year_table("substitutions", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT absent_date
             FROM {subs}
             WHERE semester_id = ? AND substitute_teacher_id = ?
             ORDER BY absent_date DESC"
        ))
        .map_err(query_failed)?;
    let dates: Vec<String> = stmt
        .query_map((semester_id, teacher_id), |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({
        "teacherId": teacher_id,
        "totalCount": dates.len(),
        "dates": dates
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "substitutions.record" => {
            require_db(state).and_then(|c| substitutions_record(c, &req.params))
        }
        "substitutions.stats" => {
            require_db(state).and_then(|c| substitutions_stats(c, &req.params))
        }
        "substitutions.byDate" => {
            require_db(state).and_then(|c| substitutions_by_date(c, &req.params))
        }
        "substitutions.datesForTeacher" => {
            require_db(state).and_then(|c| substitutions_dates_for_teacher(c, &req.params))
        }
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

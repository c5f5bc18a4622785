use crate::db::year_table;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_str, get_required_i64, get_required_str, is_fk_violation,
    is_unique_violation, query_failed, require_db, resolve_year, translate_delete_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DUPLICATE_SUBJECT: &str = "Subject already exists for this class and semester";
const EMPTY_CLASSES: &str = "at least one class is required (classIds)";

/// One logical subject fans out to one physical row per class. Every row in
/// the fan-out shares a group key and redundantly carries the full class-id
/// set as a JSON cache; all mutations must keep the cache in lock-step with
/// the actual rows.
struct SubjectRow {
    id: i64,
    teacher_id: i64,
    group_key: Option<String>,
    subject_name: String,
    subject_code: Option<String>,
    periods_per_week: i64,
    default_room_id: Option<i64>,
    special_requirements: Option<String>,
}

fn new_group_key() -> String {
    Uuid::new_v4().to_string()
}

fn parse_class_ids_cache(raw: &str, fallback_class_id: i64) -> Vec<i64> {
    let parsed: Option<Vec<i64>> = serde_json::from_str(raw).ok();
    match parsed {
        Some(ids) if !ids.is_empty() => ids,
        _ => vec![fallback_class_id],
    }
}

fn get_class_ids_param(params: &serde_json::Value) -> Result<Option<Vec<i64>>, HandlerErr> {
    let Some(v) = params.get("classIds") else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params("classIds must be an array"));
    };
    let mut ids: Vec<i64> = Vec::new();
    for item in arr {
        let Some(id) = item.as_i64() else {
            return Err(HandlerErr::bad_params("classIds must contain integers"));
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(Some(ids))
}

fn check_periods_per_week(value: i64) -> Result<(), HandlerErr> {
    if !(1..=20).contains(&value) {
        return Err(HandlerErr::bad_params(
            "periodsPerWeek must be between 1 and 20",
        ));
    }
    Ok(())
}

fn translate_subject_insert_err(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        return HandlerErr::duplicate(DUPLICATE_SUBJECT);
    }
    if is_fk_violation(&e) {
        return HandlerErr::bad_params(
            "teacherId, classId, or defaultRoomId does not exist for this semester",
        );
    }
    HandlerErr::db("db_insert_failed", e)
}

fn subject_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let teacher_id: i64 = row.get(2)?;
    let class_id: i64 = row.get(3)?;
    let class_ids_raw: String = row.get(4)?;
    let group_key: Option<String> = row.get(5)?;
    let subject_name: String = row.get(6)?;
    let subject_code: Option<String> = row.get(7)?;
    let periods_per_week: i64 = row.get(8)?;
    let default_room_id: Option<i64> = row.get(9)?;
    let special_requirements: Option<String> = row.get(10)?;
    let teacher_name: String = row.get(11)?;
    let class_name: String = row.get(12)?;
    let room_name: Option<String> = row.get(13)?;

    // Legacy rows imported without a key still present a stable one.
    let group_key = match group_key {
        Some(k) if !k.trim().is_empty() => k,
        _ => format!("SUBJ_{}", id),
    };

    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "teacherId": teacher_id,
        "classId": class_id,
        "classIds": parse_class_ids_cache(&class_ids_raw, class_id),
        "groupKey": group_key,
        "subjectName": subject_name,
        "subjectCode": subject_code,
        "periodsPerWeek": periods_per_week,
        "defaultRoomId": default_room_id,
        "specialRequirements": special_requirements,
        "teacherName": teacher_name,
        "className": class_name,
        "roomName": room_name
    }))
}

fn joined_select(year: i64) -> String {
    let subjects = year_table("subjects", year);
    let teachers = year_table("teachers", year);
    let classes = year_table("classes", year);
    let rooms = year_table("rooms", year);
    format!(
        "SELECT s.id, s.semester_id, s.teacher_id, s.class_id, s.class_ids, s.group_key,
                s.subject_name, s.subject_code, s.periods_per_week, s.default_room_id,
                s.special_requirements,
                TRIM(COALESCE(t.title || ' ', '') || t.f_name || ' ' || t.l_name) AS teacher_name,
                c.grade_level || '/' || c.section AS class_name,
                r.room_name
         FROM {subjects} s
         JOIN {teachers} t ON s.teacher_id = t.id
         JOIN {classes} c ON s.class_id = c.id
         LEFT JOIN {rooms} r ON s.default_room_id = r.id"
    )
}

fn select_group_rows(
    conn: &Connection,
    year: i64,
    semester_id: i64,
    group_key: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE s.group_key = ? AND s.semester_id = ? ORDER BY c.grade_level, c.section",
            joined_select(year)
        ))
        .map_err(query_failed)?;
    stmt.query_map((group_key, semester_id), subject_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let teacher_id = get_required_i64(params, "teacherId")?;
    let subject_name = get_required_str(params, "subjectName")?;
    let periods_per_week = get_required_i64(params, "periodsPerWeek")?;
    check_periods_per_week(periods_per_week)?;
    let subject_code = get_opt_str(params, "subjectCode");
    let special_requirements = get_opt_str(params, "specialRequirements");
    let default_room_id = params.get("defaultRoomId").and_then(|v| v.as_i64());

    let class_ids = get_class_ids_param(params)?.unwrap_or_default();
    if class_ids.is_empty() {
        return Err(HandlerErr::bad_params(EMPTY_CLASSES));
    }

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let group_key = get_opt_str(params, "groupKey").unwrap_or_else(new_group_key);
    let class_ids_json = serde_json::to_string(&class_ids).unwrap_or_else(|_| "[]".to_string());

    let t = year_table("subjects", year);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for class_id in &class_ids {
        tx.execute(
            &format!(
                "INSERT INTO {t}(semester_id, teacher_id, class_id, class_ids, group_key,
                                 subject_name, subject_code, periods_per_week, default_room_id,
                                 special_requirements)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            (
                semester_id,
                teacher_id,
                class_id,
                &class_ids_json,
                &group_key,
                &subject_name,
                &subject_code,
                periods_per_week,
                default_room_id,
                &special_requirements,
            ),
        )
        .map_err(translate_subject_insert_err)?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let subjects = select_group_rows(conn, year, semester_id, &group_key)?;
    Ok(json!({ "subjects": subjects, "groupKey": group_key }))
}

fn subjects_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE s.semester_id = ?
             ORDER BY teacher_name, class_name, s.subject_name",
            joined_select(year)
        ))
        .map_err(query_failed)?;
    let subjects = stmt
        .query_map([semester_id], subject_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "subjects": subjects }))
}

fn load_subject_row(
    conn: &Connection,
    year: i64,
    subject_id: i64,
    semester_id: i64,
) -> Result<Option<SubjectRow>, HandlerErr> {
    let t = year_table("subjects", year);
    conn.query_row(
        &format!(
            "SELECT id, teacher_id, group_key, subject_name, subject_code,
                    periods_per_week, default_room_id, special_requirements
             FROM {t} WHERE id = ? AND semester_id = ?"
        ),
        (subject_id, semester_id),
        |r| {
            Ok(SubjectRow {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                group_key: r.get(2)?,
                subject_name: r.get(3)?,
                subject_code: r.get(4)?,
                periods_per_week: r.get(5)?,
                default_room_id: r.get(6)?,
                special_requirements: r.get(7)?,
            })
        },
    )
    .optional()
    .map_err(query_failed)
}

fn subjects_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_i64(params, "subjectId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let Some(existing) = load_subject_row(conn, year, subject_id, semester_id)? else {
        return Err(HandlerErr::not_found("Subject not found"));
    };

    let had_group_key = existing
        .group_key
        .as_deref()
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    let group_key = if had_group_key {
        existing.group_key.clone().unwrap_or_default()
    } else {
        new_group_key()
    };

    let t = year_table("subjects", year);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Self-healing for rows imported before grouping existed: stamp the fresh
    // key onto every ungrouped sibling of the same logical subject so the
    // reconciliation below sees the whole group.
    if !had_group_key {
        tx.execute(
            &format!(
                "UPDATE {t} SET group_key = ?
                 WHERE (group_key IS NULL OR group_key = '')
                   AND semester_id = ? AND subject_name = ? AND teacher_id = ?"
            ),
            (
                &group_key,
                semester_id,
                &existing.subject_name,
                &existing.teacher_id,
            ),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    let mut stmt = tx
        .prepare(&format!(
            "SELECT id, class_id FROM {t} WHERE group_key = ? AND semester_id = ?"
        ))
        .map_err(query_failed)?;
    let group_rows: Vec<(i64, i64)> = stmt
        .query_map((&group_key, semester_id), |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    drop(stmt);

    let current_class_ids: Vec<i64> = group_rows.iter().map(|(_, class_id)| *class_id).collect();

    let requested_class_ids = match get_class_ids_param(params)? {
        Some(ids) => ids,
        // No membership change requested: keep the group as it stands.
        None => current_class_ids.clone(),
    };
    if requested_class_ids.is_empty() {
        return Err(HandlerErr::bad_params(EMPTY_CLASSES));
    }

    let teacher_id = params
        .get("teacherId")
        .and_then(|v| v.as_i64())
        .unwrap_or(existing.teacher_id);
    let subject_name = get_opt_str(params, "subjectName").unwrap_or(existing.subject_name);
    let subject_code = if params.get("subjectCode").is_some() {
        get_opt_str(params, "subjectCode")
    } else {
        existing.subject_code
    };
    let periods_per_week = params
        .get("periodsPerWeek")
        .and_then(|v| v.as_i64())
        .unwrap_or(existing.periods_per_week);
    check_periods_per_week(periods_per_week)?;
    let default_room_id = if params.get("defaultRoomId").is_some() {
        params.get("defaultRoomId").and_then(|v| v.as_i64())
    } else {
        existing.default_room_id
    };
    let special_requirements = if params.get("specialRequirements").is_some() {
        get_opt_str(params, "specialRequirements")
    } else {
        existing.special_requirements
    };

    let class_ids_json =
        serde_json::to_string(&requested_class_ids).unwrap_or_else(|_| "[]".to_string());

    let to_update: Vec<(i64, i64)> = group_rows
        .iter()
        .filter(|(_, class_id)| requested_class_ids.contains(class_id))
        .cloned()
        .collect();
    let to_remove: Vec<(i64, i64)> = group_rows
        .iter()
        .filter(|(_, class_id)| !requested_class_ids.contains(class_id))
        .cloned()
        .collect();
    let to_add: Vec<i64> = requested_class_ids
        .iter()
        .filter(|class_id| !current_class_ids.contains(class_id))
        .cloned()
        .collect();

    for (row_id, _) in &to_update {
        tx.execute(
            &format!(
                "UPDATE {t}
                 SET teacher_id = ?, subject_name = ?, subject_code = ?, periods_per_week = ?,
                     default_room_id = ?, special_requirements = ?, class_ids = ?, group_key = ?,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?"
            ),
            (
                teacher_id,
                &subject_name,
                &subject_code,
                periods_per_week,
                default_room_id,
                &special_requirements,
                &class_ids_json,
                &group_key,
                row_id,
            ),
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                HandlerErr::duplicate(DUPLICATE_SUBJECT)
            } else {
                HandlerErr::db("db_update_failed", e)
            }
        })?;
    }

    for (row_id, _) in &to_remove {
        tx.execute(&format!("DELETE FROM {t} WHERE id = ?"), [row_id])
            .map_err(|e| {
                translate_delete_err(
                    e,
                    "Cannot remove a class from this subject while schedules still reference it",
                )
            })?;
    }

    for class_id in &to_add {
        tx.execute(
            &format!(
                "INSERT INTO {t}(semester_id, teacher_id, class_id, class_ids, group_key,
                                 subject_name, subject_code, periods_per_week, default_room_id,
                                 special_requirements)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            (
                semester_id,
                teacher_id,
                class_id,
                &class_ids_json,
                &group_key,
                &subject_name,
                &subject_code,
                periods_per_week,
                default_room_id,
                &special_requirements,
            ),
        )
        .map_err(translate_subject_insert_err)?;
    }

    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let subjects = select_group_rows(conn, year, semester_id, &group_key)?;
    Ok(json!({ "subjects": subjects, "groupKey": group_key }))
}

fn subjects_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_i64(params, "subjectId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let Some(existing) = load_subject_row(conn, year, subject_id, semester_id)? else {
        return Err(HandlerErr::not_found("Subject not found"));
    };

    let t = year_table("subjects", year);
    let group_key = existing
        .group_key
        .filter(|k| !k.trim().is_empty());

    let changes = match &group_key {
        Some(key) => delete_where(conn, &t, "group_key = ? AND semester_id = ?", (key, semester_id))?,
        None => delete_where(conn, &t, "id = ? AND semester_id = ?", (existing.id, semester_id))?,
    };
    if changes == 0 {
        return Err(HandlerErr::not_found("Subject not found"));
    }

    Ok(json!({ "deleted": changes }))
}

fn delete_where<P: rusqlite::Params>(
    conn: &Connection,
    table: &str,
    predicate: &str,
    params: P,
) -> Result<usize, HandlerErr> {
    conn.execute(&format!("DELETE FROM {table} WHERE {predicate}"), params)
        .map_err(|e| {
            translate_delete_err(e, "Cannot delete subject while schedules still reference it")
        })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "subjects.create" => require_db(state).and_then(|c| subjects_create(c, &req.params)),
        "subjects.list" => require_db(state).and_then(|c| subjects_list(c, &req.params)),
        "subjects.update" => require_db(state).and_then(|c| subjects_update(c, &req.params)),
        "subjects.delete" => require_db(state).and_then(|c| subjects_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_ids_cache_parses_json_arrays() {
        assert_eq!(parse_class_ids_cache("[1,2,3]", 9), vec![1, 2, 3]);
    }

    #[test]
    fn class_ids_cache_falls_back_to_row_class() {
        assert_eq!(parse_class_ids_cache("", 9), vec![9]);
        assert_eq!(parse_class_ids_cache("[]", 9), vec![9]);
        assert_eq!(parse_class_ids_cache("not json", 9), vec![9]);
    }

    #[test]
    fn class_ids_param_dedups_preserving_order() {
        let params = serde_json::json!({ "classIds": [3, 1, 3, 2, 1] });
        let ids = get_class_ids_param(&params).unwrap().unwrap();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn class_ids_param_rejects_non_integers() {
        let params = serde_json::json!({ "classIds": [1, "two"] });
        assert!(get_class_ids_param(&params).is_err());
    }
}

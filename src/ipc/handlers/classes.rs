use crate::db::year_table;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_i64, get_opt_str, get_required_i64, get_required_str, query_failed,
    require_db, resolve_year, translate_delete_err, translate_write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const DUPLICATE_CLASS: &str = "Class already exists for this semester";

/// `class_name` is the projection `grade_level/section`, never stored.
const CLASS_COLUMNS: &str =
    "id, semester_id, grade_level, section, grade_level || '/' || section AS class_name";

fn class_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let grade_level: String = row.get(2)?;
    let section: i64 = row.get(3)?;
    let class_name: String = row.get(4)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "gradeLevel": grade_level,
        "section": section,
        "className": class_name
    }))
}

fn check_section(section: i64) -> Result<(), HandlerErr> {
    if section <= 0 {
        return Err(HandlerErr::bad_params("section must be a positive integer"));
    }
    Ok(())
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let grade_level = get_required_str(params, "gradeLevel")?;
    let section = get_required_i64(params, "section")?;
    check_section(section)?;

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("classes", year);
    let exists: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT id FROM {t} WHERE semester_id = ? AND grade_level = ? AND section = ?"
            ),
            (semester_id, &grade_level, section),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if exists.is_some() {
        return Err(HandlerErr::duplicate(DUPLICATE_CLASS));
    }

    conn.execute(
        &format!("INSERT INTO {t}(semester_id, grade_level, section) VALUES(?, ?, ?)"),
        (semester_id, &grade_level, section),
    )
    .map_err(|e| translate_write_err(e, "db_insert_failed", DUPLICATE_CLASS))?;
    let class_id = conn.last_insert_rowid();

    conn.query_row(
        &format!("SELECT {CLASS_COLUMNS} FROM {t} WHERE id = ?"),
        [class_id],
        class_row_json,
    )
    .map_err(query_failed)
}

fn classes_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("classes", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CLASS_COLUMNS} FROM {t}
             WHERE semester_id = ?
             ORDER BY grade_level, section"
        ))
        .map_err(query_failed)?;
    let classes = stmt
        .query_map([semester_id], class_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "classes": classes }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_i64(params, "classId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("classes", year);
    let mut fields: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(grade_level) = get_opt_str(params, "gradeLevel") {
        fields.push("grade_level = ?");
        values.push(Box::new(grade_level));
    }
    if let Some(section) = get_opt_i64(params, "section") {
        check_section(section)?;
        fields.push("section = ?");
        values.push(Box::new(section));
    }
    if fields.is_empty() {
        return Err(HandlerErr::bad_params("no class fields to update"));
    }
    fields.push("updated_at = CURRENT_TIMESTAMP");
    values.push(Box::new(class_id));
    values.push(Box::new(semester_id));

    let changes = conn
        .execute(
            &format!(
                "UPDATE {t} SET {} WHERE id = ? AND semester_id = ?",
                fields.join(", ")
            ),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )
        .map_err(|e| translate_write_err(e, "db_update_failed", DUPLICATE_CLASS))?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Class not found"));
    }

    conn.query_row(
        &format!("SELECT {CLASS_COLUMNS} FROM {t} WHERE id = ?"),
        [class_id],
        class_row_json,
    )
    .map_err(query_failed)
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_i64(params, "classId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("classes", year);
    let changes = conn
        .execute(
            &format!("DELETE FROM {t} WHERE id = ? AND semester_id = ?"),
            (class_id, semester_id),
        )
        .map_err(|e| {
            translate_delete_err(
                e,
                "Cannot delete class while schedules or subjects still reference it",
            )
        })?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Class not found"));
    }

    Ok(json!({ "classId": class_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.create" => require_db(state).and_then(|c| classes_create(c, &req.params)),
        "classes.list" => require_db(state).and_then(|c| classes_list(c, &req.params)),
        "classes.update" => require_db(state).and_then(|c| classes_update(c, &req.params)),
        "classes.delete" => require_db(state).and_then(|c| classes_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

use crate::db;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_required_i64, get_required_str, provision_failed, query_failed,
    require_db, translate_write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn year_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let year: i64 = row.get(1)?;
    let is_active: i64 = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(json!({
        "id": id,
        "year": year,
        "isActive": is_active != 0,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn semester_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let is_active: i64 = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(json!({
        "id": id,
        "name": name,
        "isActive": is_active != 0,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn context_get(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let year = conn
        .query_row(
            "SELECT id, year, is_active, created_at, updated_at
             FROM academic_years WHERE is_active = 1",
            [],
            year_row_json,
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr {
            code: "no_active_year",
            message: "no active academic year".to_string(),
            details: None,
        })?;

    let semester = conn
        .query_row(
            "SELECT id, semester_name, is_active, created_at, updated_at
             FROM semesters WHERE is_active = 1",
            [],
            semester_row_json,
        )
        .optional()
        .map_err(query_failed)?
        .ok_or_else(|| HandlerErr {
            code: "no_active_semester",
            message: "no active semester".to_string(),
            details: None,
        })?;

    Ok(json!({ "academicYear": year, "semester": semester }))
}

fn years_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year = get_required_i64(params, "year")?;
    if !(1000..=9999).contains(&year) {
        return Err(HandlerErr::bad_params("year must be between 1000 and 9999"));
    }

    let exists: Option<i64> = conn
        .query_row("SELECT id FROM academic_years WHERE year = ?", [year], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_failed)?;
    if exists.is_some() {
        return Err(HandlerErr::duplicate("Academic year already exists"));
    }

    conn.execute(
        "INSERT INTO academic_years(year, is_active) VALUES(?, 0)",
        [year],
    )
    .map_err(|e| translate_write_err(e, "db_insert_failed", "Academic year already exists"))?;
    let year_id = conn.last_insert_rowid();

    // Provision the partition up front; the year is usable for reads and
    // imports immediately after creation.
    db::ensure_year_tables(conn, year).map_err(provision_failed)?;

    conn.query_row(
        "SELECT id, year, is_active, created_at, updated_at FROM academic_years WHERE id = ?",
        [year_id],
        year_row_json,
    )
    .map_err(query_failed)
}

fn years_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, year, is_active, created_at, updated_at
             FROM academic_years ORDER BY year DESC",
        )
        .map_err(query_failed)?;
    let years = stmt
        .query_map([], year_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "years": years }))
}

fn years_set_active(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year_id = get_required_i64(params, "yearId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT id FROM academic_years WHERE id = ?", [year_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_failed)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("Academic year not found"));
    }

    conn.execute(
        "UPDATE academic_years SET is_active = 0, updated_at = CURRENT_TIMESTAMP",
        [],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    conn.execute(
        "UPDATE academic_years SET is_active = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        [year_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    Ok(json!({ "yearId": year_id }))
}

fn years_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year_id = get_required_i64(params, "yearId")?;

    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT year, is_active FROM academic_years WHERE id = ?",
            [year_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((year, is_active)) = row else {
        return Err(HandlerErr::not_found("Academic year not found"));
    };
    if is_active != 0 {
        return Err(HandlerErr::in_use("cannot delete the active academic year"));
    }

    conn.execute("DELETE FROM academic_years WHERE id = ?", [year_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    Ok(json!({ "yearId": year_id, "year": year }))
}

fn semesters_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;

    conn.execute(
        "INSERT INTO semesters(semester_name, is_active) VALUES(?, 0)",
        [&name],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    let semester_id = conn.last_insert_rowid();

    conn.query_row(
        "SELECT id, semester_name, is_active, created_at, updated_at FROM semesters WHERE id = ?",
        [semester_id],
        semester_row_json,
    )
    .map_err(query_failed)
}

fn semesters_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, semester_name, is_active, created_at, updated_at
             FROM semesters ORDER BY id",
        )
        .map_err(query_failed)?;
    let semesters = stmt
        .query_map([], semester_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;
    Ok(json!({ "semesters": semesters }))
}

fn semesters_set_active(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT id FROM semesters WHERE id = ?", [semester_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_failed)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("Semester not found"));
    }

    conn.execute(
        "UPDATE semesters SET is_active = 0, updated_at = CURRENT_TIMESTAMP",
        [],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    conn.execute(
        "UPDATE semesters SET is_active = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        [semester_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    // Activation readies the pair for scheduling: partition plus the default
    // period set for the active year, when one is selected.
    let active_year: Option<i64> = conn
        .query_row(
            "SELECT year FROM academic_years WHERE is_active = 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if let Some(year) = active_year {
        ensure_partition(conn, year)?;
        db::ensure_default_periods(conn, year, semester_id).map_err(provision_failed)?;
    }

    Ok(json!({ "semesterId": semester_id }))
}

fn semesters_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;

    let row: Option<i64> = conn
        .query_row(
            "SELECT is_active FROM semesters WHERE id = ?",
            [semester_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    let Some(is_active) = row else {
        return Err(HandlerErr::not_found("Semester not found"));
    };
    if is_active != 0 {
        return Err(HandlerErr::in_use("cannot delete the active semester"));
    }

    conn.execute("DELETE FROM semesters WHERE id = ?", [semester_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    Ok(json!({ "semesterId": semester_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "context.get" => require_db(state).and_then(context_get),
        "years.create" => require_db(state).and_then(|c| years_create(c, &req.params)),
        "years.list" => require_db(state).and_then(years_list),
        "years.setActive" => require_db(state).and_then(|c| years_set_active(c, &req.params)),
        "years.delete" => require_db(state).and_then(|c| years_delete(c, &req.params)),
        "semesters.create" => require_db(state).and_then(|c| semesters_create(c, &req.params)),
        "semesters.list" => require_db(state).and_then(semesters_list),
        "semesters.setActive" => {
            require_db(state).and_then(|c| semesters_set_active(c, &req.params))
        }
        "semesters.delete" => require_db(state).and_then(|c| semesters_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

use crate::db::{self, year_table};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_i64, get_opt_str, get_required_i64, get_required_str,
    provision_failed, query_failed, require_db, resolve_year, translate_write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const PERIOD_NO_MAX: i64 = 12;

fn parse_time(raw: &str, key: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

fn check_time_range(start: &str, end: &str) -> Result<(), HandlerErr> {
    let s = parse_time(start, "startTime")?;
    let e = parse_time(end, "endTime")?;
    if s >= e {
        return Err(HandlerErr::bad_params("startTime must be before endTime"));
    }
    Ok(())
}

fn period_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let period_no: i64 = row.get(2)?;
    let period_name: String = row.get(3)?;
    let start_time: String = row.get(4)?;
    let end_time: String = row.get(5)?;
    let is_active: i64 = row.get(6)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "periodNo": period_no,
        "periodName": period_name,
        "startTime": start_time,
        "endTime": end_time,
        "isActive": is_active != 0
    }))
}

fn periods_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;
    db::ensure_default_periods(conn, year, semester_id).map_err(provision_failed)?;

    let t = year_table("periods", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, semester_id, period_no, period_name, start_time, end_time, is_active
             FROM {t}
             WHERE semester_id = ? AND is_active = 1
             ORDER BY period_no"
        ))
        .map_err(query_failed)?;
    let periods = stmt
        .query_map([semester_id], period_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "periods": periods }))
}

fn periods_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let period_no = get_required_i64(params, "periodNo")?;
    let period_name = get_required_str(params, "periodName")?;
    let start_time = get_required_str(params, "startTime")?;
    let end_time = get_required_str(params, "endTime")?;

    if !(1..=PERIOD_NO_MAX).contains(&period_no) {
        return Err(HandlerErr::bad_params(format!(
            "periodNo must be between 1 and {}",
            PERIOD_NO_MAX
        )));
    }
    check_time_range(&start_time, &end_time)?;

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("periods", year);
    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {t} WHERE semester_id = ? AND period_no = ?"),
            (semester_id, period_no),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if exists.is_some() {
        return Err(HandlerErr::duplicate(
            "Period number already exists for this semester",
        ));
    }

    conn.execute(
        &format!(
            "INSERT INTO {t}(semester_id, period_no, period_name, start_time, end_time, is_active)
             VALUES(?, ?, ?, ?, ?, 1)"
        ),
        (semester_id, period_no, &period_name, &start_time, &end_time),
    )
    .map_err(|e| {
        translate_write_err(
            e,
            "db_insert_failed",
            "Period number already exists for this semester",
        )
    })?;
    let period_id = conn.last_insert_rowid();

    conn.query_row(
        &format!(
            "SELECT id, semester_id, period_no, period_name, start_time, end_time, is_active
             FROM {t} WHERE id = ?"
        ),
        [period_id],
        period_row_json,
    )
    .map_err(query_failed)
}

fn periods_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_i64(params, "periodId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("periods", year);
    let existing: Option<(String, String)> = conn
        .query_row(
            &format!("SELECT start_time, end_time FROM {t} WHERE id = ? AND semester_id = ?"),
            (period_id, semester_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((cur_start, cur_end)) = existing else {
        return Err(HandlerErr::not_found("Period not found"));
    };

    let new_period_no = get_opt_i64(params, "periodNo");
    if let Some(no) = new_period_no {
        if !(1..=PERIOD_NO_MAX).contains(&no) {
            return Err(HandlerErr::bad_params(format!(
                "periodNo must be between 1 and {}",
                PERIOD_NO_MAX
            )));
        }
    }
    let new_name = get_opt_str(params, "periodName");
    let new_start = get_opt_str(params, "startTime");
    let new_end = get_opt_str(params, "endTime");

    // Times are validated against whatever the row will hold after the patch.
    check_time_range(
        new_start.as_deref().unwrap_or(&cur_start),
        new_end.as_deref().unwrap_or(&cur_end),
    )?;

    let mut fields: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(no) = new_period_no {
        fields.push("period_no = ?");
        values.push(Box::new(no));
    }
    if let Some(name) = &new_name {
        fields.push("period_name = ?");
        values.push(Box::new(name.clone()));
    }
    if let Some(start) = &new_start {
        fields.push("start_time = ?");
        values.push(Box::new(start.clone()));
    }
    if let Some(end) = &new_end {
        fields.push("end_time = ?");
        values.push(Box::new(end.clone()));
    }
    if fields.is_empty() {
        return Err(HandlerErr::bad_params("no period fields to update"));
    }
    fields.push("updated_at = CURRENT_TIMESTAMP");
    values.push(Box::new(period_id));
    values.push(Box::new(semester_id));

    conn.execute(
        &format!(
            "UPDATE {t} SET {} WHERE id = ? AND semester_id = ?",
            fields.join(", ")
        ),
        rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
    )
    .map_err(|e| {
        translate_write_err(
            e,
            "db_update_failed",
            "Period number already exists for this semester",
        )
    })?;

    conn.query_row(
        &format!(
            "SELECT id, semester_id, period_no, period_name, start_time, end_time, is_active
             FROM {t} WHERE id = ?"
        ),
        [period_id],
        period_row_json,
    )
    .map_err(query_failed)
}

fn periods_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let period_id = get_required_i64(params, "periodId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("periods", year);
    let changes = conn
        .execute(
            &format!("DELETE FROM {t} WHERE id = ? AND semester_id = ?"),
            (period_id, semester_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Period not found"));
    }

    Ok(json!({ "periodId": period_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "periods.list" => require_db(state).and_then(|c| periods_list(c, &req.params)),
        "periods.create" => require_db(state).and_then(|c| periods_create(c, &req.params)),
        "periods.update" => require_db(state).and_then(|c| periods_update(c, &req.params)),
        "periods.delete" => require_db(state).and_then(|c| periods_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

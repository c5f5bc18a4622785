use crate::db::year_table;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_str, get_required_i64, get_required_str, query_failed, require_db,
    resolve_year, translate_delete_err, translate_write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ROOM_TYPES: [&str; 2] = ["general", "computer-lab"];

const DUPLICATE_ROOM: &str = "Room already exists for this semester";

fn room_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let room_name: String = row.get(2)?;
    let room_type: String = row.get(3)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "roomName": room_name,
        "roomType": room_type
    }))
}

fn check_room_type(room_type: &str) -> Result<(), HandlerErr> {
    if ROOM_TYPES.contains(&room_type) {
        return Ok(());
    }
    Err(HandlerErr::bad_params(format!(
        "roomType must be one of: {}",
        ROOM_TYPES.join(", ")
    )))
}

fn rooms_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let room_name = get_required_str(params, "roomName")?;
    let room_type = get_required_str(params, "roomType")?;
    check_room_type(&room_type)?;

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("rooms", year);
    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {t} WHERE semester_id = ? AND room_name = ?"),
            (semester_id, &room_name),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if exists.is_some() {
        return Err(HandlerErr::duplicate(DUPLICATE_ROOM));
    }

    conn.execute(
        &format!("INSERT INTO {t}(semester_id, room_name, room_type) VALUES(?, ?, ?)"),
        (semester_id, &room_name, &room_type),
    )
    .map_err(|e| translate_write_err(e, "db_insert_failed", DUPLICATE_ROOM))?;
    let room_id = conn.last_insert_rowid();

    conn.query_row(
        &format!("SELECT id, semester_id, room_name, room_type FROM {t} WHERE id = ?"),
        [room_id],
        room_row_json,
    )
    .map_err(query_failed)
}

fn rooms_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("rooms", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id, semester_id, room_name, room_type FROM {t}
             WHERE semester_id = ?
             ORDER BY room_name"
        ))
        .map_err(query_failed)?;
    let rooms = stmt
        .query_map([semester_id], room_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "rooms": rooms }))
}

fn rooms_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = get_required_i64(params, "roomId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("rooms", year);
    let mut fields: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(room_name) = get_opt_str(params, "roomName") {
        let taken: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT id FROM {t} WHERE semester_id = ? AND room_name = ? AND id <> ?"
                ),
                (semester_id, &room_name, room_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(query_failed)?;
        if taken.is_some() {
            return Err(HandlerErr::duplicate(DUPLICATE_ROOM));
        }
        fields.push("room_name = ?");
        values.push(Box::new(room_name));
    }
    if let Some(room_type) = get_opt_str(params, "roomType") {
        check_room_type(&room_type)?;
        fields.push("room_type = ?");
        values.push(Box::new(room_type));
    }
    if fields.is_empty() {
        return Err(HandlerErr::bad_params("no room fields to update"));
    }
    fields.push("updated_at = CURRENT_TIMESTAMP");
    values.push(Box::new(room_id));
    values.push(Box::new(semester_id));

    let changes = conn
        .execute(
            &format!(
                "UPDATE {t} SET {} WHERE id = ? AND semester_id = ?",
                fields.join(", ")
            ),
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )
        .map_err(|e| translate_write_err(e, "db_update_failed", DUPLICATE_ROOM))?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Room not found"));
    }

    conn.query_row(
        &format!("SELECT id, semester_id, room_name, room_type FROM {t} WHERE id = ?"),
        [room_id],
        room_row_json,
    )
    .map_err(query_failed)
}

fn rooms_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let room_id = get_required_i64(params, "roomId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("rooms", year);
    let changes = conn
        .execute(
            &format!("DELETE FROM {t} WHERE id = ? AND semester_id = ?"),
            (room_id, semester_id),
        )
        .map_err(|e| {
            translate_delete_err(e, "Cannot delete room while schedules still reference it")
        })?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Room not found"));
    }

    Ok(json!({ "roomId": room_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "rooms.create" => require_db(state).and_then(|c| rooms_create(c, &req.params)),
        "rooms.list" => require_db(state).and_then(|c| rooms_list(c, &req.params)),
        "rooms.update" => require_db(state).and_then(|c| rooms_update(c, &req.params)),
        "rooms.delete" => require_db(state).and_then(|c| rooms_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

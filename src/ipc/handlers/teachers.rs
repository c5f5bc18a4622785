use crate::db::year_table;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    ensure_partition, get_opt_str, get_required_i64, get_required_str, query_failed, require_db,
    resolve_year, translate_delete_err, translate_write_err, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

const ROLES: [&str; 4] = [
    "teacher",
    "head_of_department",
    "vice_principal",
    "principal",
];

const DUPLICATE_EMAIL: &str = "Teacher with this email already exists for this semester";

/// `full_name` is a projection over title/f_name/l_name, never stored.
const TEACHER_COLUMNS: &str = "id, semester_id, title, f_name, l_name,
    TRIM(COALESCE(title || ' ', '') || f_name || ' ' || l_name) AS full_name,
    email, phone, subject_group, role";

fn teacher_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: i64 = row.get(0)?;
    let semester_id: i64 = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let f_name: String = row.get(3)?;
    let l_name: String = row.get(4)?;
    let full_name: String = row.get(5)?;
    let email: Option<String> = row.get(6)?;
    let phone: Option<String> = row.get(7)?;
    let subject_group: String = row.get(8)?;
    let role: String = row.get(9)?;
    Ok(json!({
        "id": id,
        "semesterId": semester_id,
        "title": title,
        "firstName": f_name,
        "lastName": l_name,
        "fullName": full_name,
        "email": email,
        "phone": phone,
        "subjectGroup": subject_group,
        "role": role
    }))
}

fn check_role(role: &str) -> Result<(), HandlerErr> {
    if ROLES.contains(&role) {
        return Ok(());
    }
    Err(HandlerErr::bad_params(format!(
        "role must be one of: {}",
        ROLES.join(", ")
    )))
}

fn email_taken(
    conn: &Connection,
    table: &str,
    semester_id: i64,
    email: &str,
    exclude_id: Option<i64>,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            &format!(
                "SELECT id FROM {table}
                 WHERE semester_id = ? AND email = ? AND (?3 IS NULL OR id <> ?3)"
            ),
            (semester_id, email, exclude_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    Ok(found.is_some())
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let f_name = get_required_str(params, "firstName")?;
    let l_name = get_required_str(params, "lastName")?;
    let subject_group = get_required_str(params, "subjectGroup")?;
    let title = get_opt_str(params, "title");
    let email = get_opt_str(params, "email");
    let phone = get_opt_str(params, "phone");
    let role = get_opt_str(params, "role").unwrap_or_else(|| "teacher".to_string());
    check_role(&role)?;

    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("teachers", year);
    if let Some(email) = &email {
        if email_taken(conn, &t, semester_id, email, None)? {
            return Err(HandlerErr::duplicate(DUPLICATE_EMAIL));
        }
    }

    conn.execute(
        &format!(
            "INSERT INTO {t}(semester_id, title, f_name, l_name, email, phone, subject_group, role)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        (
            semester_id,
            &title,
            &f_name,
            &l_name,
            &email,
            &phone,
            &subject_group,
            &role,
        ),
    )
    .map_err(|e| translate_write_err(e, "db_insert_failed", DUPLICATE_EMAIL))?;
    let teacher_id = conn.last_insert_rowid();

    conn.query_row(
        &format!("SELECT {TEACHER_COLUMNS} FROM {t} WHERE id = ?"),
        [teacher_id],
        teacher_row_json,
    )
    .map_err(query_failed)
}

fn teachers_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("teachers", year);
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TEACHER_COLUMNS} FROM {t}
             WHERE semester_id = ?
             ORDER BY f_name, l_name"
        ))
        .map_err(query_failed)?;
    let teachers = stmt
        .query_map([semester_id], teacher_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    Ok(json!({ "teachers": teachers }))
}

fn teachers_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_i64(params, "teacherId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("teachers", year);
    let exists: Option<i64> = conn
        .query_row(
            &format!("SELECT id FROM {t} WHERE id = ? AND semester_id = ?"),
            (teacher_id, semester_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("Teacher not found"));
    }

    let mut fields: Vec<&str> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(title) = get_opt_str(params, "title") {
        fields.push("title = ?");
        values.push(Box::new(title));
    }
    if let Some(f_name) = get_opt_str(params, "firstName") {
        fields.push("f_name = ?");
        values.push(Box::new(f_name));
    }
    if let Some(l_name) = get_opt_str(params, "lastName") {
        fields.push("l_name = ?");
        values.push(Box::new(l_name));
    }
    if let Some(email) = get_opt_str(params, "email") {
        if email_taken(conn, &t, semester_id, &email, Some(teacher_id))? {
            return Err(HandlerErr::duplicate(DUPLICATE_EMAIL));
        }
        fields.push("email = ?");
        values.push(Box::new(email));
    }
    if let Some(phone) = get_opt_str(params, "phone") {
        fields.push("phone = ?");
        values.push(Box::new(phone));
    }
    if let Some(subject_group) = get_opt_str(params, "subjectGroup") {
        fields.push("subject_group = ?");
        values.push(Box::new(subject_group));
    }
    if let Some(role) = get_opt_str(params, "role") {
        check_role(&role)?;
        fields.push("role = ?");
        values.push(Box::new(role));
    }
    if fields.is_empty() {
        return Err(HandlerErr::bad_params("no teacher fields to update"));
    }
    fields.push("updated_at = CURRENT_TIMESTAMP");
    values.push(Box::new(teacher_id));
    values.push(Box::new(semester_id));

    conn.execute(
        &format!(
            "UPDATE {t} SET {} WHERE id = ? AND semester_id = ?",
            fields.join(", ")
        ),
        rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
    )
    .map_err(|e| translate_write_err(e, "db_update_failed", DUPLICATE_EMAIL))?;

    conn.query_row(
        &format!("SELECT {TEACHER_COLUMNS} FROM {t} WHERE id = ?"),
        [teacher_id],
        teacher_row_json,
    )
    .map_err(query_failed)
}

fn teachers_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_i64(params, "teacherId")?;
    let semester_id = get_required_i64(params, "semesterId")?;
    let year = resolve_year(conn, params)?;
    ensure_partition(conn, year)?;

    let t = year_table("teachers", year);
    let changes = conn
        .execute(
            &format!("DELETE FROM {t} WHERE id = ? AND semester_id = ?"),
            (teacher_id, semester_id),
        )
        .map_err(|e| {
            translate_delete_err(
                e,
                "Cannot delete teacher while subjects or schedules still reference them",
            )
        })?;
    if changes == 0 {
        return Err(HandlerErr::not_found("Teacher not found"));
    }

    Ok(json!({ "teacherId": teacher_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "teachers.create" => require_db(state).and_then(|c| teachers_create(c, &req.params)),
        "teachers.list" => require_db(state).and_then(|c| teachers_list(c, &req.params)),
        "teachers.update" => require_db(state).and_then(|c| teachers_update(c, &req.params)),
        "teachers.delete" => require_db(state).and_then(|c| teachers_delete(c, &req.params)),
        _ => return None,
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}

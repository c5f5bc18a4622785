use rusqlite::{Connection, OptionalExtension};

use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::AppState;

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "duplicate",
            message: message.into(),
            details: None,
        }
    }

    pub fn in_use(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "in_use",
            message: message.into(),
            details: None,
        }
    }

    pub fn db(code: &'static str, e: rusqlite::Error) -> Self {
        HandlerErr {
            code,
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn query_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::db("db_query_failed", e)
}

pub fn provision_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr {
        code: "db_provision_failed",
        message: e.to_string(),
        details: None,
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state.db.as_ref().ok_or_else(|| HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_opt_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Resolves the partition year: an explicit `params.year` wins, otherwise the
/// active academic year. Explicit years are range-checked before they can be
/// spliced into a table name.
pub fn resolve_year(conn: &Connection, params: &serde_json::Value) -> Result<i64, HandlerErr> {
    if let Some(year) = get_opt_i64(params, "year") {
        if !(1000..=9999).contains(&year) {
            return Err(HandlerErr::bad_params("year must be between 1000 and 9999"));
        }
        return Ok(year);
    }

    let active: Option<i64> = conn
        .query_row(
            "SELECT year FROM academic_years WHERE is_active = 1",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;

    active.ok_or_else(|| HandlerErr {
        code: "no_active_year",
        message: "no active academic year".to_string(),
        details: None,
    })
}

/// Partition guarantee: every year-scoped read or write goes through this
/// first so untouched years answer with empty, well-formed results.
pub fn ensure_partition(conn: &Connection, year: i64) -> Result<(), HandlerErr> {
    db::ensure_year_tables(conn, year).map_err(provision_failed)
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, Some(msg)) => {
            f.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

pub fn is_fk_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, Some(msg)) => {
            f.code == rusqlite::ErrorCode::ConstraintViolation
                && msg.contains("FOREIGN KEY constraint failed")
        }
        _ => false,
    }
}

/// Fallback translation for insert/update races: the pre-insert existence
/// check reports duplicates first, but a constraint violation that slips
/// through must surface as the same structured error.
pub fn translate_write_err(
    e: rusqlite::Error,
    code: &'static str,
    duplicate_message: &str,
) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::duplicate(duplicate_message)
    } else {
        HandlerErr::db(code, e)
    }
}

pub fn translate_delete_err(e: rusqlite::Error, in_use_message: &str) -> HandlerErr {
    if is_fk_violation(&e) {
        HandlerErr::in_use(in_use_message)
    } else {
        HandlerErr::db("db_delete_failed", e)
    }
}

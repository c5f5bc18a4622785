use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("scheduler.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            year INTEGER NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_academic_years_active
         ON academic_years(is_active) WHERE is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            semester_name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_semesters_active
         ON semesters(is_active) WHERE is_active = 1",
        [],
    )?;

    Ok(conn)
}

/// Table name for a year-scoped entity. `year` must be range-checked by the
/// caller before it ever reaches SQL text.
pub fn year_table(base: &str, year: i64) -> String {
    format!("{}_{}", base, year)
}

pub fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

const YEAR_TABLE_BASES: [&str; 6] = [
    "teachers",
    "classes",
    "rooms",
    "periods",
    "subjects",
    "schedules",
];

/// Idempotent partition provisioning: creates any of the year's tables that
/// are missing, leaves existing ones untouched. The substitutions ledger is
/// provisioned here too so a partition is always complete once touched.
pub fn ensure_year_tables(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let mut missing = false;
    for base in YEAR_TABLE_BASES {
        if !table_exists(conn, &year_table(base, year))? {
            missing = true;
            break;
        }
    }
    if !missing && table_exists(conn, &year_table("substitutions", year))? {
        return Ok(());
    }

    create_teachers_table(conn, year)?;
    create_classes_table(conn, year)?;
    create_rooms_table(conn, year)?;
    create_periods_table(conn, year)?;
    create_subjects_table(conn, year)?;
    create_schedules_table(conn, year)?;
    create_substitutions_table(conn, year)?;
    Ok(())
}

fn create_teachers_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("teachers", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                title TEXT,
                f_name TEXT NOT NULL,
                l_name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                subject_group TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'teacher',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_semester ON {t}(semester_id)"),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_name ON {t}(f_name, l_name)"),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_{t}_email
             ON {t}(semester_id, email) WHERE email IS NOT NULL"
        ),
        [],
    )?;
    Ok(())
}

fn create_classes_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("classes", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                grade_level TEXT NOT NULL,
                section INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(semester_id, grade_level, section)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_semester ON {t}(semester_id)"),
        [],
    )?;
    Ok(())
}

fn create_rooms_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("rooms", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                room_name TEXT NOT NULL,
                room_type TEXT NOT NULL CHECK (room_type IN ('general', 'computer-lab')),
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(semester_id, room_name)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_semester ON {t}(semester_id)"),
        [],
    )?;
    Ok(())
}

fn create_periods_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("periods", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                period_no INTEGER NOT NULL,
                period_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(semester_id, period_no)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_semester ON {t}(semester_id)"),
        [],
    )?;
    Ok(())
}

fn create_subjects_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("subjects", year);
    let teachers = year_table("teachers", year);
    let classes = year_table("classes", year);
    let rooms = year_table("rooms", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                teacher_id INTEGER NOT NULL,
                class_id INTEGER NOT NULL,
                class_ids TEXT NOT NULL DEFAULT '[]',
                group_key TEXT NOT NULL DEFAULT '',
                subject_name TEXT NOT NULL,
                subject_code TEXT,
                periods_per_week INTEGER NOT NULL CHECK (periods_per_week BETWEEN 1 AND 20),
                default_room_id INTEGER,
                special_requirements TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(teacher_id) REFERENCES {teachers}(id),
                FOREIGN KEY(class_id) REFERENCES {classes}(id),
                FOREIGN KEY(default_room_id) REFERENCES {rooms}(id),
                UNIQUE(semester_id, teacher_id, class_id, subject_name)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_semester ON {t}(semester_id)"),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_teacher ON {t}(teacher_id)"),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_group ON {t}(group_key)"),
        [],
    )?;
    Ok(())
}

fn create_schedules_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    let rooms = year_table("rooms", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                subject_id INTEGER NOT NULL,
                day_of_week INTEGER NOT NULL CHECK (day_of_week BETWEEN 1 AND 7),
                period_no INTEGER NOT NULL,
                room_id INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(subject_id) REFERENCES {subjects}(id),
                FOREIGN KEY(room_id) REFERENCES {rooms}(id),
                UNIQUE(semester_id, day_of_week, period_no, room_id),
                UNIQUE(semester_id, subject_id, day_of_week, period_no)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_conflict
             ON {t}(semester_id, day_of_week, period_no)"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_subject ON {t}(subject_id)"),
        [],
    )?;
    Ok(())
}

fn create_substitutions_table(conn: &Connection, year: i64) -> anyhow::Result<()> {
    let t = year_table("substitutions", year);
    let teachers = year_table("teachers", year);
    let schedules = year_table("schedules", year);
    let subjects = year_table("subjects", year);
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {t}(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                semester_id INTEGER NOT NULL,
                absent_date TEXT NOT NULL,
                absent_teacher_id INTEGER NOT NULL,
                reason TEXT,
                schedule_id INTEGER NOT NULL,
                subject_id INTEGER NOT NULL,
                substitute_teacher_id INTEGER,
                status TEXT NOT NULL DEFAULT 'assigned',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(absent_teacher_id) REFERENCES {teachers}(id),
                FOREIGN KEY(substitute_teacher_id) REFERENCES {teachers}(id),
                FOREIGN KEY(schedule_id) REFERENCES {schedules}(id),
                FOREIGN KEY(subject_id) REFERENCES {subjects}(id),
                UNIQUE(semester_id, absent_date, schedule_id)
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{t}_date ON {t}(semester_id, absent_date)"),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{t}_substitute ON {t}(substitute_teacher_id)"
        ),
        [],
    )?;
    Ok(())
}

const DEFAULT_PERIODS: [(i64, &str, &str, &str); 8] = [
    (1, "Period 1", "08:00", "08:50"),
    (2, "Period 2", "08:50", "09:40"),
    (3, "Period 3", "09:40", "10:30"),
    (4, "Period 4", "10:40", "11:30"),
    (5, "Period 5", "11:30", "12:20"),
    (6, "Period 6", "13:00", "13:50"),
    (7, "Period 7", "13:50", "14:40"),
    (8, "Period 8", "14:40", "15:30"),
];

/// Seeds the canonical 8-period day for a `(year, semester)` pair that has no
/// periods yet. Pairs that already have any rows are left alone, so repeat
/// calls never duplicate the defaults.
pub fn ensure_default_periods(conn: &Connection, year: i64, semester_id: i64) -> anyhow::Result<()> {
    let t = year_table("periods", year);
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {t} WHERE semester_id = ?"),
        [semester_id],
        |r| r.get(0),
    )?;
    if count > 0 {
        return Ok(());
    }

    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {t}(semester_id, period_no, period_name, start_time, end_time, is_active)
         VALUES(?, ?, ?, ?, ?, 1)"
    ))?;
    for (period_no, period_name, start_time, end_time) in DEFAULT_PERIODS {
        stmt.execute((semester_id, period_no, period_name, start_time, end_time))?;
    }
    Ok(())
}

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise every table this crate reads or writes. Idempotent, so it runs
/// on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_rule_tables(conn)?;
    create_goal_tables(conn)?;
    create_todo_table(conn)?;
    Ok(())
}

/// Canonical text form of `completed_at`. Fixed width with a `Z` suffix, so
/// string comparison in SQL orders the same as time.
pub fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn create_rule_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_rules (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_name   TEXT    NOT NULL,
            start_time  TEXT    NOT NULL,               -- HH:MM local time
            end_time    TEXT,                           -- advisory, HH:MM or NULL
            day_of_week TEXT    NOT NULL DEFAULT '*',
            enabled     INTEGER NOT NULL DEFAULT 1
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_rules_enabled ON schedule_rules (enabled);

        CREATE TABLE IF NOT EXISTS user_rule_assignment (
            user_id       TEXT NOT NULL PRIMARY KEY,
            assigned_rule TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_goal_tables(conn: &Connection) -> Result<()> {
    // History rows are verbatim copies of active rows, so both tables share a
    // column layout; the history table has no autoincrement of its own.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS long_term_goals (
            goal_id      INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      TEXT    NOT NULL,
            task_text    TEXT    NOT NULL,
            priority     INTEGER NOT NULL DEFAULT 3,
            completed    INTEGER NOT NULL DEFAULT 0,
            completed_at TEXT,                          -- RFC 3339 UTC or NULL
            time_spent   INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        CREATE TABLE IF NOT EXISTS long_term_goals_his (
            goal_id      INTEGER NOT NULL PRIMARY KEY,
            user_id      TEXT    NOT NULL,
            task_text    TEXT    NOT NULL,
            priority     INTEGER NOT NULL,
            completed_at TEXT,
            time_spent   INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_todo_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS todo_list (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            username          TEXT NOT NULL,
            date              TEXT NOT NULL,            -- YYYY-MM-DD local date
            time_slot         TEXT,                     -- 'HH:MM - HH:MM'
            task              TEXT,
            completion_status TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_todo_list_date ON todo_list (date);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('schedule_rules', 'user_rule_assignment',
                              'long_term_goals', 'long_term_goals_his', 'todo_list')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveTime;
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::DayMask,
    types::{RuleDraft, ScheduleRule, UserRuleAssignment},
};

const RULE_COLUMNS: &str = "id, rule_name, start_time, end_time, day_of_week, enabled";

/// Durable schedule rules and user assignments.
///
/// Wraps one SQLite connection in a `Mutex`; cloning shares the connection.
#[derive(Clone)]
pub struct RuleStore {
    conn: Arc<Mutex<Connection>>,
}

impl RuleStore {
    /// Wrap a connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self::from_shared(Arc::new(Mutex::new(conn))))
    }

    /// Share a connection that is already initialised and used elsewhere.
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rules the scheduler should turn into timers. Rows that fail to parse
    /// are logged and left out rather than failing the whole read.
    pub fn enabled_rules(&self) -> Result<Vec<ScheduleRule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM schedule_rules WHERE enabled = 1 ORDER BY id"
        ))?;
        let rules = stmt
            .query_map([], row_to_rule)?
            .filter_map(|r| match r {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("skipping unreadable schedule rule: {e}");
                    None
                }
            })
            .collect();
        Ok(rules)
    }

    /// Every rule, enabled first then by start time (admin listing order).
    pub fn list_rules(&self) -> Result<Vec<ScheduleRule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM schedule_rules ORDER BY enabled DESC, start_time ASC"
        ))?;
        let rules = stmt.query_map([], row_to_rule)?.collect::<rusqlite::Result<_>>()?;
        Ok(rules)
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<ScheduleRule>> {
        let rule = self
            .conn()
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM schedule_rules WHERE id = ?1"),
                [id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// Insert an enabled rule and return it with its new id.
    pub fn add_rule(&self, draft: &RuleDraft) -> Result<ScheduleRule> {
        let days = DayMask::from_selection(&draft.days)?.to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO schedule_rules (rule_name, start_time, end_time, day_of_week, enabled)
             VALUES (?1, ?2, ?3, ?4, 1)",
            rusqlite::params![
                draft.rule_name,
                fmt_time(draft.start_time),
                draft.end_time.map(fmt_time),
                days
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(rule_id = id, rule_name = %draft.rule_name, "rule added");
        Ok(ScheduleRule {
            id,
            rule_name: draft.rule_name.clone(),
            start_time: draft.start_time,
            end_time: draft.end_time,
            day_of_week: days,
            enabled: true,
        })
    }

    /// Change a rule's timing. The rule name and enabled flag are untouched.
    pub fn update_rule(&self, id: i64, draft: &RuleDraft) -> Result<()> {
        let days = DayMask::from_selection(&draft.days)?.to_string();
        let n = self.conn().execute(
            "UPDATE schedule_rules SET start_time = ?1, end_time = ?2, day_of_week = ?3
             WHERE id = ?4",
            rusqlite::params![
                fmt_time(draft.start_time),
                draft.end_time.map(fmt_time),
                days,
                id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::RuleNotFound { id });
        }
        info!(rule_id = id, "rule updated");
        Ok(())
    }

    pub fn delete_rule(&self, id: i64) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM schedule_rules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::RuleNotFound { id });
        }
        info!(rule_id = id, "rule deleted");
        Ok(())
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE schedule_rules SET enabled = ?1 WHERE id = ?2",
            rusqlite::params![enabled, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::RuleNotFound { id });
        }
        info!(rule_id = id, enabled, "rule toggled");
        Ok(())
    }

    /// Upsert the rule a user's "run now" action triggers.
    pub fn assign_rule(&self, user_id: &str, rule_name: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_rule_assignment (user_id, assigned_rule) VALUES (?1, ?2)
             ON CONFLICT (user_id) DO UPDATE SET assigned_rule = excluded.assigned_rule",
            rusqlite::params![user_id, rule_name],
        )?;
        Ok(())
    }

    pub fn assigned_rule(&self, user_id: &str) -> Result<Option<String>> {
        let rule = self
            .conn()
            .query_row(
                "SELECT assigned_rule FROM user_rule_assignment WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rule)
    }

    pub fn list_assignments(&self) -> Result<Vec<UserRuleAssignment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, assigned_rule FROM user_rule_assignment ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRuleAssignment {
                    user_id: row.get(0)?,
                    assigned_rule: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

fn fmt_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a SELECT row (column order from RULE_COLUMNS) to a ScheduleRule.
fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRule> {
    let start_time = parse_time(2, &row.get::<_, String>(2)?)?;
    let end_time = row
        .get::<_, Option<String>>(3)?
        .filter(|s| !s.is_empty())
        .map(|s| parse_time(3, &s))
        .transpose()?;
    Ok(ScheduleRule {
        id: row.get(0)?,
        rule_name: row.get(1)?,
        start_time,
        end_time,
        day_of_week: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RuleStore {
        RuleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn draft(name: &str, hh: u32, mm: u32, days: &[&str]) -> RuleDraft {
        RuleDraft {
            rule_name: name.to_string(),
            start_time: NaiveTime::from_hms_opt(hh, mm, 0).unwrap(),
            end_time: None,
            days: days.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn add_then_read_back() {
        let store = store();
        let rule = store.add_rule(&draft("Rule disable all", 21, 0, &[])).unwrap();
        assert_eq!(rule.day_of_week, "*");
        assert_eq!(rule.job_id(), format!("rule_{}", rule.id));

        let stored = store.get_rule(rule.id).unwrap().unwrap();
        assert_eq!(stored, rule);
    }

    #[test]
    fn enabled_rules_excludes_disabled() {
        let store = store();
        let a = store.add_rule(&draft("Rule disable all", 21, 0, &[])).unwrap();
        let b = store.add_rule(&draft("Rule disable all", 22, 0, &[])).unwrap();
        store.set_enabled(b.id, false).unwrap();

        let ids: Vec<i64> = store.enabled_rules().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id]);
        assert_eq!(store.list_rules().unwrap().len(), 2);
    }

    #[test]
    fn update_normalises_days_and_keeps_name() {
        let store = store();
        let rule = store.add_rule(&draft("Rule enable AI", 8, 0, &[])).unwrap();
        store
            .update_rule(rule.id, &draft("ignored", 9, 15, &["mon", "wed"]))
            .unwrap();

        let stored = store.get_rule(rule.id).unwrap().unwrap();
        assert_eq!(stored.rule_name, "Rule enable AI");
        assert_eq!(stored.start_time, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        assert_eq!(stored.day_of_week, "mon,wed");
    }

    #[test]
    fn missing_rule_is_reported() {
        let store = store();
        assert!(matches!(
            store.delete_rule(99),
            Err(SchedulerError::RuleNotFound { id: 99 })
        ));
        assert!(matches!(
            store.set_enabled(99, true),
            Err(SchedulerError::RuleNotFound { id: 99 })
        ));
    }

    #[test]
    fn unreadable_rows_are_skipped() {
        let store = store();
        store.add_rule(&draft("Rule disable all", 7, 0, &[])).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO schedule_rules (rule_name, start_time, day_of_week, enabled)
                 VALUES ('Rule enable AI', 'noon', '*', 1)",
                [],
            )
            .unwrap();

        assert_eq!(store.enabled_rules().unwrap().len(), 1);
    }

    #[test]
    fn assignment_upserts() {
        let store = store();
        store.assign_rule("u1", "Rule disable all").unwrap();
        store.assign_rule("u1", "Rule enable AI").unwrap();
        assert_eq!(
            store.assigned_rule("u1").unwrap().as_deref(),
            Some("Rule enable AI")
        );
        assert_eq!(store.assigned_rule("u2").unwrap(), None);
        assert_eq!(store.list_assignments().unwrap().len(), 1);
    }
}

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::{db::sql_timestamp, error::JobError, registry::JobBody};

/// A completed goal row, copied verbatim into the history table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGoal {
    pub goal_id: i64,
    pub user_id: String,
    pub task_text: String,
    pub priority: i64,
    pub completed_at: Option<String>,
    pub time_spent: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveReport {
    pub moved: usize,
    pub failed: usize,
}

/// Moves goals completed more than `retention` ago into `long_term_goals_his`.
pub struct ArchiveCompletedTasks {
    conn: Arc<Mutex<Connection>>,
    retention: Duration,
}

impl ArchiveCompletedTasks {
    pub fn new(conn: Arc<Mutex<Connection>>, retention: Duration) -> Self {
        Self { conn, retention }
    }

    /// Archive everything completed at or before `now - retention`.
    ///
    /// Each row moves in its own transaction: a row that fails is logged and
    /// left in place, and the rest still move.
    pub fn archive_at(&self, now: DateTime<Utc>) -> Result<ArchiveReport, JobError> {
        let cutoff = sql_timestamp(now - self.retention);
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let rows = {
            let mut stmt = conn.prepare(
                "SELECT goal_id, user_id, task_text, priority, completed_at, time_spent
                 FROM long_term_goals
                 WHERE completed = 1 AND completed_at IS NOT NULL AND completed_at <= ?1
                 ORDER BY goal_id",
            )?;
            let rows = stmt
                .query_map([&cutoff], |row| {
                    Ok(CompletedGoal {
                        goal_id: row.get(0)?,
                        user_id: row.get(1)?,
                        task_text: row.get(2)?,
                        priority: row.get(3)?,
                        completed_at: row.get(4)?,
                        time_spent: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut report = ArchiveReport::default();
        for goal in &rows {
            match move_to_history(&mut conn, goal) {
                Ok(()) => {
                    report.moved += 1;
                    info!(goal_id = goal.goal_id, "archived completed goal");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(goal_id = goal.goal_id, error = %e, "failed to archive goal");
                }
            }
        }
        Ok(report)
    }
}

fn move_to_history(conn: &mut Connection, goal: &CompletedGoal) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO long_term_goals_his
         (goal_id, user_id, task_text, priority, completed_at, time_spent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            goal.goal_id,
            goal.user_id,
            goal.task_text,
            goal.priority,
            goal.completed_at,
            goal.time_spent
        ],
    )?;
    tx.execute(
        "DELETE FROM long_term_goals WHERE goal_id = ?1",
        [goal.goal_id],
    )?;
    tx.commit()
}

#[async_trait]
impl JobBody for ArchiveCompletedTasks {
    async fn run(&self) -> Result<(), JobError> {
        let report = self.archive_at(Utc::now())?;
        info!(moved = report.moved, failed = report.failed, "goal archive finished");
        if report.failed > 0 {
            return Err(JobError::msg(format!(
                "{} of {} goals could not be archived",
                report.failed,
                report.moved + report.failed
            )));
        }
        Ok(())
    }
}

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::{collaborators::AlertPusher, error::JobError, registry::JobBody};

#[derive(Debug, Clone)]
struct PendingTodo {
    id: i64,
    username: String,
    time_slot: Option<String>,
    task: Option<String>,
}

impl PendingTodo {
    /// `"{slot} - {task}"`, falling back to whichever part is present, then to
    /// the owner's name.
    fn message(&self) -> String {
        let slot = self.time_slot.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let task = self.task.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (slot, task) {
            (Some(slot), Some(task)) => format!("{slot} - {task}"),
            (Some(slot), None) => slot.to_string(),
            (None, Some(task)) => task.to_string(),
            (None, None) => self.username.clone(),
        }
    }
}

/// End of an `"HH:MM - HH:MM"` slot, or `None` if the slot is malformed.
pub fn slot_end(time_slot: &str) -> Option<NaiveTime> {
    let (_, end) = time_slot.split_once('-')?;
    NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()
}

#[derive(Default)]
struct NotifiedToday {
    date: Option<NaiveDate>,
    ids: HashSet<i64>,
}

/// Alerts once per todo item per day when its slot has ended without a
/// completion status being recorded.
pub struct NotifyOverdueFeedback {
    conn: Arc<Mutex<Connection>>,
    alerts: Arc<dyn AlertPusher>,
    notified: Mutex<NotifiedToday>,
}

impl NotifyOverdueFeedback {
    pub fn new(conn: Arc<Mutex<Connection>>, alerts: Arc<dyn AlertPusher>) -> Self {
        Self {
            conn,
            alerts,
            notified: Mutex::new(NotifiedToday::default()),
        }
    }

    fn notified(&self) -> MutexGuard<'_, NotifiedToday> {
        self.notified.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One pass at local time `now`. Returns how many alerts were sent.
    ///
    /// A failed push is logged and not recorded, so the item is retried on
    /// the next pass.
    pub async fn notify_at(&self, now: NaiveDateTime) -> Result<usize, JobError> {
        let today = now.date();
        {
            let mut notified = self.notified();
            if notified.date != Some(today) {
                notified.date = Some(today);
                notified.ids.clear();
            }
        }

        let mut sent = 0;
        for todo in self.pending(today)? {
            if self.notified().ids.contains(&todo.id) {
                continue;
            }
            let Some(end) = todo.time_slot.as_deref().and_then(slot_end) else {
                debug!(todo_id = todo.id, "todo has no parseable time slot; skipping");
                continue;
            };
            if now < today.and_time(end) {
                continue;
            }

            let message = todo.message();
            match self.alerts.push(&message).await {
                Ok(()) => {
                    self.notified().ids.insert(todo.id);
                    sent += 1;
                    info!(todo_id = todo.id, %message, "overdue feedback alert sent");
                }
                Err(e) => warn!(todo_id = todo.id, error = %e, "failed to push overdue alert"),
            }
        }
        Ok(sent)
    }

    fn pending(&self, today: NaiveDate) -> Result<Vec<PendingTodo>, JobError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, username, time_slot, task FROM todo_list
             WHERE date = ?1 AND COALESCE(completion_status, '') = ''
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([today.format("%Y-%m-%d").to_string()], |row| {
                Ok(PendingTodo {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    time_slot: row.get(2)?,
                    task: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl JobBody for NotifyOverdueFeedback {
    async fn run(&self) -> Result<(), JobError> {
        self.notify_at(Local::now().naive_local()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use rusqlite::params;

    #[derive(Default)]
    struct RecordingPusher {
        messages: Mutex<Vec<String>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl AlertPusher for RecordingPusher {
        async fn push(&self, message: &str) -> Result<(), JobError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(JobError::msg("listener down"));
            }
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn add_todo(conn: &Arc<Mutex<Connection>>, date: &str, slot: Option<&str>, task: Option<&str>, status: Option<&str>) {
        conn.lock()
            .unwrap()
            .execute(
                "INSERT INTO todo_list (username, date, time_slot, task, completion_status)
                 VALUES ('mia', ?1, ?2, ?3, ?4)",
                params![date, slot, task, status],
            )
            .unwrap();
    }

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn slot_parsing() {
        assert_eq!(slot_end("09:00 - 10:30"), NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(slot_end("09:00-10:30"), NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(slot_end("morning"), None);
        assert_eq!(slot_end("09:00 - late"), None);
    }

    #[tokio::test]
    async fn alerts_once_per_item_per_day() {
        let conn = setup();
        let pusher = Arc::new(RecordingPusher::default());
        add_todo(&conn, "2026-10-16", Some("09:00 - 10:00"), Some("Homework"), None);
        add_todo(&conn, "2026-10-16", Some("10:00 - 11:00"), Some("Piano"), Some(""));
        add_todo(&conn, "2026-10-16", Some("08:00 - 09:00"), Some("Done"), Some("done"));
        add_todo(&conn, "2026-10-16", Some("15:00 - 16:00"), Some("Later"), None);
        add_todo(&conn, "2026-10-15", Some("09:00 - 10:00"), Some("Yesterday"), None);

        let job = NotifyOverdueFeedback::new(conn.clone(), pusher.clone());
        assert_eq!(job.notify_at(at("2026-10-16", "11:00")).await.unwrap(), 2);
        assert_eq!(job.notify_at(at("2026-10-16", "11:01")).await.unwrap(), 0);
        assert_eq!(
            *pusher.messages.lock().unwrap(),
            vec!["09:00 - 10:00 - Homework", "10:00 - 11:00 - Piano"]
        );

        assert_eq!(job.notify_at(at("2026-10-16", "16:00")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn day_rollover_resets_memory() {
        let conn = setup();
        let pusher = Arc::new(RecordingPusher::default());
        add_todo(&conn, "2026-10-16", Some("09:00 - 10:00"), Some("Homework"), None);
        add_todo(&conn, "2026-10-17", Some("09:00 - 10:00"), Some("Homework"), None);

        let job = NotifyOverdueFeedback::new(conn, pusher.clone());
        assert_eq!(job.notify_at(at("2026-10-16", "12:00")).await.unwrap(), 1);
        assert_eq!(job.notify_at(at("2026-10-17", "12:00")).await.unwrap(), 1);
        assert_eq!(pusher.messages.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_push_is_retried() {
        let conn = setup();
        let pusher = Arc::new(RecordingPusher::default());
        add_todo(&conn, "2026-10-16", Some("09:00 - 10:00"), None, None);

        let job = NotifyOverdueFeedback::new(conn, pusher.clone());
        pusher.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(job.notify_at(at("2026-10-16", "12:00")).await.unwrap(), 0);

        pusher.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(job.notify_at(at("2026-10-16", "12:01")).await.unwrap(), 1);
        assert_eq!(*pusher.messages.lock().unwrap(), vec!["09:00 - 10:00"]);
    }

    #[test]
    fn message_fallbacks() {
        let todo = |slot: Option<&str>, task: Option<&str>| PendingTodo {
            id: 1,
            username: "mia".into(),
            time_slot: slot.map(Into::into),
            task: task.map(Into::into),
        };
        assert_eq!(todo(None, Some("Piano")).message(), "Piano");
        assert_eq!(todo(Some(" "), None).message(), "mia");
    }
}

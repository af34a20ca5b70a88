//! Postgres as a coordination store: session-level advisory locks for mutual
//! exclusion and LISTEN/NOTIFY for change fan-out.
//!
//! Every lease owns a dedicated connection. Postgres drops session advisory
//! locks when the session ends, so closing (or losing) the connection is the
//! release path.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgListener};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, warn};

use super::{ChangeBus, ChangeSubscription, LockBackend, LockLease};
use crate::error::{Result, SchedulerError};

#[derive(Clone)]
pub struct PgCoordinator {
    url: String,
    options: PgConnectOptions,
    channel: String,
}

impl PgCoordinator {
    /// Parse the URL eagerly; no connection is opened until first use.
    pub fn new(url: &str, channel: impl Into<String>) -> Result<Self> {
        let channel = channel.into();
        if !is_valid_channel(&channel) {
            return Err(SchedulerError::Coordination(format!(
                "invalid notification channel name '{channel}'"
            )));
        }
        let options: PgConnectOptions = url.parse()?;
        Ok(Self {
            url: url.to_string(),
            // Lock probes run on every trigger; keep them out of the statement log.
            options: options.disable_statement_logging(),
            channel,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&self) -> Result<PgConnection> {
        Ok(self.options.connect().await?)
    }
}

fn is_valid_channel(channel: &str) -> bool {
    !channel.is_empty()
        && channel
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl LockBackend for PgCoordinator {
    async fn try_lock(&self, key: i64) -> Result<Option<Box<dyn LockLease>>> {
        let mut conn = self.connect().await?;
        let locked: bool = match sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await
        {
            Ok(locked) => locked,
            Err(e) => {
                close_quietly(conn).await;
                return Err(e.into());
            }
        };

        if !locked {
            close_quietly(conn).await;
            return Ok(None);
        }
        Ok(Some(Box::new(PgLease {
            key,
            conn: Mutex::new(Some(conn)),
        })))
    }
}

async fn close_quietly(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        debug!("closing probe connection failed: {e}");
    }
}

struct PgLease {
    key: i64,
    /// `None` once the connection has failed a probe or been released. Only
    /// ever reached through `&mut self`; the mutex just makes the lease `Sync`.
    conn: Mutex<Option<PgConnection>>,
}

impl PgLease {
    fn slot(&mut self) -> &mut Option<PgConnection> {
        self.conn.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LockLease for PgLease {
    async fn is_alive(&mut self) -> bool {
        let key = self.key;
        let slot = self.slot();
        let Some(conn) = slot.as_mut() else {
            return false;
        };
        match sqlx::query("SELECT 1").execute(&mut *conn).await {
            Ok(_) => true,
            Err(e) => {
                warn!(lock_key = key, "lock connection lost: {e}");
                // Dropping the dead connection is all the cleanup there is.
                *slot = None;
                false
            }
        }
    }

    async fn release(mut self: Box<Self>) {
        if let Some(conn) = self.slot().take() {
            if let Err(e) = conn.close().await {
                warn!(lock_key = self.key, "failed to close lock connection: {e}");
            }
        }
    }
}

#[async_trait]
impl ChangeBus for PgCoordinator {
    async fn publish(&self, payload: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        let sent = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&mut conn)
            .await;
        close_quietly(conn).await;
        sent?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>> {
        let mut listener = PgListener::connect(&self.url).await?;
        listener.listen(&self.channel).await?;
        debug!(channel = %self.channel, "listening for schedule changes");
        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl ChangeSubscription for PgSubscription {
    async fn recv(&mut self) -> Result<String> {
        // `try_recv` surfaces a dropped connection as `None` instead of
        // silently reconnecting, which would hide lost notifications.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_string()),
            None => Err(SchedulerError::Coordination(
                "listener connection lost".to_string(),
            )),
        }
    }

    async fn try_recv(&mut self) -> Result<Option<String>> {
        Ok(self
            .listener
            .next_buffered()
            .map(|notification| notification.payload().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_channel_names() {
        assert!(PgCoordinator::new("postgres://localhost/hearth", "bad channel").is_err());
        assert!(PgCoordinator::new("postgres://localhost/hearth", "").is_err());
    }

    #[test]
    fn parses_url_without_connecting() {
        let coordinator =
            PgCoordinator::new("postgres://hearth@localhost:5432/hearth", "schedule_rules_changed")
                .unwrap();
        assert_eq!(coordinator.channel(), "schedule_rules_changed");
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(PgCoordinator::new("not a url", "schedule_rules_changed").is_err());
    }
}

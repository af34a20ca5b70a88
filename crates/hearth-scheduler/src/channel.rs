//! Change propagation between processes.
//!
//! Every mutation publishes the writer's instance id on the shared channel;
//! every listener ignores its own id and reloads from the rule store on
//! anything else. The payload carries no data, so a lost or duplicated
//! message costs at most a missed or redundant reload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    coordination::{ChangeBus, ChangeSubscription},
    error::Result,
};

/// Whatever rebuilds local timers from the durable store.
#[async_trait]
pub trait Reloader: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

/// Publishing side, tagged with this process's instance id.
#[derive(Clone)]
pub struct ChangeChannel {
    bus: Arc<dyn ChangeBus>,
    instance_id: String,
}

impl ChangeChannel {
    pub fn new(bus: Arc<dyn ChangeBus>, instance_id: impl Into<String>) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Announce that rules changed. Failures are logged and swallowed: the
    /// mutation has already committed and other processes converge on their
    /// next reload.
    pub async fn publish(&self) {
        match self.bus.publish(&self.instance_id).await {
            Ok(()) => debug!(instance_id = %self.instance_id, "schedule change published"),
            Err(e) => error!(error = %e, "failed to notify schedule update"),
        }
    }

    pub async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>> {
        self.bus.subscribe().await
    }

    /// Build the background listener for this channel.
    pub fn listener(&self, reloader: Arc<dyn Reloader>, stop: CancellationToken) -> ChangeListener {
        ChangeListener {
            channel: self.clone(),
            reloader,
            wait: Duration::from_millis(hearth_core::config::DEFAULT_LISTEN_WAIT_MS),
            backoff: Duration::from_secs(hearth_core::config::DEFAULT_LISTENER_BACKOFF_SECS),
            stop,
        }
    }
}

/// Long-running subscriber that reloads on foreign notifications.
///
/// It only returns once `stop` is cancelled; connection loss is logged,
/// followed by a backoff, a fresh subscription and a catch-up reload for
/// anything published while disconnected.
pub struct ChangeListener {
    channel: ChangeChannel,
    reloader: Arc<dyn Reloader>,
    wait: Duration,
    backoff: Duration,
    stop: CancellationToken,
}

impl ChangeListener {
    /// Upper bound on one blocking wait; stop is observed at least this often.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn the loop. `initial` lets the caller subscribe before its first
    /// reload so nothing published in between is missed.
    pub fn spawn(self, initial: Option<Box<dyn ChangeSubscription>>) -> JoinHandle<()> {
        tokio::spawn(self.run(initial))
    }

    pub async fn run(self, mut initial: Option<Box<dyn ChangeSubscription>>) {
        info!(instance_id = %self.channel.instance_id(), "schedule listener started");
        let mut catch_up = false;

        while !self.stop.is_cancelled() {
            let subscription = match initial.take() {
                Some(sub) => Ok(sub),
                None => self.channel.subscribe().await,
            };
            let outcome = match subscription {
                Ok(sub) => self.listen(sub, catch_up).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = self.backoff.as_secs(),
                        "schedule listener crashed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                    catch_up = true;
                }
            }
        }
        info!("schedule listener stopped");
    }

    /// Returns `Ok` only when stopped; any error means "resubscribe".
    async fn listen(&self, mut sub: Box<dyn ChangeSubscription>, catch_up: bool) -> Result<()> {
        if catch_up {
            info!("schedule listener resubscribed; reloading to catch up");
            self.reload().await;
        }

        loop {
            let first = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(()),
                waited = tokio::time::timeout(self.wait, sub.recv()) => match waited {
                    Err(_elapsed) => continue,
                    Ok(payload) => payload?,
                },
            };

            // Coalesce everything already queued into a single reload.
            let mut foreign = self.is_foreign(&first);
            while let Some(payload) = sub.try_recv().await? {
                foreign |= self.is_foreign(&payload);
            }

            if foreign {
                info!("schedule change received; reloading");
                self.reload().await;
            } else {
                debug!("ignoring own schedule notification");
            }
        }
    }

    fn is_foreign(&self, payload: &str) -> bool {
        payload != self.channel.instance_id()
    }

    async fn reload(&self) {
        if let Err(e) = self.reloader.reload().await {
            error!(error = %e, "schedule reload after notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::coordination::MemoryCoordinator;

    #[derive(Default)]
    struct CountingReloader(AtomicUsize);

    #[async_trait]
    impl Reloader for CountingReloader {
        async fn reload(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for(counter: &CountingReloader, at_least: usize) -> bool {
        for _ in 0..100 {
            if counter.0.load(Ordering::SeqCst) >= at_least {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn start(
        bus: &MemoryCoordinator,
        id: &str,
        reloader: &Arc<CountingReloader>,
        stop: &CancellationToken,
    ) -> (ChangeChannel, JoinHandle<()>) {
        let channel = ChangeChannel::new(Arc::new(bus.clone()), id);
        let handle = channel
            .listener(reloader.clone(), stop.clone())
            .with_wait(Duration::from_millis(20))
            .with_backoff(Duration::from_millis(20))
            .spawn(None);
        (channel, handle)
    }

    #[tokio::test]
    async fn own_notifications_are_ignored() {
        let bus = MemoryCoordinator::new();
        let reloader = Arc::new(CountingReloader::default());
        let stop = CancellationToken::new();
        let (channel, handle) = start(&bus, "a", &reloader, &stop);
        assert!(wait_for_subscribers(&bus, 1).await);

        channel.publish().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(reloader.0.load(Ordering::SeqCst), 0);

        ChangeChannel::new(Arc::new(bus.clone()), "b").publish().await;
        assert!(wait_for(&reloader, 1).await);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn burst_is_coalesced() {
        let bus = MemoryCoordinator::new();
        let reloader = Arc::new(CountingReloader::default());
        let stop = CancellationToken::new();
        let channel = ChangeChannel::new(Arc::new(bus.clone()), "a");
        let sub = channel.subscribe().await.unwrap();

        let other = ChangeChannel::new(Arc::new(bus.clone()), "b");
        for _ in 0..5 {
            other.publish().await;
        }

        let handle = channel
            .listener(reloader.clone(), stop.clone())
            .with_wait(Duration::from_millis(20))
            .spawn(Some(sub));
        assert!(wait_for(&reloader, 1).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(reloader.0.load(Ordering::SeqCst), 1);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn lost_connection_resubscribes_and_catches_up() {
        let bus = MemoryCoordinator::new();
        let reloader = Arc::new(CountingReloader::default());
        let stop = CancellationToken::new();
        let (_channel, handle) = start(&bus, "a", &reloader, &stop);
        assert!(wait_for_subscribers(&bus, 1).await);

        bus.disconnect_subscribers();
        // Catch-up reload after the backoff, with no message involved.
        assert!(wait_for(&reloader, 1).await);
        assert!(wait_for_subscribers(&bus, 1).await);

        stop.cancel();
        handle.await.unwrap();
    }

    async fn wait_for_subscribers(bus: &MemoryCoordinator, n: usize) -> bool {
        for _ in 0..100 {
            if bus.subscriber_count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

//! Listen-channel aggregator
//!
//! The driver SPI only accepts "replace the whole listen set". This list
//! keeps the current set per driver, turns incremental add/remove into full
//! pushes and rolls back to the last accepted set when the driver rejects a
//! candidate.
//!
//! Pushed updates arrive on a bounded queue and are applied by a dispatch
//! task in arrival order, so a driver calling the sink never blocks on
//! channel locks. The task starts with the first listened channel; a full
//! queue drops the batch with a rate-limited warning.

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::channel::Channel;
use super::driver::Driver;
use crate::error::Result;
use crate::log_limiter::LogLimiter;
use crate::spi::ChannelUpdateSink;
use crate::types::{ChannelLocator, SampledValueContainer};

/// Pushed batches buffered per driver before new ones are dropped
pub const LISTEN_QUEUE_CAPACITY: usize = 1024;

type Routes = DashMap<ChannelLocator, Weak<Channel>>;
type Batch = Vec<SampledValueContainer>;

struct QueueSink {
    driver_id: String,
    tx: mpsc::Sender<Batch>,
    log: Arc<LogLimiter>,
}

impl ChannelUpdateSink for QueueSink {
    fn channels_updated(&self, updates: Vec<SampledValueContainer>) {
        match self.tx.try_send(updates) {
            Ok(()) => {},
            Err(TrySendError::Full(dropped)) => self.log.warn(format!(
                "Drv {} listen queue full, dropped {} updates",
                self.driver_id,
                dropped.len()
            )),
            // receiver gone means the list is closed
            Err(TrySendError::Closed(_)) => {},
        }
    }
}

/// Receiver and state the dispatch task takes over when it starts
struct PendingDispatch {
    rx: mpsc::Receiver<Batch>,
    log: Arc<LogLimiter>,
}

/// Listen set of one driver
pub struct ChannelUpdateListenerList {
    driver_id: String,
    current: Mutex<Vec<ChannelLocator>>,
    routes: Arc<Routes>,
    sink: Arc<dyn ChannelUpdateSink>,
    pending: SyncMutex<Option<PendingDispatch>>,
    cancel: CancellationToken,
}

impl ChannelUpdateListenerList {
    pub fn new(driver_id: impl Into<String>, log: Arc<LogLimiter>) -> Self {
        Self::with_capacity(driver_id, log, LISTEN_QUEUE_CAPACITY)
    }

    /// Create the list with room for `capacity` pushed batches. Nothing is
    /// spawned until a channel is listened to.
    pub fn with_capacity(driver_id: impl Into<String>, log: Arc<LogLimiter>, capacity: usize) -> Self {
        let driver_id = driver_id.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sink: Arc::new(QueueSink {
                driver_id: driver_id.clone(),
                tx,
                log: Arc::clone(&log),
            }),
            driver_id,
            current: Mutex::new(Vec::new()),
            routes: Arc::new(Routes::new()),
            pending: SyncMutex::new(Some(PendingDispatch { rx, log })),
            cancel: CancellationToken::new(),
        }
    }

    /// Whether the dispatch task has been started
    pub fn is_dispatching(&self) -> bool {
        self.pending.lock().is_none()
    }

    fn ensure_dispatch(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        debug!("Drv {} listen dispatch started", self.driver_id);
        tokio::spawn(dispatch(
            self.driver_id.clone(),
            pending.rx,
            Arc::clone(&self.routes),
            self.cancel.clone(),
            pending.log,
        ));
    }

    /// Snapshot of the set last accepted by the driver
    pub async fn current(&self) -> Vec<ChannelLocator> {
        self.current.lock().await.clone()
    }

    /// Add `channel` to the listen set. On rejection the previous set is
    /// pushed back and the driver's error returned.
    pub async fn add_listen_channel(&self, driver: &Driver, channel: &Arc<Channel>) -> Result<()> {
        let locator = channel.locator();
        let mut current = self.current.lock().await;
        self.routes
            .insert(locator.clone(), Arc::downgrade(channel));
        if current.contains(locator) {
            return Ok(());
        }
        self.ensure_dispatch();

        let mut candidate = current.clone();
        candidate.push(locator.clone());
        match driver
            .listen_channels(candidate.clone(), Some(Arc::clone(&self.sink)))
            .await
        {
            Ok(()) => {
                debug!("Drv {} listen +{} ({} total)", self.driver_id, locator, candidate.len());
                *current = candidate;
                Ok(())
            },
            Err(e) => {
                self.routes.remove(locator);
                if let Err(restore) = driver
                    .listen_channels(current.clone(), self.sink_for(&current))
                    .await
                {
                    error!(
                        "Drv {} listen set restore failed after rejecting {}: {}",
                        self.driver_id, locator, restore
                    );
                }
                Err(e)
            },
        }
    }

    /// Remove `locator` from the listen set. Driver rejection is logged only.
    pub async fn remove_listen_channel(&self, driver: &Driver, locator: &ChannelLocator) {
        let mut current = self.current.lock().await;
        self.routes.remove(locator);
        let Some(pos) = current.iter().position(|l| l == locator) else {
            return;
        };
        let mut candidate = current.clone();
        candidate.remove(pos);
        if let Err(e) = driver
            .listen_channels(candidate.clone(), self.sink_for(&candidate))
            .await
        {
            warn!("Drv {} listen -{} rejected: {}", self.driver_id, locator, e);
        }
        *current = candidate;
    }

    /// Push an empty set and stop dispatching.
    pub async fn close(&self, driver: &Driver) {
        let mut current = self.current.lock().await;
        current.clear();
        self.routes.clear();
        if let Err(e) = driver.listen_channels(Vec::new(), None).await {
            let unsupported = e.driver_error().is_some_and(|d| d.is_unsupported());
            if !unsupported {
                warn!("Drv {} listen close failed: {}", self.driver_id, e);
            }
        }
        self.cancel.cancel();
    }

    fn sink_for(&self, set: &[ChannelLocator]) -> Option<Arc<dyn ChannelUpdateSink>> {
        (!set.is_empty()).then(|| Arc::clone(&self.sink))
    }
}

impl Drop for ChannelUpdateListenerList {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    driver_id: String,
    mut rx: mpsc::Receiver<Batch>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    log: Arc<LogLimiter>,
) {
    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        for container in batch {
            let channel = routes
                .get(&container.locator)
                .and_then(|weak| weak.upgrade());
            match channel {
                Some(channel) => channel.update(container.sampled_value).await,
                None => log.warn(format!(
                    "Drv {} pushed update for unknown channel {}",
                    driver_id, container.locator
                )),
            }
        }
    }
    debug!("Drv {} listen dispatch stopped", driver_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceLocator;
    use tracing_test::traced_test;

    fn batch(len: usize) -> Batch {
        let device = DeviceLocator::new("sim", "bus0", "p1");
        (0..len)
            .map(|i| SampledValueContainer::new(device.channel(format!("c{}", i))))
            .collect()
    }

    #[test]
    fn test_new_list_spawns_nothing() {
        // no runtime here, a spawn would panic
        let list = ChannelUpdateListenerList::new("sim", Arc::new(LogLimiter::default()));
        assert!(!list.is_dispatching());
        list.sink.channels_updated(batch(1));
    }

    #[test]
    #[traced_test]
    fn test_full_queue_drops_batch() {
        let list =
            ChannelUpdateListenerList::with_capacity("sim", Arc::new(LogLimiter::default()), 1);
        list.sink.channels_updated(batch(2));
        list.sink.channels_updated(batch(3));
        assert!(logs_contain("Drv sim listen queue full, dropped 3 updates"));

        let mut pending = list.pending.lock().take().unwrap();
        assert_eq!(pending.rx.try_recv().unwrap().len(), 2);
        assert!(pending.rx.try_recv().is_err());
    }
}

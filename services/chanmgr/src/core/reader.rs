//! Polling scheduler
//!
//! A [`ReaderThread`] is a tokio task owning a set of channels. Each pass it
//! collects every due channel into one batch, reads the batch through the
//! driver and feeds the results back; otherwise it sleeps until the earliest
//! due time, an external `update()` or `stop`.
//!
//! ```text
//!  ┌─────────┐   stop / cancel   ┌─────────┐
//!  │ running │ ────────────────► │ stopped │
//!  └─────────┘                   └─────────┘
//! ```
//!
//! Threads are handed out by a [`ReaderThreadFactory`]. The default keys
//! threads by device; the per-driver variant runs one loop per driver.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::Channel;
use super::driver::Driver;
use crate::error::{ChannelManagerError, Result};
use crate::log_limiter::{LogLimiter, DEFAULT_SUPPRESSION_INTERVAL_MS};
use crate::types::{ChannelLocator, DeviceLocator, SampledValueContainer};
use crate::utils::now_millis;

/// Default bound on how long `stop` waits for a loop to exit
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 2000;

/// Tunables shared by all reader threads of a factory
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    pub stop_timeout: Duration,
    pub log_interval: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            log_interval: Duration::from_millis(DEFAULT_SUPPRESSION_INTERVAL_MS),
        }
    }
}

/// Grouping key of a reader thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReaderKey {
    Device(DeviceLocator),
    Driver(String),
}

impl std::fmt::Display for ReaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderKey::Device(device) => write!(f, "{}", device),
            ReaderKey::Driver(driver_id) => write!(f, "{}", driver_id),
        }
    }
}

/// Background polling loop for a group of channels
pub struct ReaderThread {
    key: ReaderKey,
    driver_id: String,
    driver: Weak<Driver>,
    channels: Mutex<HashMap<ChannelLocator, Arc<Channel>>>,
    wake: Notify,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    factory: Weak<dyn ReaderThreadFactory>,
    log: LogLimiter,
}

impl std::fmt::Debug for ReaderThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderThread")
            .field("key", &self.key)
            .field("channels", &self.channel_count())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ReaderThread {
    /// Create and start the loop.
    fn spawn(
        key: ReaderKey,
        driver_id: String,
        driver: Weak<Driver>,
        factory: Weak<dyn ReaderThreadFactory>,
        settings: ReaderSettings,
    ) -> Arc<Self> {
        let reader = Arc::new(Self {
            key,
            driver_id,
            driver,
            channels: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            factory,
            log: LogLimiter::new(settings.log_interval),
        });
        let handle = tokio::spawn(Arc::clone(&reader).run());
        *reader.handle.lock() = Some(handle);
        debug!("Reader {} started", reader.key);
        reader
    }

    pub fn key(&self) -> &ReaderKey {
        &self.key
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Assign a channel. Does not wake the loop; callers follow up with
    /// [`update`](Self::update) once the configuration is in place.
    pub fn add(&self, channel: &Arc<Channel>) -> Result<()> {
        if !self.serves(channel) {
            return Err(ChannelManagerError::internal(format!(
                "Reader {} serves another instance of driver {}, not the one owning {}",
                self.key,
                self.driver_id,
                channel.locator()
            )));
        }
        self.channels
            .lock()
            .insert(channel.locator().clone(), Arc::clone(channel));
        Ok(())
    }

    /// Whether `channel` belongs to the driver instance this loop reads
    /// through. A driver re-registered under the same id is a different
    /// instance.
    pub fn serves(&self, channel: &Channel) -> bool {
        channel.driver_id() == self.driver_id && Weak::ptr_eq(&channel.driver_handle(), &self.driver)
    }

    /// Unassign a channel; the last removal hands the thread back to its
    /// factory.
    pub fn remove(&self, locator: &ChannelLocator) {
        let now_empty = {
            let mut channels = self.channels.lock();
            channels.remove(locator).is_some() && channels.is_empty()
        };
        if now_empty {
            if let Some(factory) = self.factory.upgrade() {
                factory.no_channels(self);
            }
        }
    }

    /// Recompute the wake-up time.
    pub fn update(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait at most `timeout` for it to exit.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        let Some(mut handle) = handle else {
            return;
        };
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("Reader {} did not stop within {:?}", self.key, timeout);
            handle.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let channels: Vec<Arc<Channel>> = self.channels.lock().values().cloned().collect();

            let now = now_millis();
            let mut batch = Vec::new();
            let mut min_wait: Option<u64> = None;
            for channel in &channels {
                if let Some(wait) = channel.update_sampling_time(now, &mut batch).await {
                    min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
                }
            }

            if !batch.is_empty() {
                self.read_batch(batch).await;
                continue;
            }

            match min_wait {
                Some(wait) => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.wake.notified() => {},
                        () = tokio::time::sleep(Duration::from_millis(wait)) => {},
                    }
                },
                None => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = self.wake.notified() => {},
                    }
                },
            }
        }
        debug!("Reader {} stopped", self.key);
    }

    async fn read_batch(&self, batch: Vec<ChannelLocator>) {
        let Some(driver) = self.driver.upgrade() else {
            return;
        };
        let mut seen = HashSet::with_capacity(batch.len());
        let mut containers: Vec<SampledValueContainer> = batch
            .into_iter()
            .filter(|locator| seen.insert(locator.clone()))
            .map(SampledValueContainer::new)
            .collect();

        if let Err(e) = driver.read_channels(&mut containers).await {
            self.log
                .warn(format!("Reader {} read failed: {}", self.key, e));
            return;
        }

        for container in containers {
            let channel = self.channels.lock().get(&container.locator).cloned();
            if let Some(channel) = channel {
                channel.update(container.sampled_value).await;
            }
        }
    }
}

/// Hands out reader threads to polled channels
#[async_trait]
pub trait ReaderThreadFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Find or create the thread for `channel` and assign the channel to it.
    fn attach(&self, channel: &Arc<Channel>) -> Result<Arc<ReaderThread>>;

    /// Called by a thread whose channel set became empty.
    fn no_channels(&self, reader: &ReaderThread);

    fn active_threads(&self) -> usize;

    /// Stop every thread.
    async fn shutdown(&self);
}

type KeyFn = fn(&ChannelLocator) -> ReaderKey;

/// Factory creating one thread per key, lazily, and tearing it down when
/// its channel set empties
pub struct KeyedReaderThreadFactory {
    name: &'static str,
    key_of: KeyFn,
    settings: ReaderSettings,
    threads: Mutex<HashMap<ReaderKey, Arc<ReaderThread>>>,
    this: Weak<KeyedReaderThreadFactory>,
}

impl KeyedReaderThreadFactory {
    /// One thread per device (default)
    pub fn per_device(settings: ReaderSettings) -> Arc<Self> {
        Self::with_key("per_device", |l| ReaderKey::Device(l.device().clone()), settings)
    }

    /// One thread per driver
    pub fn per_driver(settings: ReaderSettings) -> Arc<Self> {
        Self::with_key(
            "per_driver",
            |l| ReaderKey::Driver(l.driver_id().to_string()),
            settings,
        )
    }

    fn with_key(name: &'static str, key_of: KeyFn, settings: ReaderSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            key_of,
            settings,
            threads: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> ReaderSettings {
        self.settings
    }
}

#[async_trait]
impl ReaderThreadFactory for KeyedReaderThreadFactory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn attach(&self, channel: &Arc<Channel>) -> Result<Arc<ReaderThread>> {
        let key = (self.key_of)(channel.locator());
        let mut threads = self.threads.lock();
        let reader = match threads.get(&key) {
            Some(reader) if !reader.is_stopped() && reader.serves(channel) => Arc::clone(reader),
            previous => {
                if let Some(previous) = previous {
                    debug!("Reader {} replaced", previous.key());
                }
                let factory: Weak<dyn ReaderThreadFactory> = self.this.clone();
                let reader = ReaderThread::spawn(
                    key.clone(),
                    channel.driver_id().to_string(),
                    channel.driver_handle(),
                    factory,
                    self.settings,
                );
                threads.insert(key, Arc::clone(&reader));
                reader
            },
        };
        reader.add(channel)?;
        Ok(reader)
    }

    fn no_channels(&self, reader: &ReaderThread) {
        let removed = {
            let mut threads = self.threads.lock();
            // an attach may have raced in after the last removal
            if reader.channel_count() > 0 {
                return;
            }
            match threads.get(reader.key()) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), reader) => {
                    threads.remove(reader.key())
                },
                _ => None,
            }
        };
        let Some(reader) = removed else {
            // replaced under the same key, no longer reachable from the map
            reader.request_stop();
            return;
        };
        reader.request_stop();
        let timeout = self.settings.stop_timeout;
        tokio::spawn(async move { reader.stop(timeout).await });
    }

    fn active_threads(&self) -> usize {
        self.threads.lock().len()
    }

    async fn shutdown(&self) {
        let readers: Vec<Arc<ReaderThread>> =
            self.threads.lock().drain().map(|(_, r)| r).collect();
        for reader in readers {
            reader.stop(self.settings.stop_timeout).await;
        }
    }
}

/// Factory kind selectable per driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderFactoryKind {
    #[default]
    PerDevice,
    PerDriver,
}

/// Shared factory instances plus the per-driver selection
pub struct ReaderThreadFactories {
    per_device: Arc<KeyedReaderThreadFactory>,
    per_driver: Arc<KeyedReaderThreadFactory>,
    default_kind: ReaderFactoryKind,
    overrides: HashMap<String, ReaderFactoryKind>,
}

impl Default for ReaderThreadFactories {
    fn default() -> Self {
        Self::new(ReaderSettings::default(), ReaderFactoryKind::default(), HashMap::new())
    }
}

impl ReaderThreadFactories {
    pub fn new(
        settings: ReaderSettings,
        default_kind: ReaderFactoryKind,
        overrides: HashMap<String, ReaderFactoryKind>,
    ) -> Self {
        Self {
            per_device: KeyedReaderThreadFactory::per_device(settings),
            per_driver: KeyedReaderThreadFactory::per_driver(settings),
            default_kind,
            overrides,
        }
    }

    pub fn get(&self, kind: ReaderFactoryKind) -> Arc<dyn ReaderThreadFactory> {
        match kind {
            ReaderFactoryKind::PerDevice => self.per_device.clone(),
            ReaderFactoryKind::PerDriver => self.per_driver.clone(),
        }
    }

    /// Factory for `driver_id`: override first, then the global default.
    pub fn for_driver(&self, driver_id: &str) -> Arc<dyn ReaderThreadFactory> {
        let kind = self
            .overrides
            .get(driver_id)
            .copied()
            .unwrap_or(self.default_kind);
        self.get(kind)
    }

    pub fn active_threads(&self) -> usize {
        self.per_device.active_threads() + self.per_driver.active_threads()
    }

    pub async fn shutdown(&self) {
        self.per_device.shutdown().await;
        self.per_driver.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selection() {
        let mut overrides = HashMap::new();
        overrides.insert("mbus".to_string(), ReaderFactoryKind::PerDriver);
        let factories =
            ReaderThreadFactories::new(ReaderSettings::default(), ReaderFactoryKind::PerDevice, overrides);
        assert_eq!(factories.for_driver("modbus").name(), "per_device");
        assert_eq!(factories.for_driver("mbus").name(), "per_driver");
    }

    #[test]
    fn test_factory_kind_serde_names() {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            kind: ReaderFactoryKind,
        }
        let w: Wrapper = figment::Figment::from(figment::providers::Serialized::defaults(
            std::collections::BTreeMap::from([("kind", "per_driver")]),
        ))
        .extract()
        .unwrap();
        assert_eq!(w.kind, ReaderFactoryKind::PerDriver);
    }

    #[test]
    fn test_reader_key_display() {
        let device = DeviceLocator::new("sim", "bus0", "p1");
        assert_eq!(ReaderKey::Device(device.clone()).to_string(), device.to_string());
        assert_eq!(ReaderKey::Driver("sim".into()).to_string(), "sim");
    }

    #[tokio::test]
    async fn test_empty_reader_stops_on_request() {
        let factory = KeyedReaderThreadFactory::per_device(ReaderSettings::default());
        let weak: Weak<dyn ReaderThreadFactory> = Arc::downgrade(&factory) as Weak<dyn ReaderThreadFactory>;
        let reader = ReaderThread::spawn(
            ReaderKey::Driver("sim".into()),
            "sim".into(),
            Weak::new(),
            weak,
            ReaderSettings::default(),
        );
        assert!(!reader.is_stopped());
        reader.update();
        reader.stop(Duration::from_secs(1)).await;
        assert!(reader.is_stopped());
        assert!(reader.handle.lock().is_none());
    }
}

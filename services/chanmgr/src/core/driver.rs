//! Driver: one protocol driver instance plus everything opened on it
//!
//! Owns the channel table, the listen set, device listeners and running
//! scans. Closing a driver tears all of them down; it is the unit of
//! teardown when a driver is removed or the manager shuts down.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

use super::channel::Channel;
use super::configuration::{Configuration, ConfigurationKey};
use super::device_listeners::DeviceListenerList;
use super::listen::ChannelUpdateListenerList;
use super::reader::ReaderThreadFactory;
use super::scan::{ChannelScanKey, ChannelScanner, DeviceScanList, DeviceScanner, ScanKey};
use crate::error::{ChannelManagerError, Result};
use crate::listener::{ChannelScanListener, DeviceListener, DeviceScanListener};
use crate::log_limiter::LogLimiter;
use crate::spi::{ChannelDriver, ChannelUpdateSink};
use crate::types::{
    AppId, ChannelLocator, DeviceLocator, SampledValueContainer, Sampling, ValueContainer,
};

/// Manager-side wrapper of one [`ChannelDriver`]
pub struct Driver {
    id: String,
    description: String,
    spi: RwLock<Option<Arc<dyn ChannelDriver>>>,
    channels: DashMap<ChannelLocator, Arc<Channel>>,
    /// Orders channel insertion against `close`
    table_lock: Mutex<()>,
    closed: AtomicBool,
    listen: ChannelUpdateListenerList,
    device_listeners: DeviceListenerList,
    scans: DeviceScanList,
    reader_factory: Arc<dyn ReaderThreadFactory>,
    read_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    this: Weak<Driver>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.id)
            .field("channels", &self.channels.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Driver {
    pub fn new(
        spi: Arc<dyn ChannelDriver>,
        reader_factory: Arc<dyn ReaderThreadFactory>,
        log_interval: Duration,
    ) -> Arc<Self> {
        let id = spi.driver_id().to_string();
        let description = spi.description().to_string();
        info!("Drv {} registered ({} readers)", id, reader_factory.name());
        Arc::new_cyclic(|this| Self {
            listen: ChannelUpdateListenerList::new(id.clone(), Arc::new(LogLimiter::new(log_interval))),
            device_listeners: DeviceListenerList::new(id.clone()),
            scans: DeviceScanList::new(id.clone()),
            id,
            description,
            spi: RwLock::new(Some(spi)),
            channels: DashMap::new(),
            table_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            reader_factory,
            read_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn reader_factory(&self) -> &Arc<dyn ReaderThreadFactory> {
        &self.reader_factory
    }

    pub(crate) fn listen_list(&self) -> &ChannelUpdateListenerList {
        &self.listen
    }

    pub fn scans(&self) -> &DeviceScanList {
        &self.scans
    }

    pub fn device_listener_count(&self) -> usize {
        self.device_listeners.len()
    }

    fn spi(&self) -> Result<Arc<dyn ChannelDriver>> {
        self.spi.read().clone().ok_or_else(|| {
            ChannelManagerError::invalid_state(format!("Driver {} is closed", self.id))
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelManagerError::invalid_state(format!(
                "Driver {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel table
    // ------------------------------------------------------------------

    pub fn channel(&self, locator: &ChannelLocator) -> Option<Arc<Channel>> {
        self.channels.get(locator).map(|c| Arc::clone(c.value()))
    }

    /// Snapshot of the channel table
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Open (or reuse) the configuration for `key`.
    ///
    /// The channel is inserted under the table lock but configured outside
    /// it; a channel that closed in between is evicted and the insert
    /// retried.
    pub async fn add_configuration(&self, key: ConfigurationKey) -> Result<Arc<Configuration>> {
        if key.locator.driver_id() != self.id {
            return Err(ChannelManagerError::argument(format!(
                "Locator {} does not belong to driver {}",
                key.locator, self.id
            )));
        }
        if !key.sampling.is_valid() {
            return Err(ChannelManagerError::argument(format!(
                "Sampling {:?} of {} exceeds {} ms",
                key.sampling,
                key.locator,
                Sampling::MAX_PERIOD_MS
            )));
        }
        loop {
            let channel = {
                let _guard = self.table_lock.lock();
                self.ensure_open()?;
                match self.channels.entry(key.locator.clone()) {
                    Entry::Occupied(entry) => Arc::clone(entry.get()),
                    Entry::Vacant(entry) => {
                        let channel = Channel::new(key.locator.clone(), self.this.clone());
                        entry.insert(Arc::clone(&channel));
                        channel
                    },
                }
            };
            match channel.add_configuration(key.clone()).await {
                Err(e) if e.is_retryable() => {
                    debug!("Drv {} retrying open of {}", self.id, key.locator);
                    self.channels
                        .remove_if(&key.locator, |_, c| Arc::ptr_eq(c, &channel));
                },
                result => return result,
            }
        }
    }

    /// Returns `Ok(false)` if the channel exists but not the configuration.
    pub async fn remove_configuration(&self, configuration: &Configuration) -> Result<bool> {
        let locator = configuration.locator();
        let channel = self
            .channel(locator)
            .ok_or_else(|| ChannelManagerError::channel_not_found(locator))?;
        Ok(channel.remove_configuration(configuration).await)
    }

    pub async fn get_configuration(&self, key: &ConfigurationKey) -> Result<Arc<Configuration>> {
        let channel = self
            .channel(&key.locator)
            .ok_or_else(|| ChannelManagerError::channel_not_found(&key.locator))?;
        channel
            .get_configuration(key)
            .await
            .ok_or_else(|| ChannelManagerError::not_found(format!("Configuration {:?}", key)))
    }

    /// Every open configuration of this driver
    pub async fn configurations(&self) -> Vec<Arc<Configuration>> {
        let mut all = Vec::new();
        for channel in self.channels() {
            all.extend(channel.configurations().await);
        }
        all
    }

    pub(crate) fn on_channel_added(&self, locator: &ChannelLocator) {
        debug!("Drv {} +ch {}", self.id, locator);
        if let Ok(spi) = self.spi() {
            spi.channel_added(locator);
        }
    }

    pub(crate) fn on_channel_removed(&self, channel: &Channel) {
        let locator = channel.locator();
        self.channels
            .remove_if(locator, |_, c| std::ptr::eq(Arc::as_ptr(c), channel));
        debug!("Drv {} -ch {}", self.id, locator);
        if let Ok(spi) = self.spi() {
            spi.channel_removed(locator);
        }
    }

    // ------------------------------------------------------------------
    // I/O, serialized per direction
    // ------------------------------------------------------------------

    pub async fn read_channels(&self, batch: &mut [SampledValueContainer]) -> Result<()> {
        let spi = self.spi()?;
        let _guard = self.read_lock.lock().await;
        spi.read_channels(batch)
            .await
            .map_err(|e| ChannelManagerError::driver(&self.id, e))
    }

    pub async fn write_channels(&self, batch: &[ValueContainer]) -> Result<()> {
        let spi = self.spi()?;
        let _guard = self.write_lock.lock().await;
        spi.write_channels(batch)
            .await
            .map_err(|e| ChannelManagerError::driver(&self.id, e))
    }

    pub(crate) async fn listen_channels(
        &self,
        channels: Vec<ChannelLocator>,
        sink: Option<Arc<dyn ChannelUpdateSink>>,
    ) -> Result<()> {
        let spi = self.spi()?;
        spi.listen_channels(channels, sink)
            .await
            .map_err(|e| ChannelManagerError::driver(&self.id, e))
    }

    pub async fn get_channel_list(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>> {
        let spi = self.spi()?;
        spi.get_channel_list(device)
            .await
            .map_err(|e| ChannelManagerError::driver(&self.id, e))
    }

    // ------------------------------------------------------------------
    // Discovery and device listeners
    // ------------------------------------------------------------------

    pub async fn start_device_scan(
        &self,
        key: ScanKey,
        listener: Option<Arc<dyn DeviceScanListener>>,
    ) -> Result<Arc<DeviceScanner>> {
        self.ensure_open()?;
        let spi = self.spi()?;
        self.scans.start_device_scan(spi.as_ref(), key, listener).await
    }

    pub async fn abort_device_scan(&self, key: &ScanKey) -> bool {
        let spi = self.spi.read().clone();
        self.scans.abort_device_scan(spi.as_deref(), key).await
    }

    pub async fn start_channel_scan(
        &self,
        key: ChannelScanKey,
        listener: Option<Arc<dyn ChannelScanListener>>,
    ) -> Result<Arc<ChannelScanner>> {
        self.ensure_open()?;
        let spi = self.spi()?;
        self.scans.start_channel_scan(spi.as_ref(), key, listener).await
    }

    pub fn abort_channel_scan(&self, key: &ChannelScanKey) -> bool {
        self.scans.abort_channel_scan(key)
    }

    pub fn add_device_listener(&self, app: &AppId, listener: Arc<dyn DeviceListener>) -> Result<bool> {
        self.ensure_open()?;
        let spi = self.spi()?;
        self.device_listeners.add(spi.as_ref(), app, listener)
    }

    pub fn remove_device_listener(&self, app: &AppId, listener: &Arc<dyn DeviceListener>) -> bool {
        let spi = self.spi.read().clone();
        self.device_listeners.remove(spi.as_deref(), app, listener)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove everything `app` owns on this driver.
    pub async fn remove_app_id(&self, app: &AppId) {
        let spi = self.spi.read().clone();
        let scans = self.scans.abort_for_app(spi.as_deref(), app).await;
        let listeners = self.device_listeners.remove_for_app(spi.as_deref(), app);
        let mut configurations = 0;
        for channel in self.channels() {
            configurations += channel.remove_configurations_for_app(app).await;
        }
        debug!(
            "Drv {} app {} removed: {} scans, {} listeners, {} configurations",
            self.id, app, scans, listeners, configurations
        );
    }

    /// Close the driver. Idempotent.
    pub async fn close(&self) {
        {
            let _guard = self.table_lock.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let spi = self.spi.read().clone();
        self.scans.close(spi.as_deref()).await;
        self.device_listeners.clear(spi.as_deref());
        for channel in self.channels() {
            channel.close().await;
        }
        self.channels.clear();
        self.listen.close(self).await;
        *self.spi.write() = None;
        info!("Drv {} closed", self.id);
    }
}

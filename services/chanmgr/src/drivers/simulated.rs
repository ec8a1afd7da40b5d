//! In-memory driver
//!
//! Serves values from a map, accepts writes into the same map and supports
//! every optional SPI operation. Failures and scan timing can be scripted,
//! and call counters make the manager's traffic observable.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::listener::{ChannelScanListener, DeviceListener, DeviceScanListener};
use crate::spi::{ChannelDriver, ChannelUpdateSink, DriverError, DriverResult};
use crate::types::{
    ChannelLocator, DeviceLocator, SampledValue, SampledValueContainer, Value, ValueContainer,
};

/// Call counters
#[derive(Debug, Default)]
pub struct SimulatedStats {
    /// `read_channels` invocations
    pub read_calls: AtomicUsize,
    /// Channels requested over all reads
    pub channels_read: AtomicUsize,
    pub write_calls: AtomicUsize,
    pub listen_calls: AtomicUsize,
    pub aborted_scans: AtomicUsize,
}

type PendingDeviceScan = (String, Option<String>, Arc<dyn DeviceScanListener>);

/// Simulated protocol driver
pub struct SimulatedDriver {
    id: String,
    values: RwLock<HashMap<ChannelLocator, Value>>,
    fail_reads: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    reject_listen: Mutex<HashSet<ChannelLocator>>,
    listen_set: Mutex<Vec<ChannelLocator>>,
    sink: Mutex<Option<Arc<dyn ChannelUpdateSink>>>,
    devices: Mutex<HashMap<String, Vec<DeviceLocator>>>,
    channel_lists: Mutex<HashMap<DeviceLocator, Vec<ChannelLocator>>>,
    hold_scans: AtomicBool,
    pending_device_scans: Mutex<Vec<PendingDeviceScan>>,
    device_listeners: Mutex<Vec<Arc<dyn DeviceListener>>>,
    added: Mutex<Vec<ChannelLocator>>,
    removed: Mutex<Vec<ChannelLocator>>,
    batches: Mutex<Vec<Vec<ChannelLocator>>>,
    pub stats: SimulatedStats,
}

impl SimulatedDriver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: RwLock::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            read_delay: Mutex::new(None),
            reject_listen: Mutex::new(HashSet::new()),
            listen_set: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            devices: Mutex::new(HashMap::new()),
            channel_lists: Mutex::new(HashMap::new()),
            hold_scans: AtomicBool::new(false),
            pending_device_scans: Mutex::new(Vec::new()),
            device_listeners: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            stats: SimulatedStats::default(),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn set_value(&self, locator: &ChannelLocator, value: impl Into<Value>) {
        self.values.write().insert(locator.clone(), value.into());
    }

    pub fn value(&self, locator: &ChannelLocator) -> Option<Value> {
        self.values.read().get(locator).cloned()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Make any listen set containing `locator` fail.
    pub fn reject_listen(&self, locator: &ChannelLocator) {
        self.reject_listen.lock().insert(locator.clone());
    }

    /// Devices reported by scans on `interface_id`.
    pub fn set_devices(&self, interface_id: &str, devices: Vec<DeviceLocator>) {
        self.devices.lock().insert(interface_id.to_string(), devices);
    }

    pub fn set_channel_list(&self, device: &DeviceLocator, channels: Vec<ChannelLocator>) {
        self.channel_lists.lock().insert(device.clone(), channels);
    }

    /// Keep device scans open until [`finish_held_scans`](Self::finish_held_scans).
    pub fn set_hold_scans(&self, hold: bool) {
        self.hold_scans.store(hold, Ordering::SeqCst);
    }

    /// Complete every held device scan; returns how many.
    pub fn finish_held_scans(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_device_scans.lock());
        for (interface_id, filter, listener) in &pending {
            self.report_devices(interface_id, filter.as_deref(), listener.as_ref());
        }
        pending.len()
    }

    /// Push a value for a listened channel. Returns `false` if the channel
    /// is not in the current listen set.
    pub fn push(&self, locator: &ChannelLocator, value: impl Into<Value>) -> bool {
        let value = value.into();
        self.values.write().insert(locator.clone(), value.clone());
        if !self.listen_set.lock().contains(locator) {
            return false;
        }
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.channels_updated(vec![SampledValueContainer::with_value(
                    locator.clone(),
                    SampledValue::good(value),
                )]);
                true
            },
            None => false,
        }
    }

    pub fn attach_device(&self, device: &DeviceLocator) {
        let listeners = self.device_listeners.lock().clone();
        for listener in listeners {
            listener.device_added(device);
        }
    }

    pub fn detach_device(&self, device: &DeviceLocator) {
        let listeners = self.device_listeners.lock().clone();
        for listener in listeners {
            listener.device_removed(device);
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn listen_set(&self) -> Vec<ChannelLocator> {
        self.listen_set.lock().clone()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn added_channels(&self) -> Vec<ChannelLocator> {
        self.added.lock().clone()
    }

    pub fn removed_channels(&self) -> Vec<ChannelLocator> {
        self.removed.lock().clone()
    }

    /// Every batch passed to `read_channels`, in call order
    pub fn read_batches(&self) -> Vec<Vec<ChannelLocator>> {
        self.batches.lock().clone()
    }

    pub fn device_listener_count(&self) -> usize {
        self.device_listeners.lock().len()
    }

    pub fn pending_scans(&self) -> usize {
        self.pending_device_scans.lock().len()
    }

    fn report_devices(
        &self,
        interface_id: &str,
        filter: Option<&str>,
        listener: &dyn DeviceScanListener,
    ) {
        let devices = self.devices.lock().get(interface_id).cloned();
        let Some(devices) = devices else {
            let error = DriverError::Io(format!("No such interface: {}", interface_id));
            listener.finished(false, Some(&error));
            return;
        };
        let matching: Vec<&DeviceLocator> = devices
            .iter()
            .filter(|d| filter.map_or(true, |f| d.device_address().contains(f)))
            .collect();
        let total = matching.len().max(1) as f32;
        for (i, device) in matching.iter().enumerate() {
            listener.device_found(device);
            listener.progress((i + 1) as f32 / total);
        }
        listener.finished(true, None);
    }
}

#[async_trait]
impl ChannelDriver for SimulatedDriver {
    fn driver_id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "Simulated in-memory driver"
    }

    async fn read_channels(&self, channels: &mut [SampledValueContainer]) -> DriverResult<()> {
        self.stats.read_calls.fetch_add(1, Ordering::SeqCst);
        self.stats
            .channels_read
            .fetch_add(channels.len(), Ordering::SeqCst);
        self.batches
            .lock()
            .push(channels.iter().map(|c| c.locator.clone()).collect());

        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(DriverError::Io("simulated read failure".to_string()));
        }

        let values = self.values.read();
        for container in channels.iter_mut() {
            container.sampled_value = Some(match values.get(&container.locator) {
                Some(value) => SampledValue::good(value.clone()),
                None => SampledValue::bad(),
            });
        }
        Ok(())
    }

    async fn write_channels(&self, values: &[ValueContainer]) -> DriverResult<()> {
        self.stats.write_calls.fetch_add(1, Ordering::SeqCst);
        let mut map = self.values.write();
        for container in values {
            map.insert(container.locator.clone(), container.value.clone());
        }
        Ok(())
    }

    async fn listen_channels(
        &self,
        channels: Vec<ChannelLocator>,
        sink: Option<Arc<dyn ChannelUpdateSink>>,
    ) -> DriverResult<()> {
        self.stats.listen_calls.fetch_add(1, Ordering::SeqCst);
        {
            let rejected = self.reject_listen.lock();
            if let Some(bad) = channels.iter().find(|c| rejected.contains(c)) {
                return Err(DriverError::Protocol(format!("Cannot listen to {}", bad)));
            }
        }
        debug!("Sim {} listen set: {} channels", self.id, channels.len());
        *self.listen_set.lock() = channels;
        *self.sink.lock() = sink;
        Ok(())
    }

    async fn start_device_scan(
        &self,
        interface_id: &str,
        filter: Option<&str>,
        listener: Arc<dyn DeviceScanListener>,
    ) -> DriverResult<()> {
        if self.hold_scans.load(Ordering::SeqCst) {
            self.pending_device_scans.lock().push((
                interface_id.to_string(),
                filter.map(str::to_string),
                listener,
            ));
            return Ok(());
        }
        self.report_devices(interface_id, filter, listener.as_ref());
        Ok(())
    }

    async fn abort_device_scan(&self, interface_id: &str, filter: Option<&str>) -> DriverResult<()> {
        self.stats.aborted_scans.fetch_add(1, Ordering::SeqCst);
        self.pending_device_scans
            .lock()
            .retain(|(i, f, _)| !(i == interface_id && f.as_deref() == filter));
        Ok(())
    }

    async fn start_channel_scan(
        &self,
        device: &DeviceLocator,
        listener: Arc<dyn ChannelScanListener>,
    ) -> DriverResult<()> {
        let channels = self.channel_lists.lock().get(device).cloned().unwrap_or_default();
        for channel in &channels {
            listener.channel_found(channel);
        }
        listener.finished(true, None);
        Ok(())
    }

    async fn get_channel_list(&self, device: &DeviceLocator) -> DriverResult<Vec<ChannelLocator>> {
        Ok(self.channel_lists.lock().get(device).cloned().unwrap_or_default())
    }

    fn channel_added(&self, locator: &ChannelLocator) {
        self.added.lock().push(locator.clone());
    }

    fn channel_removed(&self, locator: &ChannelLocator) {
        self.removed.lock().push(locator.clone());
    }

    fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) -> DriverResult<()> {
        self.device_listeners.lock().push(listener);
        Ok(())
    }

    fn remove_device_listener(&self, listener: &Arc<dyn DeviceListener>) -> DriverResult<()> {
        self.device_listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
        Ok(())
    }
}

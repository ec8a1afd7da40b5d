//! Device and channel scan bookkeeping
//!
//! A scanner wraps the application's scan listener: it records results,
//! isolates the driver from panicking callbacks, lets a caller block until
//! the scan finishes and supports cooperative abort. Running scans are
//! tracked per driver so an app or driver teardown can abort them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ChannelManagerError, Result};
use crate::listener::{ChannelScanListener, DeviceScanListener};
use crate::spi::{ChannelDriver, DriverError};
use crate::types::{AppId, ChannelLocator, DeviceLocator};
use crate::utils::guard_callback;

/// Identity of a running device scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScanKey {
    pub interface_id: String,
    pub filter: Option<String>,
    pub app: AppId,
}

impl ScanKey {
    pub fn new(interface_id: impl Into<String>, filter: Option<&str>, app: AppId) -> Self {
        Self {
            interface_id: interface_id.into(),
            filter: filter.map(str::to_string),
            app,
        }
    }
}

/// Identity of a running channel scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelScanKey {
    pub device: DeviceLocator,
    pub app: AppId,
}

/// Lifecycle of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Running,
    Finished {
        success: bool,
        error: Option<String>,
    },
    Aborted,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanState::Running)
    }
}

/// Results, state and listener shared by both scanner kinds
struct ScanProgress<L: ?Sized, T> {
    listener: Mutex<Option<Arc<L>>>,
    found: Mutex<Vec<T>>,
    state: watch::Sender<ScanState>,
}

impl<L: ?Sized, T: Clone> ScanProgress<L, T> {
    fn new(listener: Option<Arc<L>>) -> Self {
        Self {
            listener: Mutex::new(listener),
            found: Mutex::new(Vec::new()),
            state: watch::channel(ScanState::Running).0,
        }
    }

    fn state(&self) -> ScanState {
        self.state.borrow().clone()
    }

    /// Listener to notify, if the scan is still running.
    fn listener(&self) -> Option<Arc<L>> {
        if self.state.borrow().is_terminal() {
            return None;
        }
        self.listener.lock().clone()
    }

    fn record(&self, item: &T) -> Option<Arc<L>> {
        if self.state.borrow().is_terminal() {
            return None;
        }
        self.found.lock().push(item.clone());
        self.listener.lock().clone()
    }

    fn found(&self) -> Vec<T> {
        self.found.lock().clone()
    }

    /// Move to `next` if still running. On success returns the released
    /// listener (if any) wrapped in `Some`.
    fn terminate(&self, next: ScanState) -> Option<Option<Arc<L>>> {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next;
            true
        });
        changed.then(|| self.listener.lock().take())
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<ScanState> {
        let mut rx = self.state.subscribe();
        let wait = async {
            rx.wait_for(ScanState::is_terminal)
                .await
                .map(|state| state.clone())
                .map_err(|_| ChannelManagerError::internal("Scan state dropped"))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ChannelManagerError::Timeout(format!("Scan not finished within {:?}", limit)))?,
            None => wait.await,
        }
    }
}

/// Registry of running scans of one kind
struct ScanTable<K, S> {
    entries: Mutex<HashMap<K, Arc<S>>>,
}

impl<K: Eq + Hash + Clone, S> ScanTable<K, S> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn insert_new(&self, key: K, scanner: Arc<S>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, scanner);
        true
    }

    fn remove_if_same(&self, key: &K, scanner: &S) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), scanner) => {
                entries.remove(key);
                true
            },
            _ => false,
        }
    }

    fn remove(&self, key: &K) -> Option<Arc<S>> {
        self.entries.lock().remove(key)
    }

    fn take_where(&self, mut pred: impl FnMut(&K) -> bool) -> Vec<(K, Arc<S>)> {
        let mut entries = self.entries.lock();
        let keys: Vec<K> = entries.keys().filter(|k| pred(k)).cloned().collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k).map(|s| (k, s)))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Wrapper handed to the driver for one device scan
pub struct DeviceScanner {
    key: ScanKey,
    progress: ScanProgress<dyn DeviceScanListener, DeviceLocator>,
    table: Weak<ScanTable<ScanKey, DeviceScanner>>,
}

impl std::fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DeviceScanner {
    pub fn key(&self) -> &ScanKey {
        &self.key
    }

    pub fn state(&self) -> ScanState {
        self.progress.state()
    }

    /// Devices reported so far
    pub fn devices(&self) -> Vec<DeviceLocator> {
        self.progress.found()
    }

    /// Cancel the scan and release the listener. Idempotent.
    pub fn abort(&self) -> bool {
        let aborted = self.progress.terminate(ScanState::Aborted).is_some();
        if aborted {
            self.unregister();
        }
        aborted
    }

    /// Wait for `finished` or `abort`, at most `timeout` if given.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> Result<ScanState> {
        self.progress.wait(timeout).await
    }

    fn unregister(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove_if_same(&self.key, self);
        }
    }
}

impl DeviceScanListener for DeviceScanner {
    fn device_found(&self, device: &DeviceLocator) {
        if let Some(listener) = self.progress.record(device) {
            guard_callback("device_found", || listener.device_found(device));
        }
    }

    fn progress(&self, ratio: f32) {
        if let Some(listener) = self.progress.listener() {
            guard_callback("device_scan_progress", || listener.progress(ratio));
        }
    }

    fn finished(&self, success: bool, error: Option<&DriverError>) {
        let next = ScanState::Finished {
            success,
            error: error.map(ToString::to_string),
        };
        let Some(listener) = self.progress.terminate(next) else {
            return;
        };
        self.unregister();
        if let Some(listener) = listener {
            guard_callback("device_scan_finished", || listener.finished(success, error));
        }
    }
}

/// Wrapper handed to the driver for one channel scan
pub struct ChannelScanner {
    key: ChannelScanKey,
    progress: ScanProgress<dyn ChannelScanListener, ChannelLocator>,
    table: Weak<ScanTable<ChannelScanKey, ChannelScanner>>,
}

impl ChannelScanner {
    pub fn key(&self) -> &ChannelScanKey {
        &self.key
    }

    pub fn state(&self) -> ScanState {
        self.progress.state()
    }

    pub fn channels(&self) -> Vec<ChannelLocator> {
        self.progress.found()
    }

    pub fn abort(&self) -> bool {
        let aborted = self.progress.terminate(ScanState::Aborted).is_some();
        if aborted {
            self.unregister();
        }
        aborted
    }

    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> Result<ScanState> {
        self.progress.wait(timeout).await
    }

    fn unregister(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove_if_same(&self.key, self);
        }
    }
}

impl ChannelScanListener for ChannelScanner {
    fn channel_found(&self, channel: &ChannelLocator) {
        if let Some(listener) = self.progress.record(channel) {
            guard_callback("channel_found", || listener.channel_found(channel));
        }
    }

    fn progress(&self, ratio: f32) {
        if let Some(listener) = self.progress.listener() {
            guard_callback("channel_scan_progress", || listener.progress(ratio));
        }
    }

    fn finished(&self, success: bool, error: Option<&DriverError>) {
        let next = ScanState::Finished {
            success,
            error: error.map(ToString::to_string),
        };
        let Some(listener) = self.progress.terminate(next) else {
            return;
        };
        self.unregister();
        if let Some(listener) = listener {
            guard_callback("channel_scan_finished", || listener.finished(success, error));
        }
    }
}

/// Running device and channel scans of one driver
pub struct DeviceScanList {
    driver_id: String,
    device_scans: Arc<ScanTable<ScanKey, DeviceScanner>>,
    channel_scans: Arc<ScanTable<ChannelScanKey, ChannelScanner>>,
}

impl DeviceScanList {
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: driver_id.into(),
            device_scans: ScanTable::new(),
            channel_scans: ScanTable::new(),
        }
    }

    pub fn active_device_scans(&self) -> usize {
        self.device_scans.len()
    }

    pub fn active_channel_scans(&self) -> usize {
        self.channel_scans.len()
    }

    /// Register and start a device scan. A scan with the same key already
    /// running is an I/O error.
    pub async fn start_device_scan(
        &self,
        spi: &dyn ChannelDriver,
        key: ScanKey,
        listener: Option<Arc<dyn DeviceScanListener>>,
    ) -> Result<Arc<DeviceScanner>> {
        let scanner = Arc::new(DeviceScanner {
            key: key.clone(),
            progress: ScanProgress::new(listener),
            table: Arc::downgrade(&self.device_scans),
        });
        if !self.device_scans.insert_new(key.clone(), Arc::clone(&scanner)) {
            return Err(ChannelManagerError::io(format!(
                "Device scan already running on {} (filter {:?}, app {})",
                key.interface_id, key.filter, key.app
            )));
        }
        debug!("Drv {} device scan start on {}", self.driver_id, key.interface_id);

        let as_listener: Arc<dyn DeviceScanListener> = scanner.clone();
        if let Err(e) = spi
            .start_device_scan(&key.interface_id, key.filter.as_deref(), as_listener)
            .await
        {
            scanner.abort();
            return Err(ChannelManagerError::driver(&self.driver_id, e));
        }
        Ok(scanner)
    }

    /// Abort the scan registered under `key`; returns whether one was found.
    pub async fn abort_device_scan(&self, spi: Option<&dyn ChannelDriver>, key: &ScanKey) -> bool {
        let Some(scanner) = self.device_scans.remove(key) else {
            return false;
        };
        self.abort_device_scanner(spi, key, &scanner).await;
        true
    }

    async fn abort_device_scanner(
        &self,
        spi: Option<&dyn ChannelDriver>,
        key: &ScanKey,
        scanner: &DeviceScanner,
    ) {
        if !scanner.abort() {
            return;
        }
        if let Some(spi) = spi {
            if let Err(e) = spi
                .abort_device_scan(&key.interface_id, key.filter.as_deref())
                .await
            {
                if !e.is_unsupported() {
                    debug!("Drv {} abort scan on {}: {}", self.driver_id, key.interface_id, e);
                }
            }
        }
    }

    pub async fn start_channel_scan(
        &self,
        spi: &dyn ChannelDriver,
        key: ChannelScanKey,
        listener: Option<Arc<dyn ChannelScanListener>>,
    ) -> Result<Arc<ChannelScanner>> {
        let scanner = Arc::new(ChannelScanner {
            key: key.clone(),
            progress: ScanProgress::new(listener),
            table: Arc::downgrade(&self.channel_scans),
        });
        if !self.channel_scans.insert_new(key.clone(), Arc::clone(&scanner)) {
            return Err(ChannelManagerError::io(format!(
                "Channel scan already running on {} (app {})",
                key.device, key.app
            )));
        }
        debug!("Drv {} channel scan start on {}", self.driver_id, key.device);

        let as_listener: Arc<dyn ChannelScanListener> = scanner.clone();
        if let Err(e) = spi.start_channel_scan(&key.device, as_listener).await {
            scanner.abort();
            return Err(ChannelManagerError::driver(&self.driver_id, e));
        }
        Ok(scanner)
    }

    pub fn abort_channel_scan(&self, key: &ChannelScanKey) -> bool {
        match self.channel_scans.remove(key) {
            Some(scanner) => {
                scanner.abort();
                true
            },
            None => false,
        }
    }

    /// Abort every scan started by `app`; returns how many.
    pub async fn abort_for_app(&self, spi: Option<&dyn ChannelDriver>, app: &AppId) -> usize {
        let device_scans = self.device_scans.take_where(|k| &k.app == app);
        let channel_scans = self.channel_scans.take_where(|k| &k.app == app);
        let count = device_scans.len() + channel_scans.len();
        for (key, scanner) in device_scans {
            self.abort_device_scanner(spi, &key, &scanner).await;
        }
        for (_, scanner) in channel_scans {
            scanner.abort();
        }
        count
    }

    /// Abort and forget every scan.
    pub async fn close(&self, spi: Option<&dyn ChannelDriver>) {
        let device_scans = self.device_scans.take_where(|_| true);
        let channel_scans = self.channel_scans.take_where(|_| true);
        for (key, scanner) in device_scans {
            self.abort_device_scanner(spi, &key, &scanner).await;
        }
        for (_, scanner) in channel_scans {
            scanner.abort();
        }
    }
}

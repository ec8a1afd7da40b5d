//! Application-facing entry point
//!
//! A registry of drivers by id. Almost everything is delegated to the
//! [`Driver`] owning the locator; the manager adds the multi-channel
//! conveniences (batched writes, one-shot unconfigured I/O) and the
//! synchronous discovery variants.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::configuration::{Configuration, ConfigurationKey};
use super::driver::Driver;
use super::reader::{ReaderFactoryKind, ReaderSettings, ReaderThreadFactories};
use super::scan::{ChannelScanKey, ChannelScanner, DeviceScanner, ScanKey, ScanState};
use crate::config::ChannelManagerConfig;
use crate::error::{ChannelManagerError, Result};
use crate::listener::{ChannelEventListener, ChannelScanListener, DeviceListener, DeviceScanListener};
use crate::log_limiter::DEFAULT_SUPPRESSION_INTERVAL_MS;
use crate::spi::ChannelDriver;
use crate::types::{
    AppId, ChannelLocator, DeviceLocator, Direction, SampledValue, SampledValueContainer,
    Sampling, Value, ValueContainer,
};

/// Channel manager
pub struct ChannelManager {
    drivers: RwLock<HashMap<String, Arc<Driver>>>,
    factories: ReaderThreadFactories,
    log_interval: Duration,
    discovery_timeout: Option<Duration>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            factories: ReaderThreadFactories::default(),
            log_interval: Duration::from_millis(DEFAULT_SUPPRESSION_INTERVAL_MS),
            discovery_timeout: None,
        }
    }
}

impl ChannelManager {
    pub fn new(config: &ChannelManagerConfig) -> Self {
        let log_interval = Duration::from_millis(config.log_suppression_interval_ms);
        let settings = ReaderSettings {
            stop_timeout: Duration::from_millis(config.reader_stop_timeout_ms),
            log_interval,
        };
        Self {
            drivers: RwLock::new(HashMap::new()),
            factories: ReaderThreadFactories::new(
                settings,
                config.reader_factory,
                config.driver_reader_factories.clone(),
            ),
            log_interval,
            discovery_timeout: config.discovery_timeout_ms.map(Duration::from_millis),
        }
    }

    // ------------------------------------------------------------------
    // Driver registry
    // ------------------------------------------------------------------

    /// Register a protocol driver using the configured reader factory.
    pub fn add_driver(&self, spi: Arc<dyn ChannelDriver>) -> Result<Arc<Driver>> {
        let factory = self.factories.for_driver(spi.driver_id());
        self.insert_driver(Driver::new(spi, factory, self.log_interval))
    }

    /// Register a protocol driver with an explicit reader factory kind.
    pub fn add_driver_with_factory(
        &self,
        spi: Arc<dyn ChannelDriver>,
        kind: ReaderFactoryKind,
    ) -> Result<Arc<Driver>> {
        let factory = self.factories.get(kind);
        self.insert_driver(Driver::new(spi, factory, self.log_interval))
    }

    fn insert_driver(&self, driver: Arc<Driver>) -> Result<Arc<Driver>> {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(driver.id()) {
            return Err(ChannelManagerError::argument(format!(
                "Driver {} already registered",
                driver.id()
            )));
        }
        drivers.insert(driver.id().to_string(), Arc::clone(&driver));
        Ok(driver)
    }

    /// Unregister and close a driver; returns `false` if unknown.
    pub async fn remove_driver(&self, driver_id: &str) -> bool {
        let removed = self.drivers.write().remove(driver_id);
        match removed {
            Some(driver) => {
                driver.close().await;
                true
            },
            None => false,
        }
    }

    pub fn driver(&self, driver_id: &str) -> Result<Arc<Driver>> {
        self.drivers
            .read()
            .get(driver_id)
            .cloned()
            .ok_or_else(|| ChannelManagerError::driver_not_found(driver_id))
    }

    pub fn driver_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn drivers(&self) -> Vec<Arc<Driver>> {
        self.drivers.read().values().cloned().collect()
    }

    /// Reader loops currently running
    pub fn active_reader_threads(&self) -> usize {
        self.factories.active_threads()
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Open a channel. Opening the same key again returns the same handle.
    pub async fn add_channel(
        &self,
        locator: &ChannelLocator,
        direction: Direction,
        sampling: Sampling,
        app: &AppId,
    ) -> Result<Arc<Configuration>> {
        let driver = self.driver(locator.driver_id())?;
        let key = ConfigurationKey::new(locator.clone(), direction, sampling, app.clone());
        driver.add_configuration(key).await
    }

    /// Existing handle for the key, without creating one.
    pub async fn get_configuration(
        &self,
        locator: &ChannelLocator,
        direction: Direction,
        sampling: Sampling,
        app: &AppId,
    ) -> Result<Arc<Configuration>> {
        let driver = self.driver(locator.driver_id())?;
        let key = ConfigurationKey::new(locator.clone(), direction, sampling, app.clone());
        driver.get_configuration(&key).await
    }

    /// Close a handle; `false` if it was already gone.
    pub async fn delete_channel(&self, configuration: &Configuration) -> bool {
        if configuration.is_removed() {
            return false;
        }
        let Ok(driver) = self.driver(configuration.driver_id()) else {
            return false;
        };
        driver
            .remove_configuration(configuration)
            .await
            .unwrap_or(false)
    }

    pub async fn get_channel_value(&self, configuration: &Configuration) -> Result<SampledValue> {
        configuration.get_channel_value().await
    }

    pub async fn set_channel_value(&self, configuration: &Configuration, value: Value) -> Result<()> {
        configuration.set_channel_value(value).await
    }

    /// Write several handles, one driver batch per driver.
    pub async fn set_multiple_channel_values(
        &self,
        configurations: &[Arc<Configuration>],
        values: Vec<Value>,
    ) -> Result<()> {
        if configurations.len() != values.len() {
            return Err(ChannelManagerError::argument(format!(
                "{} handles but {} values",
                configurations.len(),
                values.len()
            )));
        }

        let mut batches: HashMap<String, Vec<ValueContainer>> = HashMap::new();
        for (configuration, value) in configurations.iter().zip(values) {
            if !configuration.is_writable() {
                return Err(ChannelManagerError::security(format!(
                    "Channel {} is not writable ({:?})",
                    configuration.locator(),
                    configuration.direction()
                )));
            }
            if configuration.is_removed() {
                return Err(ChannelManagerError::channel_not_found(configuration.locator()));
            }
            batches
                .entry(configuration.driver_id().to_string())
                .or_default()
                .push(ValueContainer::new(configuration.locator().clone(), value));
        }

        for (driver_id, batch) in batches {
            self.driver(&driver_id)?.write_channels(&batch).await?;
        }
        Ok(())
    }

    /// One-shot read of channels nobody has opened. All locators must
    /// belong to one driver.
    pub async fn read_unconfigured_channels(
        &self,
        locators: &[ChannelLocator],
    ) -> Result<Vec<SampledValueContainer>> {
        let Some(driver) = self.single_driver(locators.iter())? else {
            return Ok(Vec::new());
        };
        let app = AppId::synthetic();
        let result = async {
            let mut batch = Vec::with_capacity(locators.len());
            for locator in locators {
                let key = ConfigurationKey::new(
                    locator.clone(),
                    Direction::Input,
                    Sampling::OnDemand,
                    app.clone(),
                );
                driver.add_configuration(key).await?;
                batch.push(SampledValueContainer::new(locator.clone()));
            }
            driver.read_channels(&mut batch).await?;
            for container in &batch {
                if let Some(channel) = driver.channel(&container.locator) {
                    channel.update(container.sampled_value.clone()).await;
                }
            }
            Ok::<_, ChannelManagerError>(batch)
        }
        .await;
        driver.remove_app_id(&app).await;
        result
    }

    /// One-shot write of channels nobody has opened.
    pub async fn write_unconfigured_channels(&self, values: &[ValueContainer]) -> Result<()> {
        let Some(driver) = self.single_driver(values.iter().map(|v| &v.locator))? else {
            return Ok(());
        };
        let app = AppId::synthetic();
        let result = async {
            for value in values {
                let key = ConfigurationKey::new(
                    value.locator.clone(),
                    Direction::Output,
                    Sampling::OnDemand,
                    app.clone(),
                );
                driver.add_configuration(key).await?;
            }
            driver.write_channels(values).await
        }
        .await;
        driver.remove_app_id(&app).await;
        result
    }

    /// The one driver all `locators` belong to, checked before anything is
    /// opened. `None` for an empty input.
    fn single_driver<'a>(
        &self,
        mut locators: impl Iterator<Item = &'a ChannelLocator>,
    ) -> Result<Option<Arc<Driver>>> {
        let Some(first) = locators.next() else {
            return Ok(None);
        };
        let driver_id = first.driver_id();
        if let Some(other) = locators.find(|l| l.driver_id() != driver_id) {
            return Err(ChannelManagerError::argument(format!(
                "Unconfigured channels span drivers {} and {}",
                driver_id,
                other.driver_id()
            )));
        }
        self.driver(driver_id).map(Some)
    }

    /// Every open configuration across all drivers
    pub async fn get_all_configured_channels(&self) -> Vec<Arc<Configuration>> {
        let mut all = Vec::new();
        for driver in self.drivers() {
            all.extend(driver.configurations().await);
        }
        all
    }

    /// Channels the driver reports for `device`.
    pub async fn get_channel_list(&self, device: &DeviceLocator) -> Result<Vec<ChannelLocator>> {
        self.driver(device.driver_id())?
            .get_channel_list(device)
            .await
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    pub fn register_update_listener(
        &self,
        configuration: &Configuration,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Result<bool> {
        ensure_live(configuration)?;
        Ok(configuration.add_update_listener(listener))
    }

    pub fn unregister_update_listener(
        &self,
        configuration: &Configuration,
        listener: &Arc<dyn ChannelEventListener>,
    ) -> bool {
        configuration.remove_update_listener(listener)
    }

    pub fn register_changed_listener(
        &self,
        configuration: &Configuration,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Result<bool> {
        ensure_live(configuration)?;
        Ok(configuration.add_changed_listener(listener))
    }

    pub fn unregister_changed_listener(
        &self,
        configuration: &Configuration,
        listener: &Arc<dyn ChannelEventListener>,
    ) -> bool {
        configuration.remove_changed_listener(listener)
    }

    pub fn add_device_listener(
        &self,
        driver_id: &str,
        app: &AppId,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<bool> {
        self.driver(driver_id)?.add_device_listener(app, listener)
    }

    pub fn remove_device_listener(
        &self,
        driver_id: &str,
        app: &AppId,
        listener: &Arc<dyn DeviceListener>,
    ) -> Result<bool> {
        Ok(self.driver(driver_id)?.remove_device_listener(app, listener))
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Start a device scan and return immediately.
    pub async fn start_device_discovery(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
        app: &AppId,
        listener: Arc<dyn DeviceScanListener>,
    ) -> Result<Arc<DeviceScanner>> {
        let key = ScanKey::new(interface_id, filter, app.clone());
        self.driver(driver_id)?
            .start_device_scan(key, Some(listener))
            .await
    }

    /// Scan for devices and wait for the result.
    pub async fn discover_devices(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
        app: &AppId,
    ) -> Result<Vec<DeviceLocator>> {
        let driver = self.driver(driver_id)?;
        let key = ScanKey::new(interface_id, filter, app.clone());
        let scanner = driver.start_device_scan(key.clone(), None).await?;
        match scanner.wait_until_finished(self.discovery_timeout).await {
            Ok(state) => finished_or_err(state, "Device scan").map(|()| scanner.devices()),
            Err(e) => {
                warn!("Drv {} device scan on {} timed out", driver_id, interface_id);
                driver.abort_device_scan(&key).await;
                Err(e)
            },
        }
    }

    /// Abort a device scan; `false` if none was running under that key.
    pub async fn abort_device_discovery(
        &self,
        driver_id: &str,
        interface_id: &str,
        filter: Option<&str>,
        app: &AppId,
    ) -> Result<bool> {
        let key = ScanKey::new(interface_id, filter, app.clone());
        Ok(self.driver(driver_id)?.abort_device_scan(&key).await)
    }

    pub async fn start_channel_discovery(
        &self,
        device: &DeviceLocator,
        app: &AppId,
        listener: Arc<dyn ChannelScanListener>,
    ) -> Result<Arc<ChannelScanner>> {
        let key = ChannelScanKey {
            device: device.clone(),
            app: app.clone(),
        };
        self.driver(device.driver_id())?
            .start_channel_scan(key, Some(listener))
            .await
    }

    /// Scan a device for channels and wait for the result.
    pub async fn discover_channels(
        &self,
        device: &DeviceLocator,
        app: &AppId,
    ) -> Result<Vec<ChannelLocator>> {
        let driver = self.driver(device.driver_id())?;
        let key = ChannelScanKey {
            device: device.clone(),
            app: app.clone(),
        };
        let scanner = driver.start_channel_scan(key.clone(), None).await?;
        match scanner.wait_until_finished(self.discovery_timeout).await {
            Ok(state) => finished_or_err(state, "Channel scan").map(|()| scanner.channels()),
            Err(e) => {
                driver.abort_channel_scan(&key);
                Err(e)
            },
        }
    }

    pub fn abort_channel_discovery(&self, device: &DeviceLocator, app: &AppId) -> Result<bool> {
        let key = ChannelScanKey {
            device: device.clone(),
            app: app.clone(),
        };
        Ok(self.driver(device.driver_id())?.abort_channel_scan(&key))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Remove everything `app` owns across all drivers.
    pub async fn remove_app(&self, app: &AppId) {
        for driver in self.drivers() {
            driver.remove_app_id(app).await;
        }
        debug!("App {} removed", app);
    }

    /// Close every driver and stop every reader loop.
    pub async fn shutdown(&self) {
        let drivers: Vec<Arc<Driver>> = self.drivers.write().drain().map(|(_, d)| d).collect();
        for driver in drivers {
            driver.close().await;
        }
        self.factories.shutdown().await;
        info!("Channel manager stopped");
    }
}

fn ensure_live(configuration: &Configuration) -> Result<()> {
    if configuration.is_removed() {
        return Err(ChannelManagerError::channel_not_found(configuration.locator()));
    }
    Ok(())
}

fn finished_or_err(state: ScanState, what: &str) -> Result<()> {
    match state {
        ScanState::Finished { success: true, .. } => Ok(()),
        ScanState::Finished { error, .. } => Err(ChannelManagerError::io(format!(
            "{} failed: {}",
            what,
            error.unwrap_or_else(|| "no reason given".to_string())
        ))),
        ScanState::Aborted => Err(ChannelManagerError::io(format!("{} aborted", what))),
        ScanState::Running => Err(ChannelManagerError::internal(format!("{} still running", what))),
    }
}

//! Physical channel: one locator, its cached sample and the configurations
//! referencing it
//!
//! Exactly one live `Channel` exists per `(Driver, ChannelLocator)`.
//! Configuration add/remove, updates and close are serialized by the
//! channel's own lock; a channel whose last configuration goes away closes
//! itself while still holding that lock, so no caller ever observes an open
//! channel with an empty configuration set.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::debug;

use super::configuration::{Configuration, ConfigurationKey};
use super::driver::Driver;
use super::reader::ReaderThread;
use crate::error::{ChannelManagerError, Result};
use crate::listener::EventType;
use crate::types::{
    AppId, ChannelLocator, ConfigurationType, SampledValue, SampledValueContainer, Value,
    ValueContainer,
};
use crate::utils::now_millis;

/// Classify the transition from `old` to `new`.
///
/// A first good value replacing the startup placeholder (no value) counts as
/// a value change even though the quality changed too.
pub fn classify_transition(old: Option<&SampledValue>, new: &SampledValue) -> EventType {
    let Some(old) = old else {
        return EventType::ValueChanged;
    };
    if old.value.is_none() && new.value.is_some() && new.is_good() {
        EventType::ValueChanged
    } else if old.quality != new.quality {
        EventType::QualityChanged
    } else if old.value != new.value {
        EventType::ValueChanged
    } else {
        EventType::Updated
    }
}

#[derive(Default)]
struct ChannelState {
    configurations: HashMap<ConfigurationKey, Arc<Configuration>>,
    reader: Option<Arc<ReaderThread>>,
    listening: bool,
}

impl ChannelState {
    fn has_type(&self, config_type: ConfigurationType) -> bool {
        self.configurations
            .values()
            .any(|c| c.config_type() == config_type)
    }
}

/// Shared channel behind any number of configurations
pub struct Channel {
    locator: ChannelLocator,
    driver: Weak<Driver>,
    this: Weak<Channel>,
    value: RwLock<SampledValue>,
    state: Mutex<ChannelState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("locator", &self.locator)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(locator: ChannelLocator, driver: Weak<Driver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            locator,
            driver,
            this: this.clone(),
            value: RwLock::new(SampledValue::bad()),
            state: Mutex::new(ChannelState::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn locator(&self) -> &ChannelLocator {
        &self.locator
    }

    pub fn driver_id(&self) -> &str {
        self.locator.driver_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Last known sample
    pub fn value(&self) -> SampledValue {
        self.value.read().clone()
    }

    pub(crate) fn driver(&self) -> Result<Arc<Driver>> {
        self.driver.upgrade().ok_or_else(|| {
            ChannelManagerError::invalid_state(format!("Driver of {} is gone", self.locator))
        })
    }

    pub(crate) fn driver_handle(&self) -> Weak<Driver> {
        self.driver.clone()
    }

    fn self_arc(&self) -> Result<Arc<Channel>> {
        self.this
            .upgrade()
            .ok_or_else(|| ChannelManagerError::internal("Channel used after drop"))
    }

    pub async fn configuration_count(&self) -> usize {
        self.state.lock().await.configurations.len()
    }

    pub async fn configurations(&self) -> Vec<Arc<Configuration>> {
        self.state
            .lock()
            .await
            .configurations
            .values()
            .cloned()
            .collect()
    }

    pub async fn get_configuration(&self, key: &ConfigurationKey) -> Option<Arc<Configuration>> {
        self.state.lock().await.configurations.get(key).cloned()
    }

    /// Look up or create the configuration for `key`.
    ///
    /// Fails with the retryable [`ChannelManagerError::ChannelClosed`] if the
    /// channel closed before the lock was acquired.
    pub(crate) async fn add_configuration(
        &self,
        key: ConfigurationKey,
    ) -> Result<Arc<Configuration>> {
        let driver = self.driver()?;
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return Err(ChannelManagerError::ChannelClosed(self.locator.clone()));
        }

        let result = self.add_configuration_locked(&mut state, &driver, key).await;
        if state.configurations.is_empty() {
            debug!("Ch {} closing after failed open", self.locator);
            self.close_locked(&mut state).await;
        }
        result
    }

    async fn add_configuration_locked(
        &self,
        state: &mut ChannelState,
        driver: &Arc<Driver>,
        key: ConfigurationKey,
    ) -> Result<Arc<Configuration>> {
        if state.configurations.is_empty() {
            driver.on_channel_added(&self.locator);
        }
        if let Some(existing) = state.configurations.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let configuration = Arc::new(Configuration::new(
            key.clone(),
            self.this.clone(),
            now_millis(),
        ));
        match configuration.config_type() {
            ConfigurationType::Polled => {
                let reader = match &state.reader {
                    Some(reader) => Arc::clone(reader),
                    None => {
                        let reader = driver.reader_factory().attach(&self.self_arc()?)?;
                        state.reader = Some(Arc::clone(&reader));
                        reader
                    },
                };
                state
                    .configurations
                    .insert(key, Arc::clone(&configuration));
                reader.update();
            },
            ConfigurationType::Listen => {
                if !state.listening {
                    driver
                        .listen_list()
                        .add_listen_channel(driver, &self.self_arc()?)
                        .await?;
                    state.listening = true;
                }
                state
                    .configurations
                    .insert(key, Arc::clone(&configuration));
            },
            ConfigurationType::OnDemand => {
                state
                    .configurations
                    .insert(key, Arc::clone(&configuration));
            },
        }
        debug!(
            "Ch {} +cfg {:?} app={} ({} total)",
            self.locator,
            configuration.config_type(),
            configuration.app_id(),
            state.configurations.len()
        );
        Ok(configuration)
    }

    /// Remove `configuration` if it is still the entry under its key. A
    /// stale handle never removes a newer configuration opened later with
    /// the same key.
    pub(crate) async fn remove_configuration(&self, configuration: &Configuration) -> bool {
        let mut state = self.state.lock().await;
        let key = configuration.key();
        let current = state
            .configurations
            .get(key)
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), configuration));
        if !current {
            return false;
        }
        let Some(configuration) = state.configurations.remove(key) else {
            return false;
        };
        configuration.mark_removed();
        configuration.clear_listeners();
        self.after_removal(&mut state).await;
        true
    }

    /// Remove every configuration owned by `app`; returns how many.
    pub(crate) async fn remove_configurations_for_app(&self, app: &AppId) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<ConfigurationKey> = state
            .configurations
            .keys()
            .filter(|k| &k.app == app)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(configuration) = state.configurations.remove(key) {
                configuration.mark_removed();
                configuration.clear_listeners();
            }
        }
        if !keys.is_empty() {
            self.after_removal(&mut state).await;
        }
        keys.len()
    }

    async fn after_removal(&self, state: &mut ChannelState) {
        if !state.has_type(ConfigurationType::Polled) {
            if let Some(reader) = state.reader.take() {
                reader.remove(&self.locator);
            }
        }
        if state.listening && !state.has_type(ConfigurationType::Listen) {
            state.listening = false;
            if let Some(driver) = self.driver.upgrade() {
                driver
                    .listen_list()
                    .remove_listen_channel(&driver, &self.locator)
                    .await;
            }
        }
        if state.configurations.is_empty() {
            self.close_locked(state).await;
        }
    }

    /// Synchronous one-shot read through the driver.
    pub async fn read_channel(&self) -> Result<SampledValue> {
        let driver = self.driver()?;
        let mut batch = [SampledValueContainer::new(self.locator.clone())];
        driver.read_channels(&mut batch).await?;
        let [container] = batch;
        self.update(container.sampled_value).await;
        Ok(self.value())
    }

    /// Synchronous one-shot write through the driver.
    pub async fn write_channel(&self, value: Value) -> Result<()> {
        let driver = self.driver()?;
        driver
            .write_channels(&[ValueContainer::new(self.locator.clone(), value)])
            .await
    }

    /// Apply a new sample and notify every configuration.
    ///
    /// `None` means the driver had no new data; the cached value is kept.
    pub async fn update(&self, sample: Option<SampledValue>) {
        let Some(sample) = sample else {
            return;
        };
        let state = self.state.lock().await;
        if self.is_closed() {
            return;
        }
        let old = std::mem::replace(&mut *self.value.write(), sample.clone());
        let event_type = classify_transition(Some(&old), &sample);
        for configuration in state.configurations.values() {
            configuration.update(&sample, event_type);
        }
    }

    /// Earliest due time over all configurations; due ones add this
    /// channel's locator to `batch`.
    pub(crate) async fn update_sampling_time(
        &self,
        now_ms: i64,
        batch: &mut Vec<ChannelLocator>,
    ) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .configurations
            .values()
            .filter_map(|c| c.update_sampling_time(now_ms, batch))
            .min()
    }

    /// Close the channel. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await;
    }

    async fn close_locked(&self, state: &mut ChannelState) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, configuration) in state.configurations.drain() {
            configuration.mark_removed();
            configuration.clear_listeners();
        }
        if let Some(reader) = state.reader.take() {
            reader.remove(&self.locator);
        }
        let driver = self.driver.upgrade();
        if std::mem::take(&mut state.listening) {
            if let Some(driver) = &driver {
                driver
                    .listen_list()
                    .remove_listen_channel(driver, &self.locator)
                    .await;
            }
        }
        if let Some(driver) = driver {
            driver.on_channel_removed(self);
        }
        debug!("Ch {} closed", self.locator);
    }
}

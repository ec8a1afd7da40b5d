//! One application's open handle on a channel
//!
//! A configuration is identified by `(locator, sampling, direction, app)`.
//! Its [`ConfigurationType`] is derived once at creation and never
//! recomputed; polled configurations keep their own next sampling time.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::channel::Channel;
use crate::error::{ChannelManagerError, Result};
use crate::listener::{ChannelEvent, ChannelEventListener, EventType};
use crate::types::{
    AppId, ChannelLocator, ConfigurationType, DeviceLocator, Direction, SampledValue, Sampling,
    Value,
};
use crate::utils::guard_callback;

/// Identity of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigurationKey {
    pub locator: ChannelLocator,
    pub sampling: Sampling,
    pub direction: Direction,
    pub app: AppId,
}

impl ConfigurationKey {
    pub fn new(
        locator: ChannelLocator,
        direction: Direction,
        sampling: Sampling,
        app: AppId,
    ) -> Self {
        Self {
            locator,
            sampling,
            direction,
            app,
        }
    }
}

type ListenerList = RwLock<Vec<Arc<dyn ChannelEventListener>>>;

/// Open channel configuration (public handle returned by `add_channel`)
pub struct Configuration {
    key: ConfigurationKey,
    config_type: ConfigurationType,
    channel: Weak<Channel>,
    /// Epoch milliseconds; only meaningful for polled configurations
    next_sampling_time: Mutex<i64>,
    removed: AtomicBool,
    update_listeners: ListenerList,
    changed_listeners: ListenerList,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("key", &self.key)
            .field("type", &self.config_type)
            .field("removed", &self.is_removed())
            .finish_non_exhaustive()
    }
}

impl Configuration {
    pub(crate) fn new(key: ConfigurationKey, channel: Weak<Channel>, now_ms: i64) -> Self {
        let config_type = ConfigurationType::derive(key.direction, key.sampling);
        let next_sampling_time = match (config_type, key.sampling) {
            (ConfigurationType::Polled, Sampling::Period(period)) => {
                now_ms - now_ms.rem_euclid(period_millis(period))
            },
            _ => 0,
        };
        Self {
            key,
            config_type,
            channel,
            next_sampling_time: Mutex::new(next_sampling_time),
            removed: AtomicBool::new(false),
            update_listeners: RwLock::new(Vec::new()),
            changed_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &ConfigurationKey {
        &self.key
    }

    pub fn locator(&self) -> &ChannelLocator {
        &self.key.locator
    }

    pub fn device_locator(&self) -> &DeviceLocator {
        self.key.locator.device()
    }

    pub fn driver_id(&self) -> &str {
        self.key.locator.driver_id()
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn sampling(&self) -> Sampling {
        self.key.sampling
    }

    pub fn app_id(&self) -> &AppId {
        &self.key.app
    }

    pub fn config_type(&self) -> ConfigurationType {
        self.config_type
    }

    pub fn is_readable(&self) -> bool {
        self.key.direction.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.key.direction.is_writable()
    }

    /// Whether the configuration was deleted or its channel closed.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub(crate) fn next_sampling_time(&self) -> i64 {
        *self.next_sampling_time.lock()
    }

    fn channel(&self) -> Result<Arc<Channel>> {
        if self.is_removed() {
            return Err(ChannelManagerError::channel_not_found(&self.key.locator));
        }
        self.channel
            .upgrade()
            .ok_or_else(|| ChannelManagerError::channel_not_found(&self.key.locator))
    }

    /// Milliseconds until this configuration is due, `Some(0)` if due now
    /// (its locator is then appended to `batch`), `None` if never polled.
    ///
    /// A long stall advances the schedule by whole periods, so it costs one
    /// read rather than one per missed period.
    pub(crate) fn update_sampling_time(
        &self,
        now_ms: i64,
        batch: &mut Vec<ChannelLocator>,
    ) -> Option<u64> {
        if !self.is_readable() || self.config_type != ConfigurationType::Polled {
            return None;
        }
        let Sampling::Period(period) = self.key.sampling else {
            return None;
        };
        let period = period_millis(period);

        let mut next = self.next_sampling_time.lock();
        if *next > now_ms {
            return Some((*next - now_ms) as u64);
        }
        let missed = (now_ms - *next) / period;
        *next += (missed + 1) * period;
        drop(next);

        // cheap de-duplication against the previous entry only
        if batch.last() != Some(&self.key.locator) {
            batch.push(self.key.locator.clone());
        }
        Some(0)
    }

    /// Current value of the channel. On-demand configurations read the
    /// device first; the others return the cached sample.
    pub async fn get_channel_value(&self) -> Result<SampledValue> {
        if !self.is_readable() {
            return Err(ChannelManagerError::security(format!(
                "Channel {} is not readable ({:?})",
                self.key.locator, self.key.direction
            )));
        }
        let channel = self.channel()?;
        if self.config_type == ConfigurationType::OnDemand {
            channel.read_channel().await?;
        }
        Ok(channel.value())
    }

    pub async fn set_channel_value(&self, value: Value) -> Result<()> {
        if !self.is_writable() {
            return Err(ChannelManagerError::security(format!(
                "Channel {} is not writable ({:?})",
                self.key.locator, self.key.direction
            )));
        }
        self.channel()?.write_channel(value).await
    }

    /// Fan a channel update out to this configuration's listeners.
    pub(crate) fn update(&self, value: &SampledValue, event_type: EventType) {
        if !self.is_readable() {
            return;
        }
        let update_listeners = self.update_listeners.read().clone();
        let changed_listeners = if event_type == EventType::Updated {
            Vec::new()
        } else {
            self.changed_listeners.read().clone()
        };
        if update_listeners.is_empty() && changed_listeners.is_empty() {
            return;
        }

        let event = ChannelEvent {
            event_type,
            locator: self.key.locator.clone(),
            value: value.clone(),
            configuration: self.key.clone(),
        };
        for listener in update_listeners.iter().chain(changed_listeners.iter()) {
            guard_callback("channel_event", || listener.channel_event(&event));
        }
    }

    /// Returns `false` if the listener was already registered.
    pub fn add_update_listener(&self, listener: Arc<dyn ChannelEventListener>) -> bool {
        add_listener(&self.update_listeners, listener)
    }

    pub fn remove_update_listener(&self, listener: &Arc<dyn ChannelEventListener>) -> bool {
        remove_listener(&self.update_listeners, listener)
    }

    /// Listener called only when value or quality changes.
    pub fn add_changed_listener(&self, listener: Arc<dyn ChannelEventListener>) -> bool {
        add_listener(&self.changed_listeners, listener)
    }

    pub fn remove_changed_listener(&self, listener: &Arc<dyn ChannelEventListener>) -> bool {
        remove_listener(&self.changed_listeners, listener)
    }

    pub(crate) fn clear_listeners(&self) {
        self.update_listeners.write().clear();
        self.changed_listeners.write().clear();
    }
}

fn add_listener(list: &ListenerList, listener: Arc<dyn ChannelEventListener>) -> bool {
    let mut list = list.write();
    if list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
        return false;
    }
    list.push(listener);
    true
}

fn remove_listener(list: &ListenerList, listener: &Arc<dyn ChannelEventListener>) -> bool {
    let mut list = list.write();
    let before = list.len();
    list.retain(|l| !Arc::ptr_eq(l, listener));
    list.len() != before
}

/// Period as a signed millisecond count, saturating instead of wrapping.
fn period_millis(period: u64) -> i64 {
    i64::try_from(period).unwrap_or(i64::MAX).max(1)
}

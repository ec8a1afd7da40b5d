//! Device attach/detach subscriptions of one driver
//!
//! Every registration is wrapped in an adapter handed to the driver; the
//! adapter isolates the driver from panicking application listeners.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ChannelManagerError, Result};
use crate::listener::DeviceListener;
use crate::spi::ChannelDriver;
use crate::types::{AppId, DeviceLocator};
use crate::utils::guard_callback;

type ListenerKey = (AppId, usize);

fn listener_key(app: &AppId, listener: &Arc<dyn DeviceListener>) -> ListenerKey {
    (app.clone(), Arc::as_ptr(listener) as *const () as usize)
}

struct GuardedDeviceListener {
    inner: Arc<dyn DeviceListener>,
}

impl DeviceListener for GuardedDeviceListener {
    fn device_added(&self, device: &DeviceLocator) {
        guard_callback("device_added", || self.inner.device_added(device));
    }

    fn device_removed(&self, device: &DeviceLocator) {
        guard_callback("device_removed", || self.inner.device_removed(device));
    }
}

/// Set of `(app, listener)` registrations
pub struct DeviceListenerList {
    driver_id: String,
    adapters: Mutex<HashMap<ListenerKey, Arc<dyn DeviceListener>>>,
}

impl DeviceListenerList {
    pub fn new(driver_id: impl Into<String>) -> Self {
        Self {
            driver_id: driver_id.into(),
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `false` if the pair was already registered.
    pub fn add(
        &self,
        spi: &dyn ChannelDriver,
        app: &AppId,
        listener: Arc<dyn DeviceListener>,
    ) -> Result<bool> {
        let key = listener_key(app, &listener);
        let mut adapters = self.adapters.lock();
        if adapters.contains_key(&key) {
            return Ok(false);
        }
        let adapter: Arc<dyn DeviceListener> = Arc::new(GuardedDeviceListener { inner: listener });
        spi.add_device_listener(Arc::clone(&adapter))
            .map_err(|e| ChannelManagerError::driver(&self.driver_id, e))?;
        adapters.insert(key, adapter);
        debug!("Drv {} +device listener app={}", self.driver_id, app);
        Ok(true)
    }

    /// Returns `false` if the pair was not registered.
    pub fn remove(
        &self,
        spi: Option<&dyn ChannelDriver>,
        app: &AppId,
        listener: &Arc<dyn DeviceListener>,
    ) -> bool {
        let removed = self.adapters.lock().remove(&listener_key(app, listener));
        match removed {
            Some(adapter) => {
                self.deregister(spi, &adapter);
                true
            },
            None => false,
        }
    }

    /// Remove every registration of `app`; returns how many.
    pub fn remove_for_app(&self, spi: Option<&dyn ChannelDriver>, app: &AppId) -> usize {
        let removed: Vec<Arc<dyn DeviceListener>> = {
            let mut adapters = self.adapters.lock();
            let keys: Vec<ListenerKey> = adapters.keys().filter(|(a, _)| a == app).cloned().collect();
            keys.iter().filter_map(|k| adapters.remove(k)).collect()
        };
        for adapter in &removed {
            self.deregister(spi, adapter);
        }
        removed.len()
    }

    pub fn clear(&self, spi: Option<&dyn ChannelDriver>) {
        let removed: Vec<_> = self.adapters.lock().drain().map(|(_, a)| a).collect();
        for adapter in &removed {
            self.deregister(spi, adapter);
        }
    }

    fn deregister(&self, spi: Option<&dyn ChannelDriver>, adapter: &Arc<dyn DeviceListener>) {
        if let Some(spi) = spi {
            if let Err(e) = spi.remove_device_listener(adapter) {
                debug!("Drv {} device listener removal: {}", self.driver_id, e);
            }
        }
    }
}

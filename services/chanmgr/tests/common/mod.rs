//! Test Common Utilities
//!
//! Helpers shared by the chanmgr integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chanmgr::drivers::SimulatedDriver;
use chanmgr::listener::{DeviceListener, DeviceScanListener};
use chanmgr::types::{ChannelLocator, DeviceLocator};
use chanmgr::{
    ChannelEvent, ChannelEventListener, ChannelManager, ChannelManagerConfig, DriverError,
    EventType,
};

pub const SIM: &str = "sim";

pub fn device(address: &str) -> DeviceLocator {
    DeviceLocator::new(SIM, "bus0", address)
}

pub fn locator(device_address: &str, channel: &str) -> ChannelLocator {
    device(device_address).channel(channel)
}

/// Manager with one simulated driver registered as `sim`
pub fn setup() -> (ChannelManager, Arc<SimulatedDriver>) {
    setup_with(&ChannelManagerConfig::default())
}

pub fn setup_with(config: &ChannelManagerConfig) -> (ChannelManager, Arc<SimulatedDriver>) {
    let manager = ChannelManager::new(config);
    let sim = Arc::new(SimulatedDriver::new(SIM));
    manager.add_driver(sim.clone()).unwrap();
    (manager, sim)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records channel events
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<ChannelEvent>>,
}

impl EventRecorder {
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl ChannelEventListener for EventRecorder {
    fn channel_event(&self, event: &ChannelEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Records device scan callbacks
#[derive(Default)]
pub struct ScanRecorder {
    pub found: Mutex<Vec<DeviceLocator>>,
    pub finished: Mutex<Vec<bool>>,
}

impl DeviceScanListener for ScanRecorder {
    fn device_found(&self, device: &DeviceLocator) {
        self.found.lock().push(device.clone());
    }

    fn finished(&self, success: bool, _error: Option<&DriverError>) {
        self.finished.lock().push(success);
    }
}

/// Records device attach/detach notifications
#[derive(Default)]
pub struct DeviceRecorder {
    pub added: Mutex<Vec<DeviceLocator>>,
    pub removed: Mutex<Vec<DeviceLocator>>,
}

impl DeviceListener for DeviceRecorder {
    fn device_added(&self, device: &DeviceLocator) {
        self.added.lock().push(device.clone());
    }

    fn device_removed(&self, device: &DeviceLocator) {
        self.removed.lock().push(device.clone());
    }
}

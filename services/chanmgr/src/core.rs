//! Channel, driver and scheduler core

pub mod channel;
pub mod configuration;
pub mod device_listeners;
pub mod driver;
pub mod listen;
pub mod manager;
pub mod reader;
pub mod scan;

pub use channel::{classify_transition, Channel};
pub use configuration::{Configuration, ConfigurationKey};
pub use device_listeners::DeviceListenerList;
pub use driver::Driver;
pub use listen::ChannelUpdateListenerList;
pub use manager::ChannelManager;
pub use reader::{
    KeyedReaderThreadFactory, ReaderFactoryKind, ReaderKey, ReaderSettings, ReaderThread,
    ReaderThreadFactories, ReaderThreadFactory, DEFAULT_STOP_TIMEOUT_MS,
};
pub use scan::{
    ChannelScanKey, ChannelScanner, DeviceScanList, DeviceScanner, ScanKey, ScanState,
};

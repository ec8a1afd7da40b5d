//! Channel Manager Library (chanmgr)
//!
//! Mediation layer between application code and pluggable field-protocol
//! drivers (Modbus, M-Bus, ...). Applications open logical channels with a
//! direction and a sampling policy; the manager multiplexes them onto one
//! physical channel per locator, polls due channels in batches, aggregates
//! push subscriptions into the driver's single listen set and dispatches
//! value updates back to the right listeners.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ ChannelManager  │───►│     Driver      │───►│    Channel      │
//! │ (driver by id)  │    │ (table, scans)  │    │ (one / locator) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │                       │
//!                                 ▼                       ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │  ReaderThread   │    │  Configuration  │
//!                        │ (batched polls) │    │  (per app key)  │
//!                        └─────────────────┘    └─────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use chanmgr::drivers::SimulatedDriver;
//! use chanmgr::types::{AppId, DeviceLocator, Direction, Sampling};
//! use chanmgr::{ChannelManager, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = ChannelManager::default();
//!     let sim = Arc::new(SimulatedDriver::new("sim"));
//!     manager.add_driver(sim.clone())?;
//!
//!     let temp = DeviceLocator::new("sim", "bus0", "p1").channel("temp");
//!     sim.set_value(&temp, 21.5);
//!
//!     let app = AppId::new("hmi");
//!     let handle = manager
//!         .add_channel(&temp, Direction::Input, Sampling::Period(1000), &app)
//!         .await?;
//!     println!("{:?}", manager.get_channel_value(&handle).await?);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod listener;
pub mod log_limiter;
pub mod spi;
pub mod types;
pub mod utils;

pub use crate::config::ChannelManagerConfig;
pub use crate::core::{ChannelManager, Configuration, ConfigurationKey, Driver};
pub use crate::error::{ChannelManagerError, ErrorKind, Result};
pub use crate::listener::{ChannelEvent, ChannelEventListener, EventType};
pub use crate::spi::{ChannelDriver, DriverError, DriverResult};

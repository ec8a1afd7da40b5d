//! Built-in drivers

pub mod simulated;

pub use simulated::SimulatedDriver;

//! Threshold detection and alerting.

pub mod alerts;
pub mod monitor;
pub mod sinks;

pub use alerts::{AlertConfig, AlertDispatcher};
pub use monitor::{ComponentQuality, ThresholdConfig, ThresholdMonitor};

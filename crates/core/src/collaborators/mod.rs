//! Concrete implementations of the external collaborator traits.

pub mod optimizer;
pub mod target;
pub mod telemetry;

pub use optimizer::{HttpOptimizer, RuleBasedOptimizer};
pub use target::{InProcessTarget, WebhookConfigTarget};
pub use telemetry::HttpTelemetrySource;

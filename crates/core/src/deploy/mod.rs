//! Live configuration ownership, deployment, rollback and the change ledger.

pub mod governor;
pub mod ledger;

pub use governor::{DeploymentGovernor, DeploymentResult, RollbackResult};
pub use ledger::{ChangeLedger, LedgerSummary, DEFAULT_LEDGER_CAPACITY};

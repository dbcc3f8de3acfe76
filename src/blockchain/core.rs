// core.rs splits the ledger into submodules for easier maintenance.
pub mod chain;
pub mod metrics;
pub mod validation;

pub use chain::*;
pub use metrics::*;
pub use validation::*;

// Thin re-export module: implementation lives in `blockchain/core.rs`, split
// into chain management, validation and chain metrics.

pub mod core;
pub use core::*;

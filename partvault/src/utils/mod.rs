//! Utility modules for the partition vault.

pub mod errors;
pub mod logger;

pub use errors::{Result, VaultError};

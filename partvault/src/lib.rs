//! Partvault Library
//!
//! Partition backup, restore and flash pipeline for mobile device storage.
//! Devices are reached through the [`device::DeviceIo`] capability; the
//! engines in [`engine`] never talk to a transport directly.

pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod firmware;
pub mod manifest;
pub mod shutdown;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, VaultError};

//! # m2mp-registry
//!
//! Device-side data for the M2MP backend.
//!
//! This crate provides:
//! - The device registry interface and an in-memory implementation
//! - Identifier validation and device id derivation
//! - Channel routing rules with per-session caching
//! - The time-series store interface and an in-memory implementation

pub mod device;
pub mod error;
pub mod ident;
pub mod registry;
pub mod router;
pub mod timeseries;

pub use device::{Device, DeviceHandle};
pub use error::RegistryError;
pub use ident::{device_id_for, is_valid_ident, series_key};
pub use registry::{DeviceRegistry, MemoryRegistry, DEFAULT_DOMAIN};
pub use router::{ChannelRouter, ChannelRule};
pub use timeseries::{MemoryTimeSeries, TimeSeriesStore, TimedSample};

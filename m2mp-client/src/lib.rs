//! # m2mp-client
//!
//! Device side of an M2MP connection.
//!
//! This crate provides:
//! - Async TCP connection with connect and receive timeouts
//! - Identification, data and data array sending
//! - Client-role framing, so server pings and replies decode as a device sees them

pub mod client;
pub mod error;

pub use client::{ClientConfig, DeviceClient};
pub use error::ClientError;

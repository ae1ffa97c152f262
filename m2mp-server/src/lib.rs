//! # m2mp-server
//!
//! TCP server for M2MP devices.
//!
//! This crate provides:
//! - The per-connection session state machine
//! - Binary (M2MP) and text (ALIP) transports over a shared session core
//! - Settings, commands and liveness supervision
//! - The session table and message bus routing
//! - YAML and environment configuration

pub mod alip;
pub mod bus;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod m2mp;
pub mod sensors;
pub mod server;
pub mod session;
pub mod storage;

pub use alip::AlipTransport;
pub use bus::{BusError, BusMessage, LocalBus, MessageBus};
pub use config::{BusConfig, Config, ConfigError, NetworkConfig, SessionConfig, StorageConfig};
pub use connection::{run_connection, Transport};
pub use crate::core::{Outbound, Services, SessionCore};
pub use error::ServerError;
pub use m2mp::M2mpTransport;
pub use server::{Server, ServerStats, SessionTable};
pub use session::{Session, SessionState};
pub use storage::SamplePersister;

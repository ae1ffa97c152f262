//! Device identifiers.

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

lazy_static! {
    /// `<family>:<serial>`, e.g. `imei:0123456789`.
    static ref IDENT_CONSTRAINT: Regex =
        Regex::new("^[a-z][0-9a-z]{2,6}:[a-zA-Z0-9]{4,20}$").expect("static pattern");
}

/// Returns whether `ident` has the shape devices must use.
pub fn is_valid_ident(ident: &str) -> bool {
    IDENT_CONSTRAINT.is_match(ident)
}

/// Derives the stable device id for an identifier.
pub fn device_id_for(ident: &str) -> Uuid {
    let digest = Sha256::digest(ident.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Time-series key under which a device's samples are stored.
pub fn series_key(id: &Uuid) -> String {
    format!("dev-{id}")
}

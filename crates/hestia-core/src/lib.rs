//! Core traits and types for the Hestia storage gateway.
//!
//! This crate defines the abstractions shared between drivers and the gateway:
//! - `Driver`: the contract every storage backend implements
//! - `User` / `Connection`: the per-user connection registry
//! - `MetadataEntry` / `reconcile`: per-connection observations and the fold
//!   that derives one canonical view per path
//! - `KeyValueStore` / `DriverApi`: namespaced storage handed to drivers

mod driver;
mod error;
mod kv;
mod metadata;
mod page;
mod user;

pub use driver::{
    DeleteRequest, Driver, DriverInfo, DriverInit, DriverSpaceInfo, ListEntry, ListFilesResponse,
    ReadRequest, ReadResult, RegisterOutcome, RegisterRequest, WriteRequest,
};
pub use error::{HestiaError, Result};
pub use kv::{DriverApi, KeyValueStore};
pub use metadata::{hash_content, reconcile, reconcile_rows, EntryState, MetadataEntry, ReconciledView};
pub use page::{paginate, PageResult};
pub use user::{Connection, ConnectionContext, User};

/// Parse a byte size such as `7mb`, `512kb` or `1024`. Zero means unlimited.
pub fn parse_bytes(value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Null => Ok(0),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| HestiaError::malformed(format!("Invalid byte size: {}", n))),
        serde_json::Value::String(s) => parse_byte_str(s),
        other => Err(HestiaError::malformed(format!("Invalid byte size: {}", other))),
    }
}

/// Parse a byte-size string (`b`, `kb`, `mb`, `gb`, `tb`, 1024-based).
pub fn parse_byte_str(s: &str) -> Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let num: f64 = num
        .parse()
        .map_err(|_| HestiaError::malformed(format!("Invalid byte size: {}", s)))?;
    let mult: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        other => {
            return Err(HestiaError::malformed(format!(
                "Unknown byte unit \"{}\"",
                other
            )))
        }
    };
    Ok((num * mult as f64).floor() as u64)
}

//! Random identifiers for request correlation and tunnel rooms.

use rand::RngCore;

/// Correlation id carried by a tunnel request and echoed by its response.
pub type RefId = String;

/// Generate a fresh 128-bit random id rendered as 32 lowercase hex characters.
///
/// Used for refids and for the name and password of each tunnel room.
pub fn fresh_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

//! Link termination classification.
//!
//! Transports report how a link ended so that callers can tell a peer that
//! hung up politely from one that vanished.

use std::fmt;

/// How a link to the hub ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A close frame was exchanged, or the link was closed locally.
    Normal,
    /// The link ended without a closing handshake (EOF, reset, I/O error).
    Abnormal,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => f.write_str("normal closure"),
            CloseReason::Abnormal => f.write_str("abnormal closure"),
        }
    }
}

//! Transport layer for roomhub clients.
//!
//! A link is one WebSocket connection to the hub, direct or through an HTTP
//! proxy. It only knows how to connect, move whole messages, and report how
//! it ended.

pub mod proxy;
pub mod websocket;

pub use proxy::ProxyMode;
pub use websocket::{connect, LinkSink, LinkStream, WsStream};

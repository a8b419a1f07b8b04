//! Hub-side transport: the WebSocket endpoint participants connect to.

pub mod websocket;

pub use websocket::WsOutbound;

//! API exposure modules
//!
//! Each exposure consumes a `RealtimeHost` and produces a Router.

pub mod websocket;

pub use websocket::WebSocketExposure;

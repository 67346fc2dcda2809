//! Room server for a shared, unbounded text canvas.
//!
//! The canvas is cut into fixed-size regions. Clients join a room over a
//! websocket, subscribe to the regions they can see and exchange single-cell
//! edits with everyone else looking at the same regions.

pub mod attachment;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod region;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;
pub mod subscriptions;
pub mod telemetry;
pub mod websocket;

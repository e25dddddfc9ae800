//! Callbridge Relay Library Crate
//!
//! This library contains the web-facing half of the call relay: configuration,
//! the session registry, the WebSocket relay state machine, and routing. The
//! `relay` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;

//! Conductor core library: gateway protocol client and session state engine
//! shared by the CLI and any other front end.
//!
//! A [`gateway::GatewayClient`] keeps one WebSocket connection to the gateway and
//! applies pushed events to a [`session::Store`]; a [`chat::ChatWorkflow`] drives
//! user-initiated operations (sending, history, tab restore) against both.

pub mod cache;
pub mod chat;
pub mod config;
pub mod exec;
pub mod files;
pub mod gateway;
pub mod init;
pub mod message;
pub mod session;

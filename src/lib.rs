//! A WebSocket application hub: multiplexed events, RPC endpoints, and
//! replicated, persisted tables, shared by many connected client apps.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod extensions;
pub mod network;
pub mod server;
pub mod session;
pub mod wire;

pub use config::Config;
pub use server::Server;

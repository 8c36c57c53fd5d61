//! Xzibit bus - local frame relay for screen-sharing development.
//!
//! A stand-in transport that lets several clients on one host talk without a
//! real tunnel: every length-prefixed frame a client sends is rebroadcast,
//! byte for byte, to every other client connected to the socket.
//!
//! # Architecture
//!
//! ```text
//! client A ──┐                        ┌──► client B
//!            │   ┌──────────────┐     │
//! client B ──┼──►│    Relay     │─────┼──► client C
//!            │   │ (event loop) │     │
//! client C ──┘   └──────────────┘     └──► client A
//! ```
//!
//! - [`framing`] - Frame and per-connection FrameBuffer
//! - [`registry`] - Connection bookkeeping
//! - [`broadcast`] - Fan-out to every peer except the origin
//! - [`message`] - Best-effort opcode decoding for the log
//! - [`relay`] - Single-threaded readiness loop tying it together
//! - [`client`] - Bus client
//! - [`config`] - Configuration loading

pub mod broadcast;
pub mod client;
pub mod config;
pub mod framing;
pub mod message;
pub mod registry;
pub mod relay;

// Re-export commonly used types
pub use client::BusClient;
pub use config::Config;
pub use framing::{Frame, FrameBuffer};
pub use message::Message;
pub use relay::Relay;

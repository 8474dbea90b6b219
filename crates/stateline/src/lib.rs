//! Stateline: authoritative state synchronization for game sessions
//!
//! The server holds the authoritative snapshot per player; clients send
//! sparse deltas over encrypted, checksummed envelopes and receive the
//! committed state of everyone sharing their room. This crate wires the
//! state, crypto, net, and store layers into a runnable server and client.

pub mod client;
pub mod room;
pub mod server;

pub use client::{ClientConfig, ClientHandle, ClientSession, Dialer, QuicDialer, SessionEvent};
pub use room::{RoomRegistry, RoomUpdate};
pub use server::{ConnectionTable, PlayerIdToken, Server, ServerConfig, TokenValidator};

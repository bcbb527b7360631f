//! Server-side core of a multi-user, real-time collaborative paint-and-chat
//! room.
//!
//! Clients connect over a WebSocket and exchange JSON events: paint patches,
//! stroke and pointer hints, and chat lines. The [`engine`] task owns the
//! authoritative multi-layer [`Canvas`] and the client [`roster`]; sessions
//! and the [`broker`] peer are producers feeding its command queue. Layer
//! snapshots persist through the [`store`], either to the filesystem or to
//! the same broker that links multiple servers into one room.

pub mod broker;
pub mod canvas;
pub mod codec;
pub mod config;
pub mod engine;
pub mod http;
pub mod network;
pub mod roster;
pub mod session;
pub mod store;

pub use canvas::{Canvas, Layer};

//! Wire protocol for the room.
//!
//! Two boundaries, two vocabularies:
//!
//! - [`message`]: JSON events exchanged with end-user clients over the
//!   socket transport (`client`, `paint`, `stroke`, `pointer`, `chat` in;
//!   `server`, `config`, `client`, `clients`, `chat`, `paint`, `painted`,
//!   `stroke`, `pointer` out).
//! - [`frame`]: JSON frames exchanged between servers of one room over
//!   the pub/sub broker, each carrying the origin server id.

pub mod frame;
pub mod message;

pub use frame::{Channel, Frame, FramePayload};
pub use message::{ClientEvent, ServerEvent};

/// Default port the server listens on.
pub const DEFAULT_PORT: &str = "10133";

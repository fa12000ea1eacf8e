//! # curb-protocol
//!
//! Wire protocol definitions for the Curb trip dispatch engine.
//!
//! This crate defines the binary protocol spoken between Curb clients and
//! servers: the frame types, the wire representations of trips and users,
//! and the length-prefixed MessagePack codec.
//!
//! ## Frame Types
//!
//! - `RequestTrip` - A rider asks for a new trip
//! - `UpdateTrip` - A driver advances an existing trip
//! - `Trip` - Server broadcast of a trip snapshot to a topic
//! - `Ack` / `Error` - Per-request outcomes
//! - `Connect` / `Connected` - Handshake
//! - `Ping` / `Pong` - Keepalive
//!
//! ## Example
//!
//! ```rust
//! use curb_protocol::{codec, Frame};
//!
//! let frame = Frame::request_trip(1, "52 Festive Road", "221B Baker St");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod frames;
pub mod wire;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{code, Frame};
pub use wire::{PublicUser, TripSnapshot, TripStatus};

/// Current protocol version, advertised in the `Connect`/`Connected` handshake.
pub const PROTOCOL_VERSION: u8 = 1;

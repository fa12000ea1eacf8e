//! Frame types for the Curb protocol.
//!
//! Frames are the fundamental unit of communication. Each frame is
//! serialized using MessagePack for efficient binary encoding.
//!
//! Subscriptions are never client-requested: the server subscribes a
//! connection to the topics its role entitles it to, so the protocol has no
//! subscribe/unsubscribe frames. Clients only request or update trips and
//! receive `Trip` broadcasts on the topics they were placed in.

use serde::{Deserialize, Serialize};

use crate::wire::{TripSnapshot, TripStatus};

/// Error codes carried in [`Frame::Error`].
pub mod code {
    /// Malformed payload or illegal status transition.
    pub const VALIDATION: u16 = 1400;
    /// The connection is not authenticated.
    pub const UNAUTHENTICATED: u16 = 1401;
    /// The connection's role does not permit the action.
    pub const UNAUTHORIZED: u16 = 1403;
    /// Unknown trip natural key.
    pub const NOT_FOUND: u16 = 1404;
    /// Subscription limit reached.
    pub const LIMIT: u16 = 1409;
    /// Durable store failure.
    pub const STORE: u16 = 1500;
}

/// A protocol frame.
///
/// Frames are the messages exchanged between clients and servers.
/// Each frame type has specific fields relevant to its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Authentication token.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// A rider requests a new trip.
    #[serde(rename = "request_trip")]
    RequestTrip {
        /// Request ID for acknowledgment.
        id: u64,
        /// Pick-up address.
        pick_up_address: String,
        /// Drop-off address.
        drop_off_address: String,
    },

    /// A driver advances an existing trip.
    #[serde(rename = "update_trip")]
    UpdateTrip {
        /// Request ID for acknowledgment.
        id: u64,
        /// Natural key of the trip to update.
        nk: String,
        /// New status, if changing.
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<TripStatus>,
        /// New pick-up address, if changing.
        #[serde(skip_serializing_if = "Option::is_none")]
        pick_up_address: Option<String>,
        /// New drop-off address, if changing.
        #[serde(skip_serializing_if = "Option::is_none")]
        drop_off_address: Option<String>,
    },

    /// Server broadcast of a trip snapshot to a topic.
    #[serde(rename = "trip")]
    Trip {
        /// Topic the snapshot was published on (a trip nk or `drivers`).
        topic: String,
        /// The trip state after the triggering operation.
        trip: TripSnapshot,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`code`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Name of the frame variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "connect",
            Frame::Connected { .. } => "connected",
            Frame::RequestTrip { .. } => "request_trip",
            Frame::UpdateTrip { .. } => "update_trip",
            Frame::Trip { .. } => "trip",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: Option<String>) -> Self {
        Frame::Connect { version, token }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new RequestTrip frame.
    #[must_use]
    pub fn request_trip(
        id: u64,
        pick_up_address: impl Into<String>,
        drop_off_address: impl Into<String>,
    ) -> Self {
        Frame::RequestTrip {
            id,
            pick_up_address: pick_up_address.into(),
            drop_off_address: drop_off_address.into(),
        }
    }

    /// Create a new UpdateTrip frame carrying only a status change.
    #[must_use]
    pub fn update_status(id: u64, nk: impl Into<String>, status: TripStatus) -> Self {
        Frame::UpdateTrip {
            id,
            nk: nk.into(),
            status: Some(status),
            pick_up_address: None,
            drop_off_address: None,
        }
    }

    /// Create a new Trip broadcast frame.
    #[must_use]
    pub fn trip(topic: impl Into<String>, trip: TripSnapshot) -> Self {
        Frame::Trip {
            topic: topic.into(),
            trip,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

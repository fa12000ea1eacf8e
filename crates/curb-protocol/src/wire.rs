//! Wire representations of trips and users.
//!
//! These are the JSON-compatible objects carried inside frames and returned
//! by the read-only HTTP API. Timestamps serialize as ISO-8601.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a trip.
///
/// The derived ordering is the legal direction of travel: a trip may only
/// move towards `Completed`, never back.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    /// Rider has requested the trip; no driver yet.
    Requested,
    /// A driver has picked up the trip.
    Started,
    /// The trip is finished. Terminal.
    Completed,
}

impl TripStatus {
    /// Wire string for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::Started => "started",
            TripStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public view of a user, safe to embed in broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    /// User identifier.
    pub id: u64,
    /// Username. Read-only on the wire.
    pub username: String,
    /// Role names the user belongs to (`"driver"`, `"rider"`).
    pub groups: Vec<String>,
}

/// Canonical wire form of a trip, as broadcast to topics and served over HTTP.
///
/// `nk`, `created`, and `updated` are server-assigned and read-only to
/// clients; client frames never carry them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSnapshot {
    /// Natural key: stable, externally visible trip identifier.
    pub nk: String,
    /// Pick-up address.
    pub pick_up_address: String,
    /// Drop-off address.
    pub drop_off_address: String,
    /// Current status.
    pub status: TripStatus,
    /// The rider who owns the trip.
    pub rider: Option<PublicUser>,
    /// The driver assigned to the trip, if any.
    pub driver: Option<PublicUser>,
    /// When the trip was created.
    pub created: DateTime<Utc>,
    /// When the trip was last updated.
    pub updated: DateTime<Utc>,
}

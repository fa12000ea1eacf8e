//! # curb-core
//!
//! Domain model, trip store, and subscription broadcast engine for Curb.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Trip** - The trip entity and its one-way state machine
//! - **TripStore** - Durable CRUD storage seam with per-key update exclusion
//! - **Topic** - Broadcast channel per trip, plus the global `drivers` topic
//! - **SubscriptionRegistry** - Topic membership and event fan-out
//! - **ConnectionSession** - Per-connection identity, role, and lifecycle
//! - **Dispatcher** - Orchestration: persist, subscribe, broadcast
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│  Dispatcher │────▶│  TripStore  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │────▶│   Topic     │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod dispatch;
pub mod event;
pub mod registry;
pub mod session;
pub mod store;
pub mod topic;
pub mod trip;
pub mod user;

pub use dispatch::{DispatchError, Dispatcher};
pub use event::TripEvent;
pub use registry::{RegistryConfig, RegistryError, SubscriptionRegistry, TopicReceiver};
pub use session::{ConnectionSession, SessionError, SessionState};
pub use store::{MemoryTripStore, StoreError, TripStore};
pub use topic::{Topic, TopicId, DRIVERS_TOPIC};
pub use trip::{Trip, TripChange, TripError};
pub use user::{Role, User};

//! Connection sessions.
//!
//! A session binds one transport connection to an authenticated user and a
//! role profile. The profile is chosen once, at connect time, by the
//! endpoint the client dialed; it is never re-evaluated per message.
//!
//! Lifecycle: `Connecting -> AuthenticatedIdle -> Subscribed -> Closed`,
//! strictly forward. Reconnection means a new session.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::topic::TopicId;
use crate::user::{Role, User};

/// Lifecycle state of a connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport handshake done, credentials not yet checked.
    Connecting,
    /// User authenticated, not yet placed in any topic.
    AuthenticatedIdle,
    /// Bulk subscription at connect has run.
    Subscribed,
    /// Torn down. Terminal.
    Closed,
}

/// Session lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is not in the state the operation requires.
    #[error("Session {id} is {actual:?}, expected {expected:?}")]
    WrongState {
        /// Session identifier.
        id: String,
        /// State the operation requires.
        expected: SessionState,
        /// State the session is in.
        actual: SessionState,
    },

    /// The user does not hold the role of the endpoint it connected on.
    #[error("User {username} does not hold the {role} role")]
    RoleMismatch {
        /// Username of the offending user.
        username: String,
        /// Role the endpoint demands.
        role: Role,
    },
}

/// Per-connection state: identity, role profile, and subscribed topics.
#[derive(Debug)]
pub struct ConnectionSession {
    id: String,
    user: User,
    role: Role,
    state: SessionState,
    topics: HashSet<TopicId>,
}

impl ConnectionSession {
    /// Start a session for a user connecting with the given role profile.
    #[must_use]
    pub fn connecting(user: User, role: Role) -> Self {
        Self {
            id: format!("conn-{}", Uuid::new_v4().simple()),
            user,
            role,
            state: SessionState::Connecting,
            topics: HashSet::new(),
        }
    }

    /// Complete authentication: verifies the user holds the endpoint's role.
    ///
    /// # Errors
    ///
    /// Returns an error if the session already advanced or the user lacks
    /// the role.
    pub fn authenticate(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Connecting)?;
        if !self.user.has_role(self.role) {
            return Err(SessionError::RoleMismatch {
                username: self.user.username.clone(),
                role: self.role,
            });
        }
        self.state = SessionState::AuthenticatedIdle;
        debug!(session = %self.id, user = %self.user.username, role = %self.role, "Session authenticated");
        Ok(())
    }

    /// Record the bulk-subscription step as done.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not `AuthenticatedIdle`.
    pub fn mark_subscribed(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::AuthenticatedIdle)?;
        self.state = SessionState::Subscribed;
        Ok(())
    }

    /// Tear the session down. Idempotent; the topic set is cleared, the
    /// registry-side cleanup is the dispatcher's job.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!(session = %self.id, "Session closed");
        }
        self.state = SessionState::Closed;
        self.topics.clear();
    }

    /// Track a topic this session was subscribed to.
    pub(crate) fn track_topic(&mut self, topic: impl Into<TopicId>) {
        self.topics.insert(topic.into());
    }

    /// Session identifier, used as the registry's connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The authenticated user.
    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// The role profile chosen at connect.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Topics this session is subscribed to.
    #[must_use]
    pub fn topics(&self) -> &HashSet<TopicId> {
        &self.topics
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::WrongState {
                id: self.id.clone(),
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rider() -> User {
        User::new(1, "rider@example.com", vec![Role::Rider])
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut session = ConnectionSession::connecting(rider(), Role::Rider);
        assert_eq!(session.state(), SessionState::Connecting);

        session.authenticate().unwrap();
        assert_eq!(session.state(), SessionState::AuthenticatedIdle);

        session.mark_subscribed().unwrap();
        assert_eq!(session.state(), SessionState::Subscribed);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_role_mismatch_rejected() {
        let mut session = ConnectionSession::connecting(rider(), Role::Driver);
        assert_eq!(
            session.authenticate(),
            Err(SessionError::RoleMismatch {
                username: "rider@example.com".into(),
                role: Role::Driver,
            })
        );
    }

    #[test]
    fn test_no_transition_out_of_closed() {
        let mut session = ConnectionSession::connecting(rider(), Role::Rider);
        session.authenticate().unwrap();
        session.close();

        assert!(session.mark_subscribed().is_err());
        session.close(); // idempotent
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_clears_topics() {
        let mut session = ConnectionSession::connecting(rider(), Role::Rider);
        session.authenticate().unwrap();
        session.track_topic("aaaa");
        assert_eq!(session.topics().len(), 1);

        session.close();
        assert!(session.topics().is_empty());
    }

    #[test]
    fn test_session_ids_unique() {
        let a = ConnectionSession::connecting(rider(), Role::Rider);
        let b = ConnectionSession::connecting(rider(), Role::Rider);
        assert_ne!(a.id(), b.id());
    }
}

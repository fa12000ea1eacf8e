//! Users and their roles.
//!
//! Users are provisioned externally; this crate only reads them. A user can
//! hold both roles in the model, but exactly one is meaningful per
//! connection (chosen by the endpoint it connects on) and per trip.

use curb_protocol::PublicUser;
use serde::{Deserialize, Serialize};

/// A capability a user holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts and advances trips.
    Driver,
    /// Requests trips.
    Rider,
}

impl Role {
    /// Wire name of the role, as it appears in a user's `groups`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Rider => "rider",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driver" => Ok(Role::Driver),
            "rider" => Ok(Role::Rider),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier.
    pub id: u64,
    /// Username.
    pub username: String,
    /// Roles the user holds.
    pub roles: Vec<Role>,
}

impl User {
    /// Create a new user.
    #[must_use]
    pub fn new(id: u64, username: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            id,
            username: username.into(),
            roles,
        }
    }

    /// Check whether the user holds a role.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Project the public wire view of this user.
    #[must_use]
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            groups: self.roles.iter().map(|r| r.as_str().to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip() {
        assert_eq!("driver".parse::<Role>().unwrap(), Role::Driver);
        assert_eq!("rider".parse::<Role>().unwrap(), Role::Rider);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_public_projection() {
        let user = User::new(7, "driver@example.com", vec![Role::Driver, Role::Rider]);
        let public = user.public();
        assert_eq!(public.id, 7);
        assert_eq!(public.username, "driver@example.com");
        assert_eq!(public.groups, vec!["driver", "rider"]);
    }

    #[test]
    fn test_has_role() {
        let user = User::new(1, "rider@example.com", vec![Role::Rider]);
        assert!(user.has_role(Role::Rider));
        assert!(!user.has_role(Role::Driver));
    }
}

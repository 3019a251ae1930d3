use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a persisted conversation thread.
///
/// Also used as the key of the in-memory session map, so one thread maps to
/// exactly one live chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User role hierarchy: admin > user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [UserRole::Admin, UserRole::User] {
            let parsed: UserRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("child".parse::<UserRole>().is_err());
    }

    #[test]
    fn ids_are_time_sortable() {
        let a = ThreadId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ThreadId::new();
        assert!(a.0 < b.0);
    }
}

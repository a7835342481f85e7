use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_ID: &str = "anonymous";

/// Identity a request is executed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: true,
        }
    }

    /// Resolves a caller from an optional user id header value and the
    /// configured admin list.
    pub fn resolve(user_id: Option<&str>, admin_users: &[String]) -> Self {
        let user_id = user_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_USER_ID);
        Self {
            user_id: user_id.to_string(),
            admin: admin_users.iter().any(|admin| admin == user_id),
        }
    }

    pub fn can_access(&self, owner: &str) -> bool {
        self.admin || self.user_id == owner
    }

    /// Creator filter applied to searches: admins see everything.
    pub fn owner_filter(&self) -> Option<&str> {
        if self.admin {
            None
        } else {
            Some(self.user_id.as_str())
        }
    }
}

//! Collaborator roles and the guards built on them

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role a user holds on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Whether the role may append update fragments or rename the document
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    /// Whether the role may add, change or remove collaborators and delete the document
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Owner)
    }

    /// Whether the role may see the collaborator list
    pub fn can_list_collaborators(&self) -> bool {
        !matches!(self, Role::Viewer)
    }

    /// Roles an owner may hand out to other users
    pub fn is_grantable(&self) -> bool {
        matches!(self, Role::Editor | Role::Viewer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(Error::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

/// Permission change pushed to the sync service.
///
/// `None` is the revocation signal and is sent as the literal role `"none"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionChange(pub Option<Role>);

impl PermissionChange {
    pub fn granted(role: Role) -> Self {
        Self(Some(role))
    }

    pub fn revoked() -> Self {
        Self(None)
    }

    pub fn as_str(&self) -> &'static str {
        self.0.map_or("none", |role| role.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_guard() {
        assert!(Role::Owner.can_write());
        assert!(Role::Editor.can_write());
        assert!(!Role::Viewer.can_write());
    }

    #[test]
    fn test_manage_guard() {
        assert!(Role::Owner.can_manage());
        assert!(!Role::Editor.can_manage());
        assert!(!Role::Owner.is_grantable());
        assert!(Role::Viewer.is_grantable());
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!("Editor".parse::<Role>().unwrap(), Role::Editor);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::Viewer).unwrap(), "\"viewer\"");
    }

    #[test]
    fn test_permission_change_labels() {
        assert_eq!(PermissionChange::granted(Role::Editor).as_str(), "editor");
        assert_eq!(PermissionChange::revoked().as_str(), "none");
    }
}

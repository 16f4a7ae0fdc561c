//! User Directory collaborator: user lookup, roles, and permissions.
//!
//! The directory owns user records; this service never mutates them beyond
//! the security-profile fields held in the credential store. Roles and
//! permissions are closed enumerations checked through a static membership
//! table, so a typo cannot become a silent authorization bypass.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Member,
    ReadOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageUsers,
    ManageAccounts,
    ManageBudgets,
    ViewReports,
    ExportData,
}

impl Role {
    /// Static role → permission membership table.
    #[must_use]
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Admin => &[
                Permission::ManageUsers,
                Permission::ManageAccounts,
                Permission::ManageBudgets,
                Permission::ViewReports,
                Permission::ExportData,
            ],
            Role::Manager => &[
                Permission::ManageAccounts,
                Permission::ManageBudgets,
                Permission::ViewReports,
                Permission::ExportData,
            ],
            Role::Member => &[
                Permission::ManageBudgets,
                Permission::ViewReports,
                Permission::ExportData,
            ],
            Role::ReadOnly => &[Permission::ViewReports],
        }
    }

    #[must_use]
    pub fn has_permission(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// User record as the directory exposes it, including the stored credential
/// hash the directory holds on our behalf.
#[derive(Clone, Debug)]
pub struct DirectoryUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
    pub is_active: bool,
    pub password_hash: String,
}

/// Read-only lookup into the external user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<DirectoryUser>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<DirectoryUser>>;
    async fn get_users_by_role(&self, role: Role) -> Result<Vec<DirectoryUser>>;
}

/// Normalize an email for lookup: trim and lowercase.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Look up a user and require them to be active, collapsing "not found" and
/// "inactive" into the same generic failure.
pub(crate) async fn require_active_user(
    directory: &dyn UserDirectory,
    id: Uuid,
) -> Result<DirectoryUser> {
    match directory.get_user_by_id(id).await? {
        Some(user) if user.is_active => Ok(user),
        _ => Err(AuthError::AuthenticationFailed),
    }
}

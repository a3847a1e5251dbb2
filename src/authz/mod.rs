//! Authorization: permission evaluation and the gating policies applied to
//! administrative operations.
//!
//! Two independent gating strategies coexist and are both load-bearing:
//! role-family endpoints check for the coarse `Admin` role, permission-family
//! endpoints check for the fine-grained `ManagePermissions` capability. Callers
//! depend on each independently, so they stay separate `Policy` variants.

mod evaluator;

pub use evaluator::{has_permission, is_admin, require, user_role_ids};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// The reserved permission names the core treats specially. The store may hold
/// additional administrator-created permissions; those are addressed by id or
/// raw name, never dispatched on inside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionName {
    Create,
    Read,
    Update,
    Delete,
    ManagePermissions,
}

impl PermissionName {
    pub const ALL: [PermissionName; 5] = [
        PermissionName::Create,
        PermissionName::Read,
        PermissionName::Update,
        PermissionName::Delete,
        PermissionName::ManagePermissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionName::Create => "Create",
            PermissionName::Read => "Read",
            PermissionName::Update => "Update",
            PermissionName::Delete => "Delete",
            PermissionName::ManagePermissions => "ManagePermissions",
        }
    }
}

impl fmt::Display for PermissionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(PermissionName::Create),
            "Read" => Ok(PermissionName::Read),
            "Update" => Ok(PermissionName::Update),
            "Delete" => Ok(PermissionName::Delete),
            "ManagePermissions" => Ok(PermissionName::ManagePermissions),
            other => Err(AppError::bad_request(format!(
                "unknown permission name: {other}"
            ))),
        }
    }
}

/// Reserved role names: `Admin` gates role administration, `Manager` is the
/// default role granted at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleName {
    Admin,
    Manager,
}

impl RoleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleName::Admin => "Admin",
            RoleName::Manager => "Manager",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Admin" => Ok(RoleName::Admin),
            "Manager" => Ok(RoleName::Manager),
            other => Err(AppError::bad_request(format!("unknown role name: {other}"))),
        }
    }
}

/// A gating policy attached to an administrative operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Coarse check: the actor holds a non-deleted role named `Admin`.
    AdminRole,
    /// Fine-grained check: some role held by the actor grants the permission.
    Permission(PermissionName),
}

use sqlx::SqlitePool;
use uuid::Uuid;

use super::{Policy, RoleName};
use crate::errors::AppError;

/// Resolve the role ids held by a user, excluding soft-deleted roles. Unknown
/// and soft-deleted users simply resolve to the empty set.
pub async fn user_role_ids(pool: &SqlitePool, user_id: Uuid) -> sqlx::Result<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT ur.role_id
        FROM user_roles ur
        INNER JOIN roles r ON r.id = ur.role_id
        INNER JOIN users u ON u.id = ur.user_id
        WHERE ur.user_id = ? AND r.deleted_at IS NULL AND u.deleted_at IS NULL
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(ids
        .iter()
        .filter_map(|id| Uuid::parse_str(id).ok())
        .collect())
}

/// Decide whether `user_id` holds `permission_name` through any of its roles.
///
/// Deliberately uncached: administrators change assignments between one action
/// and the next, and every decision must see the latest join-table state.
/// Unknown users, soft-deleted users and unknown permission names all fail
/// closed to `false`.
pub async fn has_permission(
    pool: &SqlitePool,
    user_id: Uuid,
    permission_name: &str,
) -> sqlx::Result<bool> {
    let granted: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(1)
        FROM role_permissions rp
        INNER JOIN roles r ON r.id = rp.role_id
        INNER JOIN user_roles ur ON ur.role_id = rp.role_id
        INNER JOIN users u ON u.id = ur.user_id
        INNER JOIN permissions p ON p.id = rp.permission_id
        WHERE ur.user_id = ? AND p.name = ?
          AND r.deleted_at IS NULL AND u.deleted_at IS NULL
        "#,
    )
    .bind(user_id.to_string())
    .bind(permission_name)
    .fetch_one(pool)
    .await?;

    Ok(granted > 0)
}

/// Coarse policy: does a non-deleted user hold a non-deleted role named
/// `Admin`? A soft-deleted account keeps its assignment history but loses the
/// standing it conferred.
pub async fn is_admin(pool: &SqlitePool, user_id: Uuid) -> sqlx::Result<bool> {
    let held: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(1)
        FROM user_roles ur
        INNER JOIN roles r ON r.id = ur.role_id
        INNER JOIN users u ON u.id = ur.user_id
        WHERE ur.user_id = ? AND r.name = ?
          AND r.deleted_at IS NULL AND u.deleted_at IS NULL
        "#,
    )
    .bind(user_id.to_string())
    .bind(RoleName::Admin.as_str())
    .fetch_one(pool)
    .await?;

    Ok(held > 0)
}

/// Enforce a policy for an actor, returning `Forbidden` on denial. Called by
/// every mutating administrative handler before it touches the store.
pub async fn require(pool: &SqlitePool, actor_id: Uuid, policy: Policy) -> Result<(), AppError> {
    let allowed = match policy {
        Policy::AdminRole => is_admin(pool, actor_id).await?,
        Policy::Permission(name) => has_permission(pool, actor_id, name.as_str()).await?,
    };

    if allowed {
        return Ok(());
    }

    tracing::debug!(actor_id = %actor_id, policy = ?policy, "authorization denied");

    match policy {
        Policy::AdminRole => Err(AppError::forbidden(
            "access denied: Admin role required",
        )),
        Policy::Permission(name) => Err(AppError::forbidden(format!(
            "access denied: missing permission {name}"
        ))),
    }
}

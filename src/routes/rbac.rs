//! Role administration endpoints.
//!
//! Two gating policies are in force, deliberately not unified: role-family
//! mutations require the coarse `Admin` role, permission-family mutations the
//! fine-grained `ManagePermissions` capability. Read-only projections are open
//! to any authenticated actor and return empty collections when nothing
//! matches. Every mutation is written to the activity log.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{self, PermissionName, Policy};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::models::rbac::*;
use crate::models::user::AssignedRole;
use crate::utils::utc_now;

// =============================================================================
// ROLES
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/roles",
    tag = "RBAC",
    responses((status = 200, description = "List of active roles", body = [Role])),
    security(("bearerAuth" = []))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<Role>>> {
    let roles = sqlx::query_as::<_, DbRole>(
        "SELECT id, name, created_at, updated_at, deleted_at FROM roles WHERE deleted_at IS NULL ORDER BY name",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(roles.into_iter().map(Role::from).collect()))
}

#[utoipa::path(
    post,
    path = "/rbac/roles",
    tag = "RBAC",
    request_body = RoleCreateRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 403, description = "Actor does not hold the Admin role"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<RoleCreateRequest>,
) -> AppResult<(StatusCode, Json<Role>)> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("role name must not be empty"));
    }

    let id = Uuid::new_v4();
    let now = utc_now();

    sqlx::query("INSERT INTO roles (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(req.name.trim())
        .bind(now)
        .bind(now)
        .execute(&state.pool)
        .await?;

    let role = Role {
        id,
        name: req.name.trim().to_string(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &role,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(role)))
}

#[utoipa::path(
    put,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    request_body = RoleUpdateRequest,
    responses(
        (status = 200, description = "Role updated", body = Role),
        (status = 404, description = "Role not found or already deleted"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Json(req): Json<RoleUpdateRequest>,
) -> AppResult<Json<Role>> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("role name must not be empty"));
    }

    let old = fetch_active_role(&state.pool, role_id).await?;

    let now = utc_now();
    sqlx::query("UPDATE roles SET name = ?, updated_at = ? WHERE id = ?")
        .bind(req.name.trim())
        .bind(now)
        .bind(role_id.to_string())
        .execute(&state.pool)
        .await?;

    let role = Role {
        id: role_id,
        name: req.name.trim().to_string(),
        created_at: old.created_at,
        updated_at: now,
        deleted_at: None,
    };

    log_activity_with_context(
        &state.event_bus,
        "updated",
        Some(auth.user_id),
        &role,
        Some(&Role::from(old)),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(role))
}

#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 204, description = "Role soft-deleted; its assignment history is kept"),
        (status = 404, description = "Role not found or already deleted"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let role = fetch_active_role(&state.pool, role_id).await?;

    // Soft delete only: join rows in user_roles/role_permissions stay behind
    // as history, but the evaluator stops honoring them immediately.
    sqlx::query("UPDATE roles SET deleted_at = ?, updated_at = ? WHERE id = ?")
        .bind(utc_now())
        .bind(utc_now())
        .bind(role_id.to_string())
        .execute(&state.pool)
        .await?;

    log_activity_with_context(
        &state.event_bus,
        "deleted",
        Some(auth.user_id),
        &Role::from(role),
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// PERMISSIONS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/permissions",
    tag = "RBAC",
    responses((status = 200, description = "List of permissions", body = [Permission])),
    security(("bearerAuth" = []))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<Permission>>> {
    let permissions = sqlx::query_as::<_, DbPermission>(
        "SELECT id, name, description, created_at, updated_at FROM permissions ORDER BY name",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(permissions.into_iter().map(Permission::from).collect()))
}

#[utoipa::path(
    post,
    path = "/rbac/permissions",
    tag = "RBAC",
    request_body = PermissionCreateRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 403, description = "Actor lacks ManagePermissions"),
        (status = 409, description = "Permission name already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<PermissionCreateRequest>,
) -> AppResult<(StatusCode, Json<Permission>)> {
    authz::require(
        &state.pool,
        auth.user_id,
        Policy::Permission(PermissionName::ManagePermissions),
    )
    .await?;

    if req.name.trim().is_empty() {
        return Err(AppError::bad_request("permission name must not be empty"));
    }

    let id = Uuid::new_v4();
    let now = utc_now();

    sqlx::query(
        "INSERT INTO permissions (id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(req.name.trim())
    .bind(&req.description)
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await
    .map_err(AppError::from)
    .map_err(|e| e.on_unique_violation("permission name already exists"))?;

    let permission = Permission {
        id,
        name: req.name.trim().to_string(),
        description: req.description,
        created_at: now,
        updated_at: now,
    };

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &permission,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(permission)))
}

#[utoipa::path(
    post,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    request_body = AssignPermissionsToRoleRequest,
    responses(
        (status = 201, description = "Permissions assigned (already-held pairs skipped)"),
        (status = 404, description = "Role or a referenced permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_permissions_to_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Json(req): Json<AssignPermissionsToRoleRequest>,
) -> AppResult<StatusCode> {
    authz::require(
        &state.pool,
        auth.user_id,
        Policy::Permission(PermissionName::ManagePermissions),
    )
    .await?;

    fetch_active_role(&state.pool, role_id).await?;

    let now = utc_now();
    for permission_id in &req.permission_ids {
        ensure_permission_exists(&state.pool, *permission_id).await?;

        // Idempotent by the UNIQUE(role_id, permission_id) constraint:
        // re-assigning an already-held permission is a no-op, not an error.
        sqlx::query(
            "INSERT OR IGNORE INTO role_permissions (id, role_id, permission_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(role_id.to_string())
        .bind(permission_id.to_string())
        .bind(now)
        .execute(&state.pool)
        .await?;

        let assignment = RolePermission {
            role_id,
            permission_id: *permission_id,
            created_at: now,
        };

        log_activity_with_context(
            &state.event_bus,
            "assigned",
            Some(auth.user_id),
            &assignment,
            None,
            Some(RequestContext::from_headers(&headers)),
        );
    }

    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role id")),
    responses((status = 200, description = "Permissions assigned to the role", body = [Permission])),
    security(("bearerAuth" = []))
)]
pub async fn get_role_permissions(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> AppResult<Json<Vec<Permission>>> {
    let permissions = sqlx::query_as::<_, DbPermission>(
        r#"
        SELECT p.id, p.name, p.description, p.created_at, p.updated_at
        FROM permissions p
        INNER JOIN role_permissions rp ON p.id = rp.permission_id
        WHERE rp.role_id = ?
        ORDER BY p.name
        "#,
    )
    .bind(role_id.to_string())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(permissions.into_iter().map(Permission::from).collect()))
}

#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}/permissions/{permission_id}",
    tag = "RBAC",
    params(
        ("role_id" = Uuid, Path, description = "Role id"),
        ("permission_id" = Uuid, Path, description = "Permission id"),
    ),
    responses(
        (status = 204, description = "Permission removed from role"),
        (status = 404, description = "Pair was never assigned"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn remove_permission_from_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((role_id, permission_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    authz::require(
        &state.pool,
        auth.user_id,
        Policy::Permission(PermissionName::ManagePermissions),
    )
    .await?;

    let result = sqlx::query(
        "DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?",
    )
    .bind(role_id.to_string())
    .bind(permission_id.to_string())
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("permission not assigned to this role"));
    }

    let assignment = RolePermission {
        role_id,
        permission_id,
        created_at: utc_now(),
    };

    log_activity_with_context(
        &state.event_bus,
        "revoked",
        Some(auth.user_id),
        &assignment,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/rbac/role-permissions",
    tag = "RBAC",
    responses((status = 200, description = "Every role-permission mapping", body = [RolePermissionView])),
    security(("bearerAuth" = []))
)]
pub async fn get_all_role_permissions(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<RolePermissionView>>> {
    let rows = sqlx::query(
        r#"
        SELECT rp.id AS role_permission_id, r.id AS role_id, r.name AS role_name,
               p.id AS permission_id, p.name AS permission_name
        FROM role_permissions rp
        INNER JOIN roles r ON r.id = rp.role_id
        INNER JOIN permissions p ON p.id = rp.permission_id
        ORDER BY r.name, p.name
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    let mappings = rows
        .iter()
        .map(|row| {
            Ok(RolePermissionView {
                role_permission_id: parse_uuid(row.get("role_permission_id"))?,
                role_id: parse_uuid(row.get("role_id"))?,
                role_name: row.get("role_name"),
                permission_id: parse_uuid(row.get("permission_id"))?,
                permission_name: row.get("permission_name"),
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(Json(mappings))
}

// =============================================================================
// USER-ROLE ASSIGNMENTS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses((status = 200, description = "Roles assigned to the user", body = [AssignedRole])),
    security(("bearerAuth" = []))
)]
pub async fn get_user_roles(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Vec<AssignedRole>>> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.name
        FROM roles r
        INNER JOIN user_roles ur ON r.id = ur.role_id
        WHERE ur.user_id = ? AND r.deleted_at IS NULL
        ORDER BY ur.created_at
        "#,
    )
    .bind(user_id.to_string())
    .fetch_all(&state.pool)
    .await?;

    let roles = rows
        .iter()
        .map(|row| {
            Ok(AssignedRole {
                role_id: parse_uuid(row.get("id"))?,
                role_name: row.get("name"),
            })
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok(Json(roles))
}

#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "Target user id")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned"),
        (status = 404, description = "User or role not found"),
        (status = 409, description = "Role already assigned to the user"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_role_to_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> AppResult<StatusCode> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    ensure_user_exists(&state.pool, user_id).await?;
    fetch_active_role(&state.pool, req.role_id).await?;

    let now = utc_now();

    // The UNIQUE(user_id, role_id) constraint is the real guard; two
    // concurrent assignments resolve to one row and one Conflict.
    sqlx::query("INSERT INTO user_roles (id, user_id, role_id, created_at) VALUES (?, ?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.to_string())
        .bind(req.role_id.to_string())
        .bind(now)
        .execute(&state.pool)
        .await
        .map_err(AppError::from)
        .map_err(|e| e.on_unique_violation("role already assigned to the user"))?;

    let assignment = UserRole {
        user_id,
        role_id: req.role_id,
        created_at: now,
    };

    log_activity_with_context(
        &state.event_bus,
        "assigned",
        Some(auth.user_id),
        &assignment,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::CREATED)
}

#[utoipa::path(
    delete,
    path = "/rbac/users/{user_id}/roles/{role_id}",
    tag = "RBAC",
    params(
        ("user_id" = Uuid, Path, description = "Target user id"),
        ("role_id" = Uuid, Path, description = "Role id"),
    ),
    responses(
        (status = 204, description = "Role removed from the user"),
        (status = 404, description = "Role is not assigned to the user"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_role_from_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let result = sqlx::query("DELETE FROM user_roles WHERE user_id = ? AND role_id = ?")
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("role is not assigned to the user"));
    }

    let assignment = UserRole {
        user_id,
        role_id,
        created_at: utc_now(),
    };

    log_activity_with_context(
        &state.event_bus,
        "revoked",
        Some(auth.user_id),
        &assignment,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// HELPERS
// =============================================================================

async fn fetch_active_role(pool: &SqlitePool, role_id: Uuid) -> AppResult<DbRole> {
    sqlx::query_as::<_, DbRole>(
        "SELECT id, name, created_at, updated_at, deleted_at FROM roles WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(role_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("role not found or already deleted"))
}

async fn ensure_user_exists(pool: &SqlitePool, user_id: Uuid) -> AppResult<()> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(1) FROM users WHERE id = ? AND deleted_at IS NULL")
            .bind(user_id.to_string())
            .fetch_one(pool)
            .await?;

    if count == 0 {
        return Err(AppError::not_found("user not found"));
    }

    Ok(())
}

async fn ensure_permission_exists(pool: &SqlitePool, permission_id: Uuid) -> AppResult<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM permissions WHERE id = ?")
        .bind(permission_id.to_string())
        .fetch_one(pool)
        .await?;

    if count == 0 {
        return Err(AppError::not_found(format!(
            "permission {permission_id} not found"
        )));
    }

    Ok(())
}

pub(crate) fn parse_uuid(raw: String) -> AppResult<Uuid> {
    Uuid::parse_str(&raw).map_err(|err| AppError::internal(format!("malformed uuid in store: {err}")))
}

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{self, PermissionName, Policy};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::models::menu::{
    build_menu_tree, AssignPermissionsToMenuRequest, DbMenu, Menu, MenuCreateRequest, MenuNode,
    MenuUpdateRequest,
};
use crate::utils::utc_now;

#[utoipa::path(
    get,
    path = "/menus/me",
    tag = "Menus",
    responses((status = 200, description = "Permission-filtered menu tree for the actor", body = [MenuNode])),
    security(("bearerAuth" = []))
)]
pub async fn my_menu(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<MenuNode>>> {
    // A menu is visible when ANY permission gating it is granted through any
    // of the actor's roles. Unknown actors fall through to an empty tree.
    let visible = sqlx::query_as::<_, DbMenu>(
        r#"
        SELECT DISTINCT m.id, m.title, m.icon, m.path, m.sort_order, m.parent_menu_id, m.created_at, m.updated_at
        FROM menus m
        INNER JOIN menu_permissions mp ON mp.menu_id = m.id
        INNER JOIN role_permissions rp ON rp.permission_id = mp.permission_id
        INNER JOIN roles r ON r.id = rp.role_id
        INNER JOIN user_roles ur ON ur.role_id = rp.role_id
        INNER JOIN users u ON u.id = ur.user_id
        WHERE ur.user_id = ? AND r.deleted_at IS NULL AND u.deleted_at IS NULL
        "#,
    )
    .bind(auth.user_id.to_string())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(build_menu_tree(visible)))
}

#[utoipa::path(
    get,
    path = "/menus",
    tag = "Menus",
    responses((status = 200, description = "Flat list of all menus", body = [Menu])),
    security(("bearerAuth" = []))
)]
pub async fn list_menus(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AppResult<Json<Vec<Menu>>> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let menus = sqlx::query_as::<_, DbMenu>(
        "SELECT id, title, icon, path, sort_order, parent_menu_id, created_at, updated_at FROM menus ORDER BY sort_order IS NULL, sort_order",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(menus.into_iter().map(Menu::from).collect()))
}

#[utoipa::path(
    post,
    path = "/menus",
    tag = "Menus",
    request_body = MenuCreateRequest,
    responses(
        (status = 201, description = "Menu created", body = Menu),
        (status = 404, description = "Parent menu not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_menu(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<MenuCreateRequest>,
) -> AppResult<(StatusCode, Json<Menu>)> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    if let Some(parent_id) = req.parent_menu_id {
        ensure_menu_exists(&state.pool, parent_id).await?;
    }

    let id = Uuid::new_v4();
    let now = utc_now();

    sqlx::query(
        "INSERT INTO menus (id, title, icon, path, sort_order, parent_menu_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(&req.title)
    .bind(&req.icon)
    .bind(&req.path)
    .bind(req.sort_order)
    .bind(req.parent_menu_id.map(|p| p.to_string()))
    .bind(now)
    .bind(now)
    .execute(&state.pool)
    .await?;

    let menu = Menu {
        id,
        title: req.title,
        icon: req.icon,
        path: req.path,
        sort_order: req.sort_order,
        parent_menu_id: req.parent_menu_id,
        created_at: now,
        updated_at: now,
    };

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &menu,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((StatusCode::CREATED, Json(menu)))
}

#[utoipa::path(
    put,
    path = "/menus/{menu_id}",
    tag = "Menus",
    params(("menu_id" = Uuid, Path, description = "Menu id")),
    request_body = MenuUpdateRequest,
    responses(
        (status = 200, description = "Menu updated", body = Menu),
        (status = 400, description = "Reparenting would create a cycle"),
        (status = 404, description = "Menu or new parent not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn update_menu(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(menu_id): Path<Uuid>,
    Json(req): Json<MenuUpdateRequest>,
) -> AppResult<Json<Menu>> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let old = fetch_menu(&state.pool, menu_id).await?;
    let mut menu = old.clone();

    if let Some(title) = req.title {
        menu.title = title;
    }
    if req.icon.is_some() {
        menu.icon = req.icon;
    }
    if req.path.is_some() {
        menu.path = req.path;
    }
    if req.sort_order.is_some() {
        menu.sort_order = req.sort_order;
    }
    if req.clear_parent {
        menu.parent_menu_id = None;
    } else if let Some(parent_id) = req.parent_menu_id {
        ensure_menu_exists(&state.pool, parent_id).await?;
        ensure_no_cycle(&state.pool, menu_id, parent_id).await?;
        menu.parent_menu_id = Some(parent_id);
    }

    let now = utc_now();
    menu.updated_at = now;

    sqlx::query(
        "UPDATE menus SET title = ?, icon = ?, path = ?, sort_order = ?, parent_menu_id = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&menu.title)
    .bind(&menu.icon)
    .bind(&menu.path)
    .bind(menu.sort_order)
    .bind(menu.parent_menu_id.map(|p| p.to_string()))
    .bind(now)
    .bind(menu_id.to_string())
    .execute(&state.pool)
    .await?;

    let updated = Menu::from(menu);

    log_activity_with_context(
        &state.event_bus,
        "updated",
        Some(auth.user_id),
        &updated,
        Some(&Menu::from(old)),
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(Json(updated))
}

#[utoipa::path(
    post,
    path = "/menus/{menu_id}/permissions",
    tag = "Menus",
    params(("menu_id" = Uuid, Path, description = "Menu id")),
    request_body = AssignPermissionsToMenuRequest,
    responses(
        (status = 201, description = "Permissions now gate the menu (already-held pairs skipped)"),
        (status = 404, description = "Menu or a referenced permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_permissions_to_menu(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(menu_id): Path<Uuid>,
    Json(req): Json<AssignPermissionsToMenuRequest>,
) -> AppResult<StatusCode> {
    authz::require(
        &state.pool,
        auth.user_id,
        Policy::Permission(PermissionName::ManagePermissions),
    )
    .await?;

    let menu = fetch_menu(&state.pool, menu_id).await?;

    let now = utc_now();
    for permission_id in &req.permission_ids {
        let known: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM permissions WHERE id = ?")
            .bind(permission_id.to_string())
            .fetch_one(&state.pool)
            .await?;
        if known == 0 {
            return Err(AppError::not_found(format!(
                "permission {permission_id} not found"
            )));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO menu_permissions (id, menu_id, permission_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(menu_id.to_string())
        .bind(permission_id.to_string())
        .bind(now)
        .execute(&state.pool)
        .await?;
    }

    log_activity_with_context(
        &state.event_bus,
        "assigned",
        Some(auth.user_id),
        &Menu::from(menu),
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::CREATED)
}

async fn fetch_menu(pool: &SqlitePool, menu_id: Uuid) -> AppResult<DbMenu> {
    sqlx::query_as::<_, DbMenu>(
        "SELECT id, title, icon, path, sort_order, parent_menu_id, created_at, updated_at FROM menus WHERE id = ?",
    )
    .bind(menu_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("menu not found"))
}

async fn ensure_menu_exists(pool: &SqlitePool, menu_id: Uuid) -> AppResult<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM menus WHERE id = ?")
        .bind(menu_id.to_string())
        .fetch_one(pool)
        .await?;

    if count == 0 {
        return Err(AppError::not_found(format!("parent menu {menu_id} not found")));
    }

    Ok(())
}

/// Walk up from the proposed parent; if the walk reaches the menu being
/// reparented, the edge would close a cycle. The tree invariant keeps this
/// walk short and terminating.
async fn ensure_no_cycle(pool: &SqlitePool, menu_id: Uuid, new_parent: Uuid) -> AppResult<()> {
    if menu_id == new_parent {
        return Err(AppError::bad_request("a menu cannot be its own parent"));
    }

    let mut cursor = Some(new_parent);
    while let Some(current) = cursor {
        if current == menu_id {
            return Err(AppError::bad_request(
                "reparenting would create a cycle in the menu tree",
            ));
        }

        let parent: Option<Option<String>> =
            sqlx::query_scalar("SELECT parent_menu_id FROM menus WHERE id = ?")
                .bind(current.to_string())
                .fetch_optional(pool)
                .await?;

        cursor = parent
            .flatten()
            .and_then(|raw| Uuid::parse_str(&raw).ok());
    }

    Ok(())
}

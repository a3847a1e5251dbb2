use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{self, Policy};
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity_with_context, RequestContext};
use crate::jwt::AuthUser;
use crate::models::user::{
    AddUserRequest, AddUserResponse, AssignedRole, DbUser, User, UserListQuery,
};
use crate::routes::auth::fetch_user_by_id;
use crate::utils::{hash_password, utc_now};

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[utoipa::path(
    get,
    path = "/users",
    tag = "Users",
    responses((status = 200, description = "Paged list of active users", body = [User])),
    security(("bearerAuth" = []))
)]
pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<UserListQuery>,
) -> AppResult<Json<Vec<User>>> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let sort_column = match params.sort_by.as_deref() {
        None | Some("first_name") => "first_name",
        Some("last_name") => "last_name",
        Some(other) => {
            return Err(AppError::bad_request(format!("cannot sort by {other}")));
        }
    };
    let sort_dir = match params.sort_order.as_deref() {
        None | Some("asc") => "ASC",
        Some("desc") => "DESC",
        Some(other) => {
            return Err(AppError::bad_request(format!("invalid sort order {other}")));
        }
    };

    let page = params.page.unwrap_or(1).max(1);
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    // Widen before multiplying; page is caller-controlled up to u32::MAX.
    let offset = (i64::from(page) - 1) * i64::from(page_size);

    // Column and direction come from the match arms above, never from input.
    let sql = format!(
        "SELECT id, first_name, last_name, email, phone, password_hash, created_at, updated_at, deleted_at \
         FROM users \
         WHERE deleted_at IS NULL AND (first_name LIKE ? OR last_name LIKE ?) \
         ORDER BY {sort_column} {sort_dir} \
         LIMIT ? OFFSET ?"
    );

    let pattern = format!("%{}%", params.query.unwrap_or_default());
    let users = sqlx::query_as::<_, DbUser>(&sql)
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&state.pool)
        .await?;

    let users: Vec<User> = users.into_iter().map(User::from).collect();

    Ok(Json(users))
}

#[utoipa::path(
    get,
    path = "/users/{user_id}",
    tag = "Users",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User detail", body = User),
        (status = 404, description = "User not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<User>> {
    let db_user = fetch_user_by_id(&state.pool, user_id).await?;
    let user: User = db_user.into();
    Ok(Json(user))
}

#[utoipa::path(
    post,
    path = "/users",
    tag = "Users",
    request_body = AddUserRequest,
    responses(
        (status = 201, description = "User created with the requested roles", body = AddUserResponse),
        (status = 404, description = "A referenced role does not exist"),
        (status = 409, description = "Email or phone already in use"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn add_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<AddUserRequest>,
) -> AppResult<(StatusCode, Json<AddUserResponse>)> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    if payload.roles.is_empty() {
        return Err(AppError::bad_request(
            "at least one role must be assigned to a new user",
        ));
    }

    ensure_email_free(&state.pool, &payload.email).await?;
    if let Some(phone) = &payload.phone {
        ensure_phone_free(&state.pool, phone).await?;
    }

    let password_hash = hash_password(&payload.password)?;
    let user_id = Uuid::new_v4();
    let now = utc_now();

    let mut tx = state.pool.begin().await?;

    sqlx::query(
        "INSERT INTO users (id, first_name, last_name, email, phone, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id.to_string())
    .bind(&payload.first_name)
    .bind(&payload.last_name)
    .bind(&payload.email)
    .bind(&payload.phone)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(AppError::from)
    .map_err(|e| e.on_unique_violation("email or phone already in use"))?;

    let mut assigned = Vec::with_capacity(payload.roles.len());
    for role_id in &payload.roles {
        let role_name: Option<String> =
            sqlx::query_scalar("SELECT name FROM roles WHERE id = ? AND deleted_at IS NULL")
                .bind(role_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(role_name) = role_name else {
            // Dropping the transaction rolls the user insert back.
            return Err(AppError::not_found(format!("role {role_id} not found")));
        };

        sqlx::query(
            "INSERT INTO user_roles (id, user_id, role_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id.to_string())
        .bind(role_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        assigned.push(AssignedRole {
            role_id: *role_id,
            role_name,
        });
    }

    tx.commit().await?;

    let db_user = fetch_user_by_id(&state.pool, user_id).await?;
    let user: User = db_user.into();

    log_activity_with_context(
        &state.event_bus,
        "created",
        Some(auth.user_id),
        &user,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok((
        StatusCode::CREATED,
        Json(AddUserResponse {
            user,
            roles: assigned,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/users/{user_id}",
    tag = "Users",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses(
        (status = 204, description = "User soft-deleted"),
        (status = 404, description = "User not found or already deleted"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    authz::require(&state.pool, auth.user_id, Policy::AdminRole).await?;

    let db_user = fetch_user_by_id(&state.pool, user_id).await?;

    // Role assignments stay behind as history; login and listings stop seeing
    // the account immediately.
    sqlx::query("UPDATE users SET deleted_at = ?, updated_at = ? WHERE id = ?")
        .bind(utc_now())
        .bind(utc_now())
        .bind(user_id.to_string())
        .execute(&state.pool)
        .await?;

    let user: User = db_user.into();
    log_activity_with_context(
        &state.event_bus,
        "deleted",
        Some(auth.user_id),
        &user,
        None,
        Some(RequestContext::from_headers(&headers)),
    );

    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_email_free(pool: &SqlitePool, email: &str) -> AppResult<()> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM users WHERE lower(email) = lower(?) AND deleted_at IS NULL",
    )
    .bind(email)
    .fetch_one(pool)
    .await?;

    if count > 0 {
        return Err(AppError::conflict("email already in use"));
    }

    Ok(())
}

async fn ensure_phone_free(pool: &SqlitePool, phone: &str) -> AppResult<()> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM users WHERE phone = ? AND deleted_at IS NULL",
    )
    .bind(phone)
    .fetch_one(pool)
    .await?;

    if count > 0 {
        return Err(AppError::conflict("phone number already in use"));
    }

    Ok(())
}

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{delete, get, post, put};
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::events::EventBus;
use crate::jwt::JwtConfig;
use crate::routes::{auth, health, menus, rbac, users};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub jwt: Arc<JwtConfig>,
    pub event_bus: EventBus,
}

impl AppState {
    pub fn new(pool: SqlitePool, jwt: JwtConfig, event_bus: EventBus) -> Self {
        Self {
            pool,
            jwt: Arc::new(jwt),
            event_bus,
        }
    }
}

pub async fn create_app(pool: SqlitePool, event_bus: EventBus) -> Result<Router, AppError> {
    let jwt_config = JwtConfig::from_env()?;
    let state = AppState::new(pool, jwt_config, event_bus);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/me", get(auth::me))
        .route("/logout", post(auth::logout));

    let user_routes = Router::new()
        .route("/", get(users::list_users))
        .route("/", post(users::add_user))
        .route("/:id", get(users::get_user))
        .route("/:id", delete(users::delete_user));

    // Role and permission administration lives under one prefix: roles, the
    // permission catalog, role-permission grants and user-role assignments.
    let rbac_routes = Router::new()
        .route("/roles", get(rbac::list_roles))
        .route("/roles", post(rbac::create_role))
        .route("/roles/:id", put(rbac::update_role))
        .route("/roles/:id", delete(rbac::delete_role))
        .route("/roles/:id/permissions", get(rbac::get_role_permissions))
        .route("/roles/:id/permissions", post(rbac::assign_permissions_to_role))
        .route(
            "/roles/:id/permissions/:permission_id",
            delete(rbac::remove_permission_from_role),
        )
        .route("/permissions", get(rbac::list_permissions))
        .route("/permissions", post(rbac::create_permission))
        .route("/role-permissions", get(rbac::get_all_role_permissions))
        .route("/users/:user_id/roles", get(rbac::get_user_roles))
        .route("/users/:user_id/roles", post(rbac::assign_role_to_user))
        .route(
            "/users/:user_id/roles/:role_id",
            delete(rbac::revoke_role_from_user),
        );

    let menu_routes = Router::new()
        .route("/me", get(menus::my_menu))
        .route("/", get(menus::list_menus))
        .route("/", post(menus::create_menu))
        .route("/:id", put(menus::update_menu))
        .route("/:id/permissions", post(menus::assign_permissions_to_menu));

    let router = Router::new()
        .nest("/auth", auth_routes)
        .nest("/users", user_routes)
        .nest("/rbac", rbac_routes)
        .nest("/menus", menu_routes)
        // `nest` does not match the bare trailing-slash form of its prefix,
        // so expose the collection roots at "/users/" and "/menus/" as well.
        .route("/users/", get(users::list_users).post(users::add_user))
        .route("/menus/", get(menus::list_menus).post(menus::create_menu))
        .route("/api/health", get(health::health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    Ok(router)
}

use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::{tempdir, TempDir};
use tower::util::ServiceExt;
use uuid::Uuid;

use backoffice::create_app;
use backoffice::events::init_event_bus;

const ADMIN_ROLE_ID: &str = "a0000000-0000-0000-0000-000000000001";
const MANAGER_ROLE_ID: &str = "a0000000-0000-0000-0000-000000000002";

async fn setup() -> Result<(Router, SqlitePool, TempDir)> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test_users.db");
    use sqlx::sqlite::SqliteConnectOptions;
    let opts = SqliteConnectOptions::new()
        .filename(db_path.as_path())
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator = sqlx::migrate::Migrator::new(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"),
    )
    .await?;
    migrator.run(&pool).await?;

    std::env::set_var("JWT_SECRET", "test-secret");
    let (event_bus, _rx) = init_event_bus();
    let app = create_app(pool.clone(), event_bus).await?;
    Ok((app, pool, dir))
}

async fn register(app: &Router, first: &str, last: &str, email: &str) -> Result<(String, String)> {
    let body = json!({
        "first_name": first,
        "last_name": last,
        "email": email,
        "password": "password123"
    });
    let req = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    let v: Value = serde_json::from_slice(&bytes)?;
    Ok((
        v["token"].as_str().context("missing token")?.to_string(),
        v["user"]["id"].as_str().context("missing user id")?.to_string(),
    ))
}

async fn promote_to_admin(pool: &SqlitePool, user_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_roles (id, user_id, role_id, created_at) VALUES (?, ?, ?, datetime('now'))",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(ADMIN_ROLE_ID)
    .execute(pool)
    .await?;
    Ok(())
}

fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Result<Request<Body>> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token));
    Ok(match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))?,
        None => builder.body(Body::empty())?,
    })
}

async fn json_body(resp: Response) -> Result<Value> {
    let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn listing_users_is_admin_only_with_search_and_sort() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "Zora", "Admin", "admin@example.com").await?;
    promote_to_admin(&pool, &admin_id).await?;
    let (manager_token, _) = register(&app, "Ada", "Lovelace", "ada@example.com").await?;
    register(&app, "Grace", "Hopper", "grace@example.com").await?;

    // Managers are locked out
    let req = authed("GET", "/users/", &manager_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Default sort is first_name ascending
    let req = authed("GET", "/users/", &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let users = json_body(resp).await?;
    let first_names: Vec<&str> = users
        .as_array()
        .context("expected array")?
        .iter()
        .filter_map(|u| u["first_name"].as_str())
        .collect();
    assert_eq!(first_names, vec!["Ada", "Grace", "Zora"]);

    // Substring search matches first or last name
    let req = authed("GET", "/users/?query=Hopp", &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    let users = json_body(resp).await?;
    assert_eq!(users.as_array().map(|a| a.len()), Some(1));
    assert_eq!(users[0]["last_name"].as_str(), Some("Hopper"));

    // Descending last-name sort
    let req = authed("GET", "/users/?sort_by=last_name&sort_order=desc", &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    let users = json_body(resp).await?;
    let last_names: Vec<&str> = users
        .as_array()
        .context("expected array")?
        .iter()
        .filter_map(|u| u["last_name"].as_str())
        .collect();
    assert_eq!(last_names, vec!["Lovelace", "Hopper", "Admin"]);

    // Unknown sort column is rejected rather than interpolated
    let req = authed("GET", "/users/?sort_by=password_hash", &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Pagination
    let req = authed("GET", "/users/?page=2&page_size=1", &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    let users = json_body(resp).await?;
    assert_eq!(users.as_array().map(|a| a.len()), Some(1));
    assert_eq!(users[0]["first_name"].as_str(), Some("Grace"));

    // A page far past the end is an empty list, even at the u32 limit
    let req = authed(
        "GET",
        "/users/?page=4294967295&page_size=100",
        &admin_token,
        None,
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let users = json_body(resp).await?;
    assert_eq!(users.as_array().map(|a| a.len()), Some(0));

    Ok(())
}

#[tokio::test]
async fn admin_creates_users_with_explicit_roles() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "Root", "Admin", "admin@example.com").await?;
    promote_to_admin(&pool, &admin_id).await?;

    let req = authed(
        "POST",
        "/users/",
        &admin_token,
        Some(json!({
            "first_name": "New",
            "last_name": "Hire",
            "email": "hire@example.com",
            "phone": "+15550100",
            "password": "password123",
            "roles": [MANAGER_ROLE_ID]
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = json_body(resp).await?;
    let role_names: Vec<&str> = created["roles"]
        .as_array()
        .context("expected roles")?
        .iter()
        .filter_map(|r| r["role_name"].as_str())
        .collect();
    assert_eq!(role_names, vec!["Manager"]);

    // The new account can log in
    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"email": "hire@example.com", "password": "password123"}).to_string(),
        ))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);

    // Duplicate email and duplicate phone are conflicts
    let req = authed(
        "POST",
        "/users/",
        &admin_token,
        Some(json!({
            "first_name": "Dup",
            "last_name": "Email",
            "email": "HIRE@example.com",
            "password": "password123",
            "roles": [MANAGER_ROLE_ID]
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = authed(
        "POST",
        "/users/",
        &admin_token,
        Some(json!({
            "first_name": "Dup",
            "last_name": "Phone",
            "email": "phone@example.com",
            "phone": "+15550100",
            "password": "password123",
            "roles": [MANAGER_ROLE_ID]
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Unknown role rolls the whole creation back
    let req = authed(
        "POST",
        "/users/",
        &admin_token,
        Some(json!({
            "first_name": "No",
            "last_name": "Role",
            "email": "norole@example.com",
            "password": "password123",
            "roles": [Uuid::new_v4()]
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let orphan: i64 = sqlx::query_scalar(
        "SELECT COUNT(1) FROM users WHERE email = 'norole@example.com'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(orphan, 0, "failed creation must not leave a user behind");

    // Empty role list is rejected up front
    let req = authed(
        "POST",
        "/users/",
        &admin_token,
        Some(json!({
            "first_name": "No",
            "last_name": "Roles",
            "email": "noroles@example.com",
            "password": "password123",
            "roles": []
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn soft_deleting_a_user_blocks_login_and_frees_the_email() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "Root", "Admin", "admin@example.com").await?;
    promote_to_admin(&pool, &admin_id).await?;
    let (_token, target_id) = register(&app, "Dele", "Table", "target@example.com").await?;

    let req = authed("DELETE", &format!("/users/{}", target_id), &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // Login is refused
    let req = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"email": "target@example.com", "password": "password123"}).to_string(),
        ))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Lookup is a 404, a second delete likewise
    let req = authed("GET", &format!("/users/{}", target_id), &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = authed("DELETE", &format!("/users/{}", target_id), &admin_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // The email is free for a new registration
    let req = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "first_name": "Fresh",
                "last_name": "Start",
                "email": "target@example.com",
                "password": "password123"
            })
            .to_string(),
        ))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // The role assignment history of the deleted account is untouched
    let history: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM user_roles WHERE user_id = ?")
        .bind(&target_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(history, 1);

    Ok(())
}

#[tokio::test]
async fn soft_deleted_admin_keeps_a_valid_token_but_no_authority() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (root_token, root_id) = register(&app, "Root", "Admin", "root@example.com").await?;
    promote_to_admin(&pool, &root_id).await?;
    let (other_token, other_id) = register(&app, "Other", "Admin", "other@example.com").await?;
    promote_to_admin(&pool, &other_id).await?;

    // Both admins can mutate before the delete
    let req = authed(
        "POST",
        "/rbac/roles",
        &other_token,
        Some(json!({"name": "Scheduler"})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = authed("DELETE", &format!("/users/{}", other_id), &root_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // The unexpired token still names the account, but every gated endpoint
    // now refuses it: the evaluator no longer sees the user's roles.
    let req = authed(
        "POST",
        "/rbac/roles",
        &other_token,
        Some(json!({"name": "Backdoor"})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = authed("GET", "/users/", &other_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = authed(
        "POST",
        &format!("/rbac/users/{}/roles", root_id),
        &other_token,
        Some(json!({"role_id": ADMIN_ROLE_ID})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    Ok(())
}

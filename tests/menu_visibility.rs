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
const READ_PERMISSION_ID: &str = "b0000000-0000-0000-0000-000000000002";
const DELETE_PERMISSION_ID: &str = "b0000000-0000-0000-0000-000000000004";

async fn setup() -> Result<(Router, SqlitePool, TempDir)> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test_menus.db");
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

async fn register(app: &Router, email: &str) -> Result<(String, String)> {
    let body = json!({
        "first_name": "Menu",
        "last_name": "Tester",
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

async fn grant_role(pool: &SqlitePool, user_id: &str, role_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_roles (id, user_id, role_id, created_at) VALUES (?, ?, ?, datetime('now'))",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(role_id)
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

/// Create a menu through the API and return its id.
async fn create_menu(
    app: &Router,
    token: &str,
    title: &str,
    sort_order: Option<i64>,
    parent: Option<&str>,
) -> Result<String> {
    let req = authed(
        "POST",
        "/menus/",
        token,
        Some(json!({
            "title": title,
            "path": format!("/{}", title.to_lowercase()),
            "sort_order": sort_order,
            "parent_menu_id": parent,
        })),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED, "create menu {}", title);
    let menu = json_body(resp).await?;
    Ok(menu["id"].as_str().context("missing menu id")?.to_string())
}

async fn gate_menu(app: &Router, token: &str, menu_id: &str, permission_id: &str) -> Result<()> {
    let req = authed(
        "POST",
        &format!("/menus/{}/permissions", menu_id),
        token,
        Some(json!({"permission_ids": [permission_id]})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    Ok(())
}

#[tokio::test]
async fn menu_tree_is_filtered_by_granted_permissions() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "admin@example.com").await?;
    grant_role(&pool, &admin_id, ADMIN_ROLE_ID).await?;

    // Admin builds the tree: Reports (Read) with children Weekly (Read, second)
    // and Daily (Read, first); Danger Zone is gated by Delete only.
    let reports = create_menu(&app, &admin_token, "Reports", Some(1), None).await?;
    let weekly = create_menu(&app, &admin_token, "Weekly", Some(2), Some(&reports)).await?;
    let daily = create_menu(&app, &admin_token, "Daily", Some(1), Some(&reports)).await?;
    let danger = create_menu(&app, &admin_token, "Danger", Some(3), Some(&reports)).await?;

    gate_menu(&app, &admin_token, &reports, READ_PERMISSION_ID).await?;
    gate_menu(&app, &admin_token, &weekly, READ_PERMISSION_ID).await?;
    gate_menu(&app, &admin_token, &daily, READ_PERMISSION_ID).await?;
    gate_menu(&app, &admin_token, &danger, DELETE_PERMISSION_ID).await?;

    // A Viewer role holding only Read
    let req = authed("POST", "/rbac/roles", &admin_token, Some(json!({"name": "Viewer"})))?;
    let resp = app.clone().oneshot(req).await?;
    let viewer = json_body(resp).await?;
    let viewer_id = viewer["id"].as_str().context("missing role id")?.to_string();

    let req = authed(
        "POST",
        &format!("/rbac/roles/{}/permissions", viewer_id),
        &admin_token,
        Some(json!({"permission_ids": [READ_PERMISSION_ID]})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let (viewer_token, viewer_user) = register(&app, "viewer@example.com").await?;
    grant_role(&pool, &viewer_user, &viewer_id).await?;

    // The viewer sees Reports with Daily before Weekly; Danger is omitted.
    let req = authed("GET", "/menus/me", &viewer_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let tree = json_body(resp).await?;

    let roots = tree.as_array().context("expected array")?;
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["title"].as_str(), Some("Reports"));
    let children: Vec<&str> = roots[0]["children"]
        .as_array()
        .context("expected children")?
        .iter()
        .filter_map(|c| c["title"].as_str())
        .collect();
    assert_eq!(children, vec!["Daily", "Weekly"]);

    // A user with no grants gets an empty tree, not an error
    let (bare_token, _) = register(&app, "bare@example.com").await?;
    let req = authed("GET", "/menus/me", &bare_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let empty = json_body(resp).await?;
    assert_eq!(empty.as_array().map(|a| a.len()), Some(0));

    Ok(())
}

#[tokio::test]
async fn visible_child_of_ungated_parent_is_promoted() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "admin@example.com").await?;
    grant_role(&pool, &admin_id, ADMIN_ROLE_ID).await?;

    // Parent carries only Delete; child carries Read.
    let parent = create_menu(&app, &admin_token, "Hidden", Some(1), None).await?;
    let child = create_menu(&app, &admin_token, "Visible", Some(1), Some(&parent)).await?;
    gate_menu(&app, &admin_token, &parent, DELETE_PERMISSION_ID).await?;
    gate_menu(&app, &admin_token, &child, READ_PERMISSION_ID).await?;

    let req = authed("POST", "/rbac/roles", &admin_token, Some(json!({"name": "Reader"})))?;
    let resp = app.clone().oneshot(req).await?;
    let role = json_body(resp).await?;
    let role_id = role["id"].as_str().context("missing role id")?.to_string();
    let req = authed(
        "POST",
        &format!("/rbac/roles/{}/permissions", role_id),
        &admin_token,
        Some(json!({"permission_ids": [READ_PERMISSION_ID]})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let (reader_token, reader_id) = register(&app, "reader@example.com").await?;
    grant_role(&pool, &reader_id, &role_id).await?;

    let req = authed("GET", "/menus/me", &reader_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    let tree = json_body(resp).await?;

    let roots = tree.as_array().context("expected array")?;
    assert_eq!(roots.len(), 1, "child should be promoted to a root");
    assert_eq!(roots[0]["title"].as_str(), Some("Visible"));

    Ok(())
}

#[tokio::test]
async fn menu_administration_is_admin_only_and_rejects_cycles() -> Result<()> {
    let (app, pool, _dir) = setup().await?;

    let (admin_token, admin_id) = register(&app, "admin@example.com").await?;
    grant_role(&pool, &admin_id, ADMIN_ROLE_ID).await?;
    let (manager_token, _) = register(&app, "manager@example.com").await?;

    // Managers cannot administer menus
    let req = authed("GET", "/menus/", &manager_token, None)?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = authed("POST", "/menus/", &manager_token, Some(json!({"title": "Rogue"})))?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Build A -> B, then try to reparent A under B
    let a = create_menu(&app, &admin_token, "Alpha", Some(1), None).await?;
    let b = create_menu(&app, &admin_token, "Beta", Some(1), Some(&a)).await?;

    let req = authed(
        "PUT",
        &format!("/menus/{}", a),
        &admin_token,
        Some(json!({"parent_menu_id": b})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "cycle must be rejected");

    // Self-parenting is rejected too
    let req = authed(
        "PUT",
        &format!("/menus/{}", a),
        &admin_token,
        Some(json!({"parent_menu_id": a})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // clear_parent moves Beta back to root
    let req = authed(
        "PUT",
        &format!("/menus/{}", b),
        &admin_token,
        Some(json!({"clear_parent": true})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let updated = json_body(resp).await?;
    assert!(updated.get("parent_menu_id").is_none() || updated["parent_menu_id"].is_null());

    // Unknown parent on create is a 404
    let req = authed(
        "POST",
        "/menus/",
        &admin_token,
        Some(json!({"title": "Orphan", "parent_menu_id": Uuid::new_v4()})),
    )?;
    let resp = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    Ok(())
}

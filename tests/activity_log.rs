use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::tempdir;
use tower::util::ServiceExt;
use uuid::Uuid;

use backoffice::create_app;
use backoffice::events::{init_event_bus, start_activity_listener};

const ADMIN_ROLE_ID: &str = "a0000000-0000-0000-0000-000000000001";

/// Poll until the predicate query returns a row or the deadline passes. The
/// listener drains the bus on its own task, so writes are slightly deferred.
async fn wait_for_count(pool: &SqlitePool, sql: &str, expected: i64) -> Result<()> {
    for _ in 0..50 {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
        if count >= expected {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("timed out waiting for: {}", sql)
}

#[tokio::test]
async fn rbac_mutations_land_in_activity_log_and_event_store() -> Result<()> {
    let dir = tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test_activity.db");
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
    let (event_bus, rx) = init_event_bus();
    tokio::spawn(start_activity_listener(rx, pool.clone()));
    let app = create_app(pool.clone(), event_bus).await?;

    // Register an admin
    let req = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "first_name": "Audit",
                "last_name": "Admin",
                "email": "admin@example.com",
                "password": "password123"
            })
            .to_string(),
        ))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
    let v: Value = serde_json::from_slice(&bytes)?;
    let token = v["token"].as_str().context("missing token")?.to_string();
    let admin_id = v["user"]["id"].as_str().context("missing user id")?.to_string();

    sqlx::query(
        "INSERT INTO user_roles (id, user_id, role_id, created_at) VALUES (?, ?, ?, datetime('now'))",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&admin_id)
    .bind(ADMIN_ROLE_ID)
    .execute(&pool)
    .await?;

    // Registration itself is logged
    wait_for_count(
        &pool,
        "SELECT COUNT(1) FROM activity_log WHERE event_name = 'user.registered'",
        1,
    )
    .await?;

    // A role mutation lands with critical severity and a request context
    let req = Request::builder()
        .method("POST")
        .uri("/rbac/roles")
        .header("authorization", format!("Bearer {}", token))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.9")
        .header("user-agent", "audit-test")
        .body(Body::from(json!({"name": "Auditor"}).to_string()))?;
    let resp: Response = app.clone().oneshot(req).await?;
    assert_eq!(resp.status(), StatusCode::CREATED);

    wait_for_count(
        &pool,
        "SELECT COUNT(1) FROM activity_log WHERE event_name = 'role.created' AND severity = 'critical'",
        1,
    )
    .await?;

    let (description, properties): (String, String) = sqlx::query_as(
        "SELECT description, properties FROM activity_log WHERE event_name = 'role.created'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(description, "Role created");
    let props: Value = serde_json::from_str(&properties)?;
    assert_eq!(props.pointer("/payload/context/ip").and_then(|v| v.as_str()), Some("203.0.113.9"));
    assert_eq!(
        props.pointer("/payload/context/user_agent").and_then(|v| v.as_str()),
        Some("audit-test"),
    );

    // The event store chains hashes: first entry has no prev_hash, later ones do
    wait_for_count(&pool, "SELECT COUNT(1) FROM event_store", 2).await?;

    let rows: Vec<(Option<String>, String)> =
        sqlx::query_as("SELECT prev_hash, hash FROM event_store ORDER BY created_at, id")
            .fetch_all(&pool)
            .await?;
    assert!(rows.len() >= 2);
    assert!(rows[0].0.is_none(), "first entry must not have a prev_hash");
    for window in rows.windows(2) {
        assert_eq!(
            window[1].0.as_deref(),
            Some(window[0].1.as_str()),
            "each entry must chain to the previous hash"
        );
    }

    Ok(())
}

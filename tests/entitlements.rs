/// End-to-end entitlement properties against a file-backed WAL database
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tollgate::{
    access::AccessReason,
    config::ServerConfig,
    error::EngineError,
    redemption::{RedeemOutcome, RedeemRejection},
    server::build_router,
    AppContext,
};
use tower::Service;

async fn setup() -> (TempDir, AppContext) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::for_database(dir.path().join("tollgate.sqlite"));
    let ctx = AppContext::new(config).await.unwrap();
    (dir, ctx)
}

async fn issue_one(ctx: &AppContext, plan: &str) -> String {
    ctx.issuer.issue_keys(plan, 1, 30).await.unwrap().codes.remove(0)
}

async fn key_rows(db: &SqlitePool) -> Vec<(i64, bool, Option<i64>)> {
    sqlx::query_as("SELECT id, used, bound_account_id FROM activation_keys ORDER BY id")
        .fetch_all(db)
        .await
        .unwrap()
}

fn rejection(outcome: RedeemOutcome) -> RedeemRejection {
    match outcome {
        RedeemOutcome::Rejected(r) => r,
        RedeemOutcome::Redeemed(r) => panic!("unexpected redemption: {:?}", r),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_bind_exactly_once() {
    let (_dir, ctx) = setup().await;
    let code = issue_one(&ctx, "PRO").await;

    let contenders: Vec<i64> = (1..=8).collect();
    for id in &contenders {
        ctx.ledger
            .get_or_create(*id, &format!("user-{}", id), None)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for id in contenders.clone() {
        let ctx = ctx.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move {
            ctx.redemption.redeem(id, &code).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            RedeemOutcome::Redeemed(_) => winners += 1,
            RedeemOutcome::Rejected(r) => assert_eq!(r, RedeemRejection::BoundToOther),
        }
    }
    assert_eq!(winners, 1);

    let holders: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM accounts WHERE bound_key_id = (SELECT id FROM activation_keys WHERE code = ?)",
    )
    .bind(&code)
    .fetch_one(&ctx.db)
    .await
    .unwrap();
    assert_eq!(holders, 1);

    let events: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM subscription_events WHERE transition = 'redemption'")
            .fetch_one(&ctx.db)
            .await
            .unwrap();
    assert_eq!(events, 1);
}

#[tokio::test]
async fn registration_keeps_first_display_name() {
    let (_dir, ctx) = setup().await;

    let first = ctx.ledger.get_or_create(100, "Alice", None).await.unwrap();
    let second = ctx.ledger.get_or_create(100, "Bob", None).await.unwrap();

    assert_eq!(first.id, 100);
    assert_eq!(second.id, 100);
    assert_eq!(second.display_name, "Alice");
}

#[tokio::test]
async fn malformed_codes_never_touch_the_store() {
    let (_dir, ctx) = setup().await;
    let code = issue_one(&ctx, "BASIC").await;
    ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();

    let before = key_rows(&ctx.db).await;

    for input in ["short", "ABCD-EFGH-IJKL-MNO", "ABCDEFGHIJKLMNOP"] {
        let outcome = ctx.redemption.redeem(1, input).await.unwrap();
        let r = rejection(outcome);
        assert!(matches!(r, RedeemRejection::Malformed(_)), "{}: {:?}", input, r);
        assert!(matches!(EngineError::from(r), EngineError::MalformedInput(_)));
    }

    assert_eq!(key_rows(&ctx.db).await, before);
    assert!(ctx.redemption.validate(&code).await.is_ok());
}

#[tokio::test]
async fn deactivated_key_is_not_resurrected() {
    let (_dir, ctx) = setup().await;
    let code = issue_one(&ctx, "PREMIUM").await;
    ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();

    assert!(ctx.redemption.redeem(1, &code).await.unwrap().is_redeemed());
    assert!(ctx.redemption.deactivate(1).await.unwrap());

    let alice = ctx.ledger.get_account(1).await.unwrap().unwrap();
    let free = ctx.catalog.free_plan().await.unwrap();
    assert_eq!(alice.plan_id, free.id);
    assert_eq!(alice.used_count, 0);
    assert!(ctx.redemption.validate(&code).await.unwrap().used);

    ctx.ledger.increment_usage(1).await.unwrap();

    assert_eq!(
        rejection(ctx.redemption.redeem(1, &code).await.unwrap()),
        RedeemRejection::AlreadyBoundToSelf
    );

    let alice = ctx.ledger.get_account(1).await.unwrap().unwrap();
    assert_eq!(alice.used_count, 1);
    assert_eq!(alice.plan_id, free.id);
}

#[tokio::test]
async fn access_gating_follows_quota_and_window() {
    let (_dir, ctx) = setup().await;
    ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();
    sqlx::query("UPDATE accounts SET quota_limit = 1, used_count = 0 WHERE id = 1")
        .execute(&ctx.db)
        .await
        .unwrap();

    let today = Utc::now().date_naive();
    assert!(ctx.ledger.check_access(1, today).await.unwrap().allowed);

    ctx.ledger.increment_usage(1).await.unwrap();
    let verdict = ctx.ledger.check_access(1, today).await.unwrap();
    assert!(!verdict.allowed);
    assert_eq!(verdict.reason, AccessReason::QuotaExhausted);

    sqlx::query("UPDATE accounts SET used_count = 0, window_end = ? WHERE id = 1")
        .bind(today - Duration::days(1))
        .execute(&ctx.db)
        .await
        .unwrap();
    let verdict = ctx.ledger.check_access(1, today).await.unwrap();
    assert!(!verdict.allowed);
    assert!(verdict.has_quota);
    assert_eq!(verdict.reason, AccessReason::SubscriptionExpired);

    let missing = ctx.ledger.check_access(404, today).await.unwrap();
    assert_eq!(missing.reason.as_str(), "account not found");
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let (_dir, ctx) = setup().await;
    let code = issue_one(&ctx, "BASIC").await;
    ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();
    ctx.redemption.redeem(1, &code).await.unwrap();

    let today = Utc::now().date_naive();
    sqlx::query("UPDATE accounts SET window_end = ? WHERE id = 1")
        .bind(today - Duration::days(3))
        .execute(&ctx.db)
        .await
        .unwrap();

    assert_eq!(ctx.sweeper.sweep_expired(today).await.unwrap(), 1);
    assert_eq!(ctx.sweeper.sweep_expired(today).await.unwrap(), 0);

    let alice = ctx.ledger.get_account(1).await.unwrap().unwrap();
    assert_eq!(alice.bound_key_id, None);
    assert!(ctx.ledger.check_access(1, today).await.unwrap().allowed);
}

#[tokio::test]
async fn revoked_key_can_be_redeemed_again() {
    let (_dir, ctx) = setup().await;
    let code = issue_one(&ctx, "ENTERPRISE").await;
    ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();
    ctx.ledger.get_or_create(2, "Bob", None).await.unwrap();

    ctx.redemption.redeem(1, &code).await.unwrap();
    let result = ctx.redemption.revoke_key(&code).await.unwrap();
    assert_eq!(result.released_account_id, Some(1));

    let alice = ctx.ledger.get_account(1).await.unwrap().unwrap();
    assert_eq!(alice.plan_id, ctx.catalog.free_plan().await.unwrap().id);

    let outcome = ctx.redemption.redeem(2, &code).await.unwrap();
    let RedeemOutcome::Redeemed(redemption) = outcome else {
        panic!("expected redemption after revoke");
    };
    assert_eq!(redemption.plan_name, "ENTERPRISE");
}

#[tokio::test]
async fn user_info_counts_usage_and_denies_when_exhausted() {
    let (_dir, ctx) = setup().await;
    let account = ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();
    sqlx::query("UPDATE accounts SET quota_limit = 1 WHERE id = 1")
        .execute(&ctx.db)
        .await
        .unwrap();

    let mut app = build_router(ctx.clone());
    let request = |key: &str| {
        Request::builder()
            .uri("/user/info")
            .header("x-access-key", key)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.call(request("unknown")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.call(request(&account.access_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["plan"]["name"], "FREE");
    assert_eq!(json["requests_used"], 1);

    let usage = ctx.ledger.recent_usage(1, 10).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].kind, "api_info");

    let response = app.call(request(&account.access_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("request quota exhausted"));
}

#[tokio::test]
async fn admin_routes_require_privilege() {
    let (_dir, ctx) = setup().await;
    let user = ctx.ledger.get_or_create(1, "Alice", None).await.unwrap();
    let admin = ctx.ledger.get_or_create(2, "Root", None).await.unwrap();
    ctx.ledger.set_privileged(admin.id, true).await.unwrap();

    let mut app = build_router(ctx.clone());
    let issue = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/admin/keys")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", key))
            .body(Body::from(r#"{"plan":"basic","quantity":2}"#))
            .unwrap()
    };

    let response = app.call(issue(&user.access_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.call(issue(&admin.access_key)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let oversized = Request::builder()
        .method("POST")
        .uri("/admin/keys")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", admin.access_key))
        .body(Body::from(
            r#"{"plan":"basic","quantity":1,"validity_days":4000000000}"#,
        ))
        .unwrap();
    let response = app.call(oversized).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let stats = ctx.issuer.key_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.available, 2);
}

//! End-to-end tests for the verification routes.
//!
//! Everything runs in-process against the router with an in-memory session
//! store; see the harness in `src/lib.rs`.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use axum::http::StatusCode;
use otp_login_integration_tests::TestApp;
use otp_login_server::services::notify::Destination;

fn wrong_code(code: &str) -> &'static str {
    if code == "000000" { "111111" } else { "000000" }
}

// ============================================================================
// Showing the form
// ============================================================================

#[tokio::test]
async fn test_verify_requires_login() {
    let mut app = TestApp::new();

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/login"));
    assert!(app.sent().is_empty());
}

#[tokio::test]
async fn test_verify_issues_code_once() {
    let mut app = TestApp::new();
    app.login(1, None).await;

    let first = app.get("/login/verify").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(app.sent().len(), 1);

    let sent = app.sent().remove(0);
    assert_eq!(sent.service, "email");
    assert!(matches!(sent.destination, Destination::Email(_)));
    assert_eq!(first.reference(), Some(sent.reference.as_str()));
    assert!(first.body.contains("u***@example.com"));
    assert!(!first.body.contains(&sent.code));

    let second = app.get("/login/verify").await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.reference(), first.reference());
    assert_eq!(app.sent().len(), 1);
}

#[tokio::test]
async fn test_verify_delivery_failure() {
    let mut app = TestApp::builder().default_service("broken").build();
    app.login(1, None).await;

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("delivery_failed"));
    assert_eq!(resp.reference(), None);

    // Nothing was stored, so there is nothing to check against.
    let resp = app.post_form("/login/check", "code=123456").await;
    assert_eq!(resp.error_indicator(), Some("expired"));
}

#[tokio::test]
async fn test_verify_send_timeout() {
    let mut app = TestApp::builder().default_service("slow").build();
    app.login(1, None).await;

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("delivery_failed"));
}

#[tokio::test]
async fn test_verify_sms_without_phone() {
    let mut app = TestApp::builder().default_service("sms").build();
    app.login(1, None).await;

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("no_destination"));
    assert!(app.sent().is_empty());
}

// ============================================================================
// Checking codes
// ============================================================================

#[tokio::test]
async fn test_correct_code_verifies() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let cookie_before = app.cookie().map(String::from);

    let code = app.last_code();
    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/account"));

    // Session id is cycled on verification.
    assert_ne!(app.cookie().map(String::from), cookie_before);

    // Verified sessions skip the form and no new code is sent.
    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/account"));
    assert_eq!(app.sent().len(), 1);
}

#[tokio::test]
async fn test_code_is_trimmed() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;

    let code = app.last_code();
    let resp = app
        .post_form("/login/check", &format!("code=+{code}+"))
        .await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_code_cannot_be_replayed() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();

    app.post_form("/login/check", &format!("code={code}")).await;

    // Log in again (new first factor) and replay the old code.
    app.login(1, None).await;
    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("expired"));
}

#[tokio::test]
async fn test_wrong_code_then_lockout() {
    let mut app = TestApp::builder().max_attempts(3).build();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();
    let wrong = wrong_code(&code);

    let resp = app.post_form("/login/check", &format!("code={wrong}")).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("rejected"));
    assert!(resp.body.contains("2 attempts left"));
    assert!(resp.reference().is_some());

    app.post_form("/login/check", &format!("code={wrong}")).await;
    app.post_form("/login/check", &format!("code={wrong}")).await;

    // The right code no longer works once the limit is reached.
    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("locked_out"));

    let resp = app.get("/account").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/login/verify"));
}

#[tokio::test]
async fn test_check_after_verification_redirects() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();
    app.post_form("/login/check", &format!("code={code}")).await;

    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/account"));
}

#[tokio::test]
async fn test_check_when_disabled_redirects() {
    let mut app = TestApp::builder().enabled(false).build();
    app.login(1, None).await;

    let resp = app.post_form("/login/check", "code=123456").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/account"));
}

#[tokio::test]
async fn test_check_without_challenge() {
    let mut app = TestApp::new();
    app.login(1, None).await;

    let resp = app.post_form("/login/check", "code=123456").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("expired"));
}

#[tokio::test]
async fn test_check_missing_code_field() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;

    let resp = app.post_form("/login/check", "").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("rejected"));
}

#[tokio::test]
async fn test_expired_code() {
    let mut app = TestApp::builder().ttl_secs(1).build();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("expired"));

    // Showing the form again issues a fresh code.
    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(app.sent().len(), 2);
}

#[tokio::test]
async fn test_new_login_discards_previous_user_challenge() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();

    app.login(2, None).await;
    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("expired"));
}

// ============================================================================
// Resending
// ============================================================================

#[tokio::test]
async fn test_resend_replaces_code() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let old_code = app.last_code();

    let resp = app.post_form("/login/resend", "").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/login/verify"));
    assert_eq!(app.sent().len(), 2);

    let new_code = app.last_code();
    if old_code != new_code {
        let resp = app.post_form("/login/check", &format!("code={old_code}")).await;
        assert_eq!(resp.error_indicator(), Some("rejected"));
    }
    let resp = app.post_form("/login/check", &format!("code={new_code}")).await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_resend_via_sms() {
    let mut app = TestApp::new();
    app.login(1, Some("+15550109999")).await;

    let resp = app.post_form("/login/resend", "service=sms").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);

    let sent = app.sent();
    let last = sent.last().unwrap();
    assert_eq!(last.service, "sms");
    assert!(matches!(last.destination, Destination::Phone(_)));

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.body.contains("+*******9999"));
    assert_eq!(app.sent().len(), 1);
}

#[tokio::test]
async fn test_resend_unknown_service() {
    let mut app = TestApp::new();
    app.login(1, None).await;

    let resp = app.post_form("/login/resend", "service=fax").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("unknown_service"));
    assert!(app.sent().is_empty());
}

#[tokio::test]
async fn test_failed_resend_keeps_current_code() {
    let mut app = TestApp::new();
    app.login(1, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();

    let resp = app.post_form("/login/resend", "service=fax").await;
    assert_eq!(resp.error_indicator(), Some("unknown_service"));
    let resp = app.post_form("/login/resend", "service=broken").await;
    assert_eq!(resp.error_indicator(), Some("delivery_failed"));

    let resp = app.post_form("/login/check", &format!("code={code}")).await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_resend_delivery_failure() {
    let mut app = TestApp::new();
    app.login(1, None).await;

    let resp = app.post_form("/login/resend", "service=broken").await;
    assert_eq!(resp.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.error_indicator(), Some("delivery_failed"));
}

// ============================================================================
// Guard
// ============================================================================

#[tokio::test]
async fn test_guard_passes_anonymous_requests() {
    let mut app = TestApp::new();

    let resp = app.get("/account").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, "guest");
}

#[tokio::test]
async fn test_guard_redirects_until_verified() {
    let mut app = TestApp::new();
    app.login(7, None).await;

    let resp = app.get("/account").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/login/verify"));

    app.get("/login/verify").await;
    let code = app.last_code();
    app.post_form("/login/check", &format!("code={code}")).await;

    let resp = app.get("/account").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, "account:7");
}

#[tokio::test]
async fn test_logout_drops_verification() {
    let mut app = TestApp::new();
    app.login(7, None).await;
    app.get("/login/verify").await;
    let code = app.last_code();
    app.post_form("/login/check", &format!("code={code}")).await;

    app.logout().await;

    let resp = app.get("/account").await;
    assert_eq!(resp.body, "guest");
    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert_eq!(resp.location.as_deref(), Some("/login"));
}

#[tokio::test]
async fn test_guard_disabled() {
    let mut app = TestApp::builder().enabled(false).build();
    app.login(7, None).await;

    let resp = app.get("/account").await;
    assert_eq!(resp.status, StatusCode::OK);

    let resp = app.get("/login/verify").await;
    assert_eq!(resp.status, StatusCode::SEE_OTHER);
    assert!(app.sent().is_empty());
}

// ============================================================================
// Health & request ids
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let mut app = TestApp::new();

    let resp = app.get("/health").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, "ok");

    let resp = app.get("/health/ready").await;
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_generated_and_propagated() {
    let mut app = TestApp::new();

    let resp = app.get("/health").await;
    assert_eq!(resp.request_id.as_deref().map(str::len), Some(36));

    let request = app
        .request("GET", "/health")
        .header("x-request-id", "edge-1234")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = app.send(request).await;
    assert_eq!(resp.request_id.as_deref(), Some("edge-1234"));
}

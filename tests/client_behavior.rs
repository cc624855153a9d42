//! Integration tests for request dispatch
//!
//! Every test drives a real `ApiClient` over a scripted transport and a manual
//! clock, so token ages and cache TTLs are exact and nothing touches the network.

mod common;

use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::time::Duration;

use common::{harness, harness_with, harness_with_config, no_wait_retries, Reply, BASE_URL};
use pestdesk::retry::{ExponentialBackoff, FixedDelay};
use pestdesk::storage::{FileStore, MemoryStore};
use pestdesk::transport::TransportError;
use std::sync::Arc;
use pestdesk::{ClientConfig, ErrorCode, ErrorKind, LifecycleState, Method, RequestOptions};

fn orders() -> Value {
    json!([{"id": 1, "pest": "termites"}, {"id": 2, "pest": "ants"}])
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_repeated_get_is_served_from_cache() {
    let h = harness([Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    let first: Value = h.client.get("/orders").await.unwrap();
    let second: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(first, orders());
    assert_eq!(second, orders());
    assert_eq!(h.transport.calls(), 1, "Second read should hit the cache");
}

#[tokio::test]
async fn test_cached_entry_expires_after_ttl() {
    let h = harness([
        Reply::json(200, json!({"version": 1})),
        Reply::json(200, json!({"version": 2})),
    ]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();
    h.clock.advance(ChronoDuration::seconds(299));
    let cached: Value = h.client.get("/orders").await.unwrap();
    assert_eq!(cached["version"], 1);

    h.clock.advance(ChronoDuration::seconds(1));
    let refetched: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(refetched["version"], 2);
    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_query_order_does_not_change_cache_key() {
    let h = harness([Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    let options = RequestOptions::default().query("status", "open").query("page", "2");
    let _: Value = h.client.get_with("/orders", options).await.unwrap();
    let _: Value = h.client.get("/orders?page=2&status=open").await.unwrap();

    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn test_no_cache_option_always_hits_network() {
    let h = harness([Reply::json(200, orders()), Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    for _ in 0..2 {
        let _: Value = h
            .client
            .get_with("/orders", RequestOptions::default().no_cache())
            .await
            .unwrap();
    }

    assert_eq!(h.transport.calls(), 2);
    assert!(h.client.cache().is_empty());
}

#[tokio::test]
async fn test_write_invalidates_cached_reads_of_same_path() {
    let h = harness([
        Reply::json(200, orders()),
        Reply::json(201, json!({"id": 3})),
        Reply::json(200, json!([])),
    ]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();
    let _: Value = h.client.post("/orders", &json!({"pest": "wasps"})).await.unwrap();
    let after: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(after, json!([]));
    assert_eq!(h.transport.calls(), 3, "Read after write should bypass the cache");
}

#[tokio::test]
async fn test_write_with_extra_invalidation_pattern() {
    let h = harness([
        Reply::json(200, orders()),
        Reply::json(200, json!({"id": 7, "status": "done"})),
        Reply::json(200, orders()),
    ]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();
    h.client
        .request(
            Method::PATCH,
            "/orders/7",
            Some(json!({"status": "done"})),
            RequestOptions::default().invalidate("/orders"),
        )
        .await
        .unwrap();
    let _: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_patch_with_options_invalidates_list_and_sends_headers() {
    let h = harness([
        Reply::json(200, orders()),
        Reply::json(200, json!({"id": 7, "status": "done"})),
        Reply::json(200, orders()),
    ]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();
    let updated: Value = h
        .client
        .patch_with(
            "/orders/7",
            &json!({"status": "done"}),
            RequestOptions::default()
                .header("X-Request-Source", "dispatch-board")
                .invalidate("/orders"),
        )
        .await
        .unwrap();
    let _: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(updated["status"], "done");
    assert_eq!(h.transport.calls(), 3);
    let patch = &h.transport.requests()[1];
    assert_eq!(patch.method, Method::PATCH);
    assert_eq!(patch.header("x-request-source"), Some("dispatch-board"));
}

#[tokio::test]
async fn test_delete_with_query_and_invalidation() {
    let h = harness([
        Reply::json(200, orders()),
        Reply::Respond(204, String::new()),
        Reply::json(200, json!([])),
    ]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders?page=1").await.unwrap();
    let _: Value = h
        .client
        .delete_with(
            "/orders/3",
            RequestOptions::default().query("reason", "duplicate").invalidate("/orders?"),
        )
        .await
        .unwrap();
    let after: Value = h.client.get("/orders?page=1").await.unwrap();

    assert_eq!(after, json!([]));
    assert_eq!(
        h.transport.requests()[1].url.as_str(),
        "https://crm.test/api/orders/3?reason=duplicate"
    );
}

#[tokio::test]
async fn test_post_and_put_with_options_use_their_methods() {
    let h = harness([
        Reply::json(201, json!({"id": 4})),
        Reply::json(200, json!({"id": 4, "pest": "rodents"})),
    ]);
    h.client.set_token("abc", None).unwrap();

    let options = RequestOptions::default().timeout(Duration::from_secs(5));
    let _: Value = h
        .client
        .post_with("/orders", &json!({"pest": "mice"}), options.clone())
        .await
        .unwrap();
    let _: Value = h
        .client
        .put_with("/orders/4", &json!({"pest": "rodents"}), options)
        .await
        .unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[1].method, Method::PUT);
    assert_eq!(requests[1].body, Some(json!({"pest": "rodents"})));
}

#[tokio::test]
async fn test_response_in_flight_during_revocation_is_not_cached() {
    let h = harness([
        Reply::Delayed(
            Duration::from_millis(50),
            200,
            json!({"owner": "alice"}).to_string(),
        ),
        Reply::json(401, json!({"message": "Token revoked"})),
        Reply::json(200, json!({"owner": null})),
    ]);
    h.client.set_token("alice-token", None).unwrap();

    let (slow, revoked) = tokio::join!(
        h.client.get::<Value>("/orders"),
        h.client.get::<Value>("/revoked")
    );
    assert_eq!(slow.unwrap()["owner"], "alice");
    assert!(revoked.unwrap_err().is_auth());
    assert!(!h.client.is_authenticated());
    assert!(h.client.cache().is_empty(), "Revoked session's data must not be cached");

    let anonymous: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(anonymous["owner"], Value::Null);
    assert_eq!(h.transport.calls(), 3);
    assert!(h.transport.requests()[2].header("Authorization").is_none());
}

#[tokio::test]
async fn test_explicit_invalidation_forces_refetch() {
    let h = harness([Reply::json(200, orders()), Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders?page=1").await.unwrap();
    assert_eq!(h.client.invalidate_cache("/orders"), 1);
    let _: Value = h.client.get("/orders?page=1").await.unwrap();

    assert_eq!(h.transport.calls(), 2);
}

#[tokio::test]
async fn test_credential_change_clears_cache() {
    let h = harness([Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();
    assert_eq!(h.client.cache().len(), 1);

    h.client.set_token("someone-else", None).unwrap();
    assert!(h.client.cache().is_empty());
}

#[tokio::test]
async fn test_failed_request_is_not_cached() {
    let h = harness([
        Reply::json(404, json!({"message": "Order not found"})),
        Reply::json(200, json!({"id": 9})),
    ]);
    h.client.set_token("abc", None).unwrap();

    assert!(h.client.get::<Value>("/orders/9").await.is_err());
    let order: Value = h.client.get("/orders/9").await.unwrap();

    assert_eq!(order["id"], 9);
    assert_eq!(h.transport.calls(), 2);
}

// ============================================================================
// Retries and error normalization
// ============================================================================

#[tokio::test]
async fn test_server_error_retried_until_attempts_exhausted() {
    let h = harness([
        Reply::json(500, json!({"message": "database unavailable"})),
        Reply::json(500, json!({"message": "database unavailable"})),
        Reply::json(500, json!({"message": "database unavailable"})),
    ]);
    h.client.set_token("abc", None).unwrap();

    let err = h.client.get::<Value>("/orders").await.unwrap_err();

    assert_eq!(h.transport.calls(), 3);
    assert_eq!(err.kind(), ErrorKind::Server);
    assert_eq!(err.code(), ErrorCode::Status(500));
    assert_eq!(err.message(), "database unavailable");
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let h = harness([
        Reply::Fail(TransportError::Connect("connection reset".to_string())),
        Reply::json(503, json!({})),
        Reply::json(200, orders()),
    ]);
    h.client.set_token("abc", None).unwrap();

    let result: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(result, orders());
    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let h = harness([Reply::json(400, json!({"message": "email is required"}))]);
    h.client.set_token("abc", None).unwrap();

    let err = h
        .client
        .post::<_, Value>("/customers", &json!({}))
        .await
        .unwrap_err();

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(err.kind(), ErrorKind::Client);
    assert_eq!(err.code(), ErrorCode::Status(400));
    assert_eq!(err.message(), "email is required");
    assert_eq!(err.details(), Some(&json!({"message": "email is required"})));
}

#[tokio::test]
async fn test_timeout_is_network_error_after_retries() {
    let config = ClientConfig {
        timeout: Duration::from_millis(20),
        ..ClientConfig::with_base_url(BASE_URL)
    };
    let h = harness_with_config(config, [Reply::Hang, Reply::Hang, Reply::Hang]);
    h.client.set_token("abc", None).unwrap();

    let err = h.client.get::<Value>("/orders").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(err.code(), ErrorCode::NETWORK_ERROR);
    assert_eq!(h.transport.calls(), 3);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error_without_retry() {
    let h = harness([Reply::Respond(200, "<html>maintenance</html>".to_string())]);
    h.client.set_token("abc", None).unwrap();

    let err = h.client.get::<Value>("/orders").await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::PARSE_ERROR);
    assert_eq!(h.transport.calls(), 1);
}

#[tokio::test]
async fn test_empty_success_body_is_null() {
    let h = harness([Reply::Respond(204, String::new())]);
    h.client.set_token("abc", None).unwrap();

    let result: Value = h.client.delete("/orders/3").await.unwrap();

    assert_eq!(result, Value::Null);
    assert_eq!(h.transport.requests()[0].method, Method::DELETE);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_delay_waits_between_attempts() {
    let retry = Arc::new(FixedDelay {
        max_attempts: 3,
        delay: Duration::from_secs(1),
    });
    let h = harness_with(
        ClientConfig::with_base_url(BASE_URL),
        retry,
        Arc::new(MemoryStore::new()),
        [
            Reply::json(500, json!({})),
            Reply::json(502, json!({})),
            Reply::json(200, orders()),
        ],
    );
    h.client.set_token("abc", None).unwrap();

    let started = tokio::time::Instant::now();
    let result: Value = h.client.get("/orders").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result, orders());
    assert!(elapsed >= Duration::from_secs(2), "Waited only {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "Waited {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_doubles_delay() {
    let retry = Arc::new(ExponentialBackoff {
        max_attempts: 4,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(8),
    });
    let h = harness_with(
        ClientConfig::with_base_url(BASE_URL),
        retry,
        Arc::new(MemoryStore::new()),
        [
            Reply::Fail(TransportError::Connect("connection refused".to_string())),
            Reply::json(503, json!({})),
            Reply::json(503, json!({})),
            Reply::json(200, orders()),
        ],
    );
    h.client.set_token("abc", None).unwrap();

    let started = tokio::time::Instant::now();
    let _: Value = h.client.get("/orders").await.unwrap();
    let elapsed = started.elapsed();

    // 100ms + 200ms + 400ms
    assert!(elapsed >= Duration::from_millis(700), "Waited only {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "Waited {:?}", elapsed);
    assert_eq!(h.transport.calls(), 4);
}

// ============================================================================
// Credentials and token lifecycle
// ============================================================================

#[tokio::test]
async fn test_bearer_token_attached() {
    let h = harness([Reply::json(200, orders())]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h.client.get("/orders").await.unwrap();

    let request = &h.transport.requests()[0];
    assert_eq!(request.header("authorization"), Some("Bearer abc"));
    assert_eq!(request.url.as_str(), "https://crm.test/api/orders");
}

#[tokio::test]
async fn test_request_without_session_sends_no_token() {
    let h = harness([Reply::json(200, json!({"status": "ok"}))]);

    let _: Value = h.client.get("/health").await.unwrap();

    assert!(h.transport.requests()[0].header("Authorization").is_none());
}

#[tokio::test]
async fn test_public_request_skips_token() {
    let h = harness([Reply::json(200, json!({"status": "ok"}))]);
    h.client.set_token("abc", None).unwrap();

    let _: Value = h
        .client
        .get_with("/health", RequestOptions::default().public())
        .await
        .unwrap();

    assert!(h.transport.requests()[0].header("Authorization").is_none());
}

#[tokio::test]
async fn test_unauthorized_response_clears_credential() {
    let h = harness([Reply::json(401, json!({"message": "Token revoked"}))]);
    h.client.set_token("abc", Some("r1")).unwrap();

    let err = h.client.get::<Value>("/orders").await.unwrap_err();

    assert!(err.is_auth());
    assert_eq!(err.code(), ErrorCode::Status(401));
    assert_eq!(err.message(), "Token revoked");
    assert_eq!(h.transport.calls(), 1, "401 is never retried");
    assert!(!h.client.is_authenticated());
    assert!(h.client.credentials().refresh_token().is_none());
}

#[tokio::test]
async fn test_expired_token_fails_before_any_io() {
    let h = harness(Vec::<Reply>::new());
    h.client.set_token("abc", Some("r1")).unwrap();
    h.clock.advance(ChronoDuration::days(7));

    let err = h.client.get::<Value>("/orders").await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::AUTH_REQUIRED);
    assert!(err.is_auth());
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.client.lifecycle_state(), LifecycleState::Absent);
}

#[tokio::test]
async fn test_expiring_token_refreshed_before_request() {
    let h = harness([
        Reply::json(200, json!({"accessToken": "new", "refreshToken": "r2"})),
        Reply::json(200, orders()),
    ]);
    h.client.set_token("old", Some("r1")).unwrap();
    h.clock.advance(ChronoDuration::days(6) + ChronoDuration::hours(23));
    assert_eq!(h.client.lifecycle_state(), LifecycleState::ExpiringSoon);

    let result: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(result, orders());
    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);

    let refresh = &requests[0];
    assert_eq!(refresh.method, Method::POST);
    assert_eq!(refresh.url.path(), "/api/auth/refresh");
    assert_eq!(refresh.body, Some(json!({"refreshToken": "r1"})));
    assert!(refresh.header("Authorization").is_none());

    assert_eq!(requests[1].header("Authorization"), Some("Bearer new"));
    assert_eq!(h.client.lifecycle_state(), LifecycleState::Fresh);
    assert_eq!(h.client.credentials().refresh_token().as_deref(), Some("r2"));
}

#[tokio::test]
async fn test_failed_refresh_proceeds_with_current_token() {
    let h = harness([
        Reply::json(500, json!({"message": "refresh unavailable"})),
        Reply::json(200, orders()),
    ]);
    h.client.set_token("old", Some("r1")).unwrap();
    h.clock.advance(ChronoDuration::days(6) + ChronoDuration::hours(23));

    let result: Value = h.client.get("/orders").await.unwrap();

    assert_eq!(result, orders());
    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2, "Refresh is attempted once and not retried");
    assert_eq!(requests[1].header("Authorization"), Some("Bearer old"));
    assert_eq!(h.client.lifecycle_state(), LifecycleState::ExpiringSoon);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_refresh() {
    let h = harness([
        Reply::json(200, json!({"accessToken": "new"})),
        Reply::json(200, orders()),
        Reply::json(200, json!({"id": 1})),
    ]);
    h.client.set_token("old", Some("r1")).unwrap();
    h.clock.advance(ChronoDuration::days(6) + ChronoDuration::hours(23));

    let (a, b) = tokio::join!(
        h.client.get::<Value>("/orders"),
        h.client.get::<Value>("/users/profile")
    );
    assert!(a.is_ok());
    assert!(b.is_ok());

    let requests = h.transport.requests();
    let refreshes = requests
        .iter()
        .filter(|r| r.url.path() == "/api/auth/refresh")
        .count();
    assert_eq!(refreshes, 1);
    assert!(requests[1..]
        .iter()
        .all(|r| r.header("Authorization") == Some("Bearer new")));
}

// ============================================================================
// Session operations
// ============================================================================

#[tokio::test]
async fn test_login_stores_tokens() {
    let h = harness([Reply::json(
        200,
        json!({"token": "abc", "refreshToken": "r1", "user": {"email": "ops@example.com"}}),
    )]);

    let response = h.client.login("ops@example.com", "hunter2").await.unwrap();

    assert_eq!(response["user"]["email"], "ops@example.com");
    assert!(h.client.is_authenticated());
    assert_eq!(h.client.credentials().refresh_token().as_deref(), Some("r1"));
    assert_eq!(h.client.lifecycle_state(), LifecycleState::Fresh);

    let request = &h.transport.requests()[0];
    assert_eq!(request.url.path(), "/api/auth/login");
    assert_eq!(
        request.body,
        Some(json!({"email": "ops@example.com", "password": "hunter2"}))
    );
    assert!(request.header("Authorization").is_none());
}

#[tokio::test]
async fn test_login_rejected_leaves_no_session() {
    let h = harness([Reply::json(401, json!({"message": "Invalid credentials"}))]);

    let err = h.client.login("ops@example.com", "wrong").await.unwrap_err();

    assert_eq!(err.message(), "Invalid credentials");
    assert!(!h.client.is_authenticated());
}

#[tokio::test]
async fn test_logout_clears_session_and_cache() {
    let h = harness([Reply::json(200, orders())]);
    h.client.set_token("abc", Some("r1")).unwrap();
    let _: Value = h.client.get("/orders").await.unwrap();

    h.client.logout();

    assert!(!h.client.is_authenticated());
    assert!(h.client.cache().is_empty());
}

#[tokio::test]
async fn test_fetch_profile_uses_profile_path() {
    let h = harness([Reply::json(200, json!({"name": "Dana", "role": "technician"}))]);
    h.client.set_token("abc", None).unwrap();

    let profile: Value = h.client.fetch_profile().await.unwrap();
    let again: Value = h.client.fetch_profile().await.unwrap();

    assert_eq!(profile["role"], "technician");
    assert_eq!(again, profile);
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.transport.requests()[0].url.path(), "/api/users/profile");
}

#[tokio::test]
async fn test_session_persisted_in_storage() {
    use pestdesk::storage::KeyValueStore;

    let h = harness(Vec::<Reply>::new());
    h.client.set_token("abc", Some("r1")).unwrap();

    assert_eq!(h.storage.get("pestdesk.access_token").as_deref(), Some("abc"));
    assert_eq!(h.storage.get("pestdesk.refresh_token").as_deref(), Some("r1"));
    assert!(h.storage.get("pestdesk.token_issued_at").is_some());
}

#[tokio::test]
async fn test_login_with_unwritable_session_file_keeps_session() {
    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let blocker = temp_dir.path().join("not-a-dir");
    std::fs::write(&blocker, "").unwrap();
    let storage = Arc::new(FileStore::open(blocker.join("session.json")));

    let h = harness_with(
        ClientConfig::with_base_url(BASE_URL),
        no_wait_retries(),
        storage,
        [
            Reply::json(200, json!({"token": "abc"})),
            Reply::json(200, orders()),
        ],
    );

    assert!(h.client.login("ops@example.com", "hunter2").await.is_ok());
    assert!(h.client.is_authenticated());
    assert_eq!(h.client.lifecycle_state(), LifecycleState::Fresh);

    let _: Value = h.client.get("/orders").await.unwrap();
    assert_eq!(h.transport.requests()[1].header("Authorization"), Some("Bearer abc"));
}

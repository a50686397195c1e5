//! End-to-end session behaviour against a mock marketplace API.

use std::sync::Arc;
use std::time::Duration;

use realty_core::api::HttpTransport;
use realty_core::auth::{FileCredentialStore, MemoryCredentialStore};
use realty_core::{
    ApiError, ApiRequest, AuthError, CredentialPair, CredentialStore, RefreshError, RefreshPolicy,
    SendError, SessionClient, SessionContext,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, store: Arc<dyn CredentialStore>) -> SessionClient {
    let transport = HttpTransport::new(server.uri(), Duration::from_secs(5)).unwrap();
    SessionClient::with_policy(
        Arc::new(transport),
        SessionContext::new(store),
        RefreshPolicy::no_retry(),
    )
}

fn stale_store() -> Arc<dyn CredentialStore> {
    Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
        "stale", "r-old",
    )))
}

async fn mount_listings(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/listings"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "jwt expired"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/listings"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"id": 1}]})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn concurrent_expired_requests_refresh_once() {
    let server = MockServer::start().await;
    mount_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/session/refresh"))
        .and(body_json(json!({"refresh_token": "r-old"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "fresh", "refresh_token": "r-new"}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, stale_store());
    let a = client.attach_credential(ApiRequest::get("/listings"));
    let b = client.attach_credential(ApiRequest::get("/listings"));

    let (a, b) = tokio::join!(client.send(a), client.send(b));
    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);

    assert_eq!(
        client.store().get(),
        Some(CredentialPair::new("fresh", "r-new"))
    );
    assert_eq!(client.session().access_token().as_deref(), Some("fresh"));
    server.verify().await;
}

#[tokio::test]
async fn second_rejection_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/properties/9"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/session/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "fresh", "refresh_token": "r-new"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, stale_store());
    let err = client.delete("/properties/9").await.unwrap_err();

    assert!(matches!(err, ApiError::Auth(AuthError::RetryRejected { .. })));
    assert!(client.session().is_authenticated());
    server.verify().await;
}

#[tokio::test]
async fn rejected_refresh_token_ends_session() {
    let server = MockServer::start().await;
    mount_listings(&server).await;
    Mock::given(method("POST"))
        .and(path("/auth/session/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "revoked"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file_store = Arc::new(FileCredentialStore::open(dir.path()).unwrap());
    file_store
        .replace(CredentialPair::new("stale", "r-old"))
        .unwrap();
    let client = client_for(&server, file_store.clone());

    let err = client
        .send(client.attach_credential(ApiRequest::get("/listings")))
        .await
        .unwrap_err();
    match err {
        SendError::Unauthorized(AuthError::RefreshFailed(RefreshError::RemoteRejected {
            status,
            body,
        })) => {
            assert_eq!(status, 401);
            assert!(body.contains("revoked"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(file_store.get().is_none());
    assert!(!file_store.path().exists());
    assert!(!client.session().snapshot().is_authenticated);
    server.verify().await;
}

#[tokio::test]
async fn anonymous_401_never_calls_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dashboard"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/session/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryCredentialStore::new()));
    let err = client.get_json::<serde_json::Value>("/dashboard").await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::Auth(AuthError::RefreshFailed(RefreshError::NoRefreshToken))
    ));
    assert!(err.ended_session());
    server.verify().await;
}

#[tokio::test]
async fn other_statuses_reach_the_caller() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/properties"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"message": "price required"})))
        .mount(&server)
        .await;

    let client = client_for(&server, stale_store());
    let response = client
        .send(
            client.attach_credential(ApiRequest::post("/properties").json_value(json!({"title": "Loft"}))),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 422);

    let err = client
        .post_json::<serde_json::Value, _>("/properties", &json!({"title": "Loft"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(ref body) if body.contains("price required")));
}

#[tokio::test]
async fn sign_in_then_who_am_i() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/signin"))
        .and(body_json(json!({"email": "dev@example.com", "password": "pw"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "refresh_token": "r1",
            "user": {"id": "u1", "email": "dev@example.com", "role": "developer"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": {"id": "u1", "email": "dev@example.com", "name": "Dev Eloper"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryCredentialStore::new()));
    let mut changes = client.session().subscribe();

    let user = client.sign_in("dev@example.com", "pw").await.unwrap().unwrap();
    assert_eq!(user.role(), Some("developer"));
    assert!(changes.has_changed().unwrap());
    assert!(changes.borrow_and_update().is_authenticated);

    let me = client.fetch_current_user().await.unwrap();
    assert_eq!(me.display_name().as_deref(), Some("Dev Eloper"));
    assert_eq!(client.session().user(), Some(me));

    client.sign_out();
    assert!(!client.session().is_authenticated());
    assert!(client.store().get().is_none());
    server.verify().await;
}

#[tokio::test]
async fn wrong_password_is_reported_as_invalid_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/signin"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "bad credentials"})))
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryCredentialStore::new()));
    let err = client.sign_in("dev@example.com", "nope").await.unwrap_err();

    assert!(matches!(err, ApiError::InvalidCredentials));
    assert!(!client.session().is_authenticated());
}

#[tokio::test]
async fn email_verification_and_password_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/verify-email"))
        .and(body_json(json!({"email": "a@example.com", "token": "123456"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "message": "Email verified"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/forgot-password"))
        .and(body_json(json!({"email": "a@example.com"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/verify-reset-token"))
        .and(body_json(json!({"email": "a@example.com", "token": "expired"})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "Token expired"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/reset-password"))
        .and(body_json(
            json!({"email": "a@example.com", "token": "654321", "password": "n3w-pass"}),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryCredentialStore::new()));

    let verified = client.verify_email("a@example.com", "123456").await.unwrap();
    assert!(verified.success);
    assert_eq!(verified.message.as_deref(), Some("Email verified"));

    client.forgot_password("a@example.com").await.unwrap();

    let err = client
        .verify_reset_token("a@example.com", "expired")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(ref body) if body.contains("Token expired")));

    client
        .reset_password("a@example.com", "654321", "n3w-pass")
        .await
        .unwrap();

    // None of these touch the session
    assert!(!client.session().is_authenticated());
    server.verify().await;
}

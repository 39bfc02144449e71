use cloudsnap_core::OAuthClient;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn authorize_url_carries_client_and_scope() {
    let client = OAuthClient::with_base_url("https://auth.example", "id-1", "secret-1").unwrap();
    let url = client
        .authorize_url("http://127.0.0.1:1", "store.file")
        .unwrap();
    let query = url.query().unwrap();
    assert!(query.contains("response_type=code"));
    assert!(query.contains("client_id=id-1"));
    assert!(query.contains("scope=store.file"));
}

#[tokio::test]
async fn exchange_code_returns_refresh_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=4%2Fabc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-1",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "refresh-1"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "id-1", "secret-1").unwrap();
    let token = client
        .exchange_code("4/abc", "http://127.0.0.1:1")
        .await
        .unwrap();
    assert_eq!(token.access_token, "access-1");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
}

#[tokio::test]
async fn refresh_token_grant_yields_new_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "access-2",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "id-1", "secret-1").unwrap();
    let token = client.refresh_token("refresh-1").await.unwrap();
    assert_eq!(token.access_token, "access-2");
    assert!(token.refresh_token.is_none());
}

#[tokio::test]
async fn token_endpoint_errors_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "id-1", "secret-1").unwrap();
    let err = client.refresh_token("stale").await.unwrap_err();
    assert!(matches!(err, cloudsnap_core::OAuthError::Api { .. }));
}

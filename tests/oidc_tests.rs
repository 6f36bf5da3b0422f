//! OIDC provider flow tests: discovery, authorize (code + PKCE), token
//! exchange, refresh rotation, revocation, and userinfo.

mod helpers;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower::ServiceExt;

use helpers::{TEST_JWK_E, TEST_JWK_N, TEST_KID, TEST_RSA_PEM};
use llm_gateway::auth::{KeySource, RevocationList, TokenValidator};
use llm_gateway::config::{AuthConfig, Config, JwkConfig};
use llm_gateway::domain::Tier;
use llm_gateway::oidc::{OidcState, SqliteOidcStore, TokenIssuer};
use llm_gateway::ratelimit::RateLimiter;
use llm_gateway::storage::{Database, SqliteIdentityStore};

const ISSUER: &str = "http://localhost:8080";
const REDIRECT_URI: &str = "https://app.example.com/callback";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

struct OidcFixture {
    router: Router,
    validator: Arc<TokenValidator>,
    _dir: tempfile::TempDir,
}

fn auth_config() -> AuthConfig {
    AuthConfig {
        issuer: ISSUER.to_string(),
        audience: "llm-gateway".to_string(),
        signing_key_pem: TEST_RSA_PEM.to_string(),
        jwk: JwkConfig {
            kid: TEST_KID.to_string(),
            n: TEST_JWK_N.to_string(),
            e: TEST_JWK_E.to_string(),
        },
        jwks_url: None,
        access_token_ttl_secs: 3600,
        refresh_token_ttl_secs: 86400,
    }
}

async fn fixture() -> OidcFixture {
    let dir = tempfile::tempdir().unwrap();
    let db_config = llm_gateway::config::DatabaseConfig {
        url: format!("sqlite:{}", dir.path().join("oidc-test.db").display()),
        pool_size: 5,
        deduction_timeout_secs: 5,
    };
    let db = Database::connect(&db_config).await.unwrap();
    db.migrate().await.unwrap();
    let pool = db.pool().clone();

    // Seed an end user and a public client.
    sqlx::query(
        "INSERT INTO users (id, email, email_verified, name, is_active, role, tier, updated_at) \
         VALUES ('alice', 'alice@example.com', 1, 'Alice', 1, 'user', 'pro', ?)",
    )
    .bind(Utc::now())
    .execute(&pool)
    .await
    .unwrap();

    let store = SqliteOidcStore::new(pool.clone());
    store
        .register_client("web-app", "Web App", &[REDIRECT_URI.to_string()], None)
        .await
        .unwrap();
    store
        .register_client(
            "backend",
            "Backend",
            &[REDIRECT_URI.to_string()],
            Some("s3cret"),
        )
        .await
        .unwrap();

    let config = auth_config();
    let revocations = RevocationList::new();
    let validator = Arc::new(TokenValidator::new(
        KeySource::local(&config.jwk).unwrap(),
        config.issuer.clone(),
        config.audience.clone(),
        revocations.clone(),
    ));

    let state = OidcState {
        auth_config: Arc::new(config.clone()),
        identity: Arc::new(SqliteIdentityStore::new(pool.clone())),
        store: Arc::new(store),
        issuer: Arc::new(TokenIssuer::new(&config).unwrap()),
        validator: validator.clone(),
        revocations,
        limiter: Arc::new(RateLimiter::in_memory(&Config::default())),
    };

    OidcFixture {
        router: llm_gateway::oidc::router(state),
        validator,
        _dir: dir,
    }
}

fn challenge() -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes()))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get_auth_code(fixture: &OidcFixture) -> String {
    let uri = format!(
        "/oauth/authorize?response_type=code&client_id=web-app&redirect_uri={}&scope=openid%20llm.inference&state=xyz&code_challenge={}&code_challenge_method=S256",
        url::form_urlencoded::byte_serialize(REDIRECT_URI.as_bytes()).collect::<String>(),
        challenge(),
    );
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::get(&uri)
                .header("x-authenticated-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with(REDIRECT_URI));
    assert!(location.contains("state=xyz"));

    let code = location
        .split("code=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap();
    code.to_string()
}

async fn exchange_code(fixture: &OidcFixture, code: &str, verifier: &str) -> axum::response::Response {
    let form = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id=web-app&code_verifier={}",
        code,
        url::form_urlencoded::byte_serialize(REDIRECT_URI.as_bytes()).collect::<String>(),
        verifier,
    );
    fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn discovery_document_advertises_pkce_and_rs256() {
    let fixture = fixture().await;
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::get("/.well-known/openid-configuration")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_json(response).await;
    assert_eq!(doc["issuer"], ISSUER);
    assert_eq!(doc["response_types_supported"][0], "code");
    assert_eq!(doc["code_challenge_methods_supported"][0], "S256");
    assert_eq!(doc["id_token_signing_alg_values_supported"][0], "RS256");
    assert_eq!(
        doc["token_endpoint"],
        format!("{}/oauth/token", ISSUER)
    );
}

#[tokio::test]
async fn jwks_serves_the_signing_key() {
    let fixture = fixture().await;
    let response = fixture
        .router
        .clone()
        .oneshot(Request::get("/.well-known/jwks.json").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let doc = body_json(response).await;
    assert_eq!(doc["keys"][0]["kid"], TEST_KID);
    assert_eq!(doc["keys"][0]["kty"], "RSA");
    assert_eq!(doc["keys"][0]["n"], TEST_JWK_N);
}

#[tokio::test]
async fn full_code_flow_with_pkce_issues_valid_tokens() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;

    let response = exchange_code(&fixture, &code, VERIFIER).await;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = body_json(response).await;

    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);
    assert!(tokens["id_token"].is_string());

    // The access token validates and carries subject, tier, and scope.
    let claims = fixture
        .validator
        .validate(tokens["access_token"].as_str().unwrap())
        .await
        .expect("token should validate");
    assert_eq!(claims.sub, "alice");
    assert_eq!(claims.tier(), Some(Tier::Pro));
    assert!(claims.scopes().contains(&"llm.inference".to_string()));
}

#[tokio::test]
async fn wrong_pkce_verifier_is_rejected() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;

    let response = exchange_code(&fixture, &code, "totally-wrong-verifier-42").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn authorization_code_is_single_use() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;

    let first = exchange_code(&fixture, &code, VERIFIER).await;
    assert_eq!(first.status(), StatusCode::OK);

    let replay = exchange_code(&fixture, &code, VERIFIER).await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let body = body_json(replay).await;
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn public_client_requires_pkce() {
    let fixture = fixture().await;
    let uri = format!(
        "/oauth/authorize?response_type=code&client_id=web-app&redirect_uri={}&scope=openid",
        url::form_urlencoded::byte_serialize(REDIRECT_URI.as_bytes()).collect::<String>(),
    );
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::get(&uri)
                .header("x-authenticated-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unregistered_redirect_uri_never_redirects() {
    let fixture = fixture().await;
    let uri = format!(
        "/oauth/authorize?response_type=code&client_id=web-app&redirect_uri=https%3A%2F%2Fevil.example.com&scope=openid&code_challenge={}&code_challenge_method=S256",
        challenge(),
    );
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::get(&uri)
                .header("x-authenticated-user", "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(header::LOCATION).is_none());
}

#[tokio::test]
async fn refresh_grant_rotates_the_token() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;
    let tokens = body_json(exchange_code(&fixture, &code, VERIFIER).await).await;
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let form = format!(
        "grant_type=refresh_token&refresh_token={}&client_id=web-app",
        refresh
    );
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let new_tokens = body_json(response).await;
    assert_ne!(new_tokens["refresh_token"], tokens["refresh_token"]);

    // The old refresh token died with the rotation.
    let replay = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn revoked_refresh_token_stops_working() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;
    let tokens = body_json(exchange_code(&fixture, &code, VERIFIER).await).await;
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    let revoke_form = format!("token={}&client_id=web-app", refresh);
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/revoke")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(revoke_form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let form = format!(
        "grant_type=refresh_token&refresh_token={}&client_id=web-app",
        refresh
    );
    let after = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn userinfo_returns_profile_claims() {
    let fixture = fixture().await;
    let code = get_auth_code(&fixture).await;
    let tokens = body_json(exchange_code(&fixture, &code, VERIFIER).await).await;

    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::get("/oauth/userinfo")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", tokens["access_token"].as_str().unwrap()),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let profile = body_json(response).await;
    assert_eq!(profile["sub"], "alice");
    assert_eq!(profile["email"], "alice@example.com");
    assert_eq!(profile["email_verified"], true);
    assert_eq!(profile["name"], "Alice");
}

#[tokio::test]
async fn confidential_client_requires_secret() {
    let fixture = fixture().await;

    // Without a secret the backend client is rejected.
    let form = "grant_type=refresh_token&refresh_token=whatever&client_id=backend";
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A wrong secret is also rejected.
    let form = "grant_type=refresh_token&refresh_token=whatever&client_id=backend&client_secret=guess";
    let response = fixture
        .router
        .clone()
        .oneshot(
            Request::post("/oauth/token")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authorize_without_login_is_rejected() {
    let fixture = fixture().await;
    let uri = format!(
        "/oauth/authorize?response_type=code&client_id=web-app&redirect_uri={}&scope=openid&code_challenge={}&code_challenge_method=S256",
        url::form_urlencoded::byte_serialize(REDIRECT_URI.as_bytes()).collect::<String>(),
        challenge(),
    );
    let response = fixture
        .router
        .clone()
        .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "login_required");
}

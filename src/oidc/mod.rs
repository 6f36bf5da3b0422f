//! OIDC provider surface: discovery, authorize (code + PKCE), token,
//! revoke, and userinfo. Identity (login/consent) is an external
//! collaborator: the front-end authenticates the user and forwards the
//! subject in a trusted header; this module owns codes, tokens, and claims.

pub mod pkce;
pub mod store;
pub mod tokens;

pub use store::{OidcStore, SqliteOidcStore};
pub use tokens::TokenIssuer;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::{RevocationList, TokenValidator};
use crate::config::AuthConfig;
use crate::ratelimit::RateLimiter;
use crate::storage::IdentityStore;
use store::{new_session, RefreshTokenRecord};

/// Header the external login front-end uses to convey the authenticated
/// subject to the authorize endpoint.
pub const AUTHENTICATED_SUBJECT_HEADER: &str = "x-authenticated-user";

pub const SUPPORTED_SCOPES: &[&str] = &[
    "openid",
    "email",
    "profile",
    "models.read",
    "llm.inference",
    "user.info",
    "credits.read",
    "admin",
];

#[derive(Clone)]
pub struct OidcState {
    pub auth_config: Arc<AuthConfig>,
    pub identity: Arc<dyn IdentityStore>,
    pub store: Arc<dyn OidcStore>,
    pub issuer: Arc<TokenIssuer>,
    pub validator: Arc<TokenValidator>,
    pub revocations: RevocationList,
    pub limiter: Arc<RateLimiter>,
}

pub fn router(state: OidcState) -> Router {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(discovery_document),
        )
        .route("/.well-known/jwks.json", get(jwks_document))
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .route("/oauth/userinfo", get(userinfo))
        .with_state(state)
}

// ===== RFC 6749 error shape =====

#[derive(Debug)]
struct OauthError {
    status: StatusCode,
    error: &'static str,
    description: String,
}

impl OauthError {
    fn invalid_request(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_request",
            description: description.into(),
        }
    }

    fn invalid_client(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "invalid_client",
            description: description.into(),
        }
    }

    fn invalid_grant(description: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "invalid_grant",
            description: description.into(),
        }
    }

    fn login_required() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "login_required",
            description: "no authenticated subject; complete login first".into(),
        }
    }

    fn slow_down(retry_after: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            error: "slow_down",
            description: format!("rate limited, retry after {}s", retry_after),
        }
    }

    fn server_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "server_error",
            description: "internal error".into(),
        }
    }
}

impl IntoResponse for OauthError {
    fn into_response(self) -> Response {
        debug!(error = self.error, description = %self.description, "oauth error");
        (
            self.status,
            Json(json!({
                "error": self.error,
                "error_description": self.description,
            })),
        )
            .into_response()
    }
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "local".to_string())
}

async fn check_ip_limit(state: &OidcState, headers: &HeaderMap) -> Result<(), OauthError> {
    let admission = state.limiter.admit_ip(&client_ip(headers)).await;
    match admission {
        crate::ratelimit::Admission::Allow { .. } => Ok(()),
        crate::ratelimit::Admission::Deny {
            retry_after_secs, ..
        } => Err(OauthError::slow_down(retry_after_secs)),
    }
}

// ===== Discovery =====

async fn discovery_document(State(state): State<OidcState>) -> Json<serde_json::Value> {
    let issuer = &state.auth_config.issuer;
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{}/oauth/authorize", issuer),
        "token_endpoint": format!("{}/oauth/token", issuer),
        "userinfo_endpoint": format!("{}/oauth/userinfo", issuer),
        "jwks_uri": format!("{}/.well-known/jwks.json", issuer),
        "revocation_endpoint": format!("{}/oauth/revoke", issuer),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "scopes_supported": SUPPORTED_SCOPES,
        "id_token_signing_alg_values_supported": ["RS256"],
        "token_endpoint_auth_methods_supported": ["none", "client_secret_post"],
        "subject_types_supported": ["public"],
    }))
}

async fn jwks_document(State(state): State<OidcState>) -> Json<serde_json::Value> {
    let jwk = &state.auth_config.jwk;
    Json(json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": jwk.kid,
            "n": jwk.n,
            "e": jwk.e,
        }]
    }))
}

// ===== Authorize =====

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
    #[serde(default)]
    nonce: Option<String>,
}

async fn authorize(
    State(state): State<OidcState>,
    Query(query): Query<AuthorizeQuery>,
    headers: HeaderMap,
) -> Result<Response, OauthError> {
    check_ip_limit(&state, &headers).await?;

    if query.response_type != "code" {
        return Err(OauthError::invalid_request(
            "only the authorization code flow is supported",
        ));
    }

    let client = state
        .store
        .get_client(&query.client_id)
        .await
        .map_err(|_| OauthError::server_error())?
        .ok_or_else(|| OauthError::invalid_client("unknown client"))?;

    if !client.allows_redirect(&query.redirect_uri) {
        // Never redirect to an unregistered URI.
        return Err(OauthError::invalid_request("unregistered redirect_uri"));
    }

    // PKCE is mandatory for public clients and honored for confidential ones.
    let code_challenge = match (&query.code_challenge, &query.code_challenge_method) {
        (Some(challenge), Some(method)) if method == "S256" => challenge.clone(),
        (Some(_), Some(_)) => {
            return Err(OauthError::invalid_request(
                "code_challenge_method must be S256",
            ))
        }
        (Some(_), None) => {
            return Err(OauthError::invalid_request(
                "code_challenge_method is required",
            ))
        }
        (None, _) if client.is_public => {
            return Err(OauthError::invalid_request(
                "PKCE is required for public clients",
            ))
        }
        (None, _) => String::new(),
    };

    // The login/consent front-end (external collaborator) authenticates the
    // end user and forwards the subject.
    let subject = headers
        .get(AUTHENTICATED_SUBJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(OauthError::login_required)?;

    let user = state
        .identity
        .get_user(&subject)
        .await
        .map_err(|_| OauthError::server_error())?
        .filter(|u| u.is_active)
        .ok_or_else(OauthError::login_required)?;

    let code = pkce::random_token();
    let session = new_session(
        code.clone(),
        client.client_id.clone(),
        user.id.clone(),
        query.redirect_uri.clone(),
        query.scope.clone(),
        code_challenge,
        query.nonce.clone(),
    );
    state
        .store
        .create_session(&session)
        .await
        .map_err(|_| OauthError::server_error())?;

    let mut location = format!("{}?code={}", query.redirect_uri, code);
    if let Some(csrf_state) = &query.state {
        location.push_str(&format!("&state={}", urlencode(csrf_state)));
    }

    debug!(client_id = %client.client_id, user_id = %user.id, "authorization code issued");
    Ok(Redirect::to(&location).into_response())
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

// ===== Token =====

#[derive(Debug, Deserialize)]
struct TokenForm {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    refresh_token: String,
    scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
}

async fn token(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenResponse>, OauthError> {
    check_ip_limit(&state, &headers).await?;

    match form.grant_type.as_str() {
        "authorization_code" => exchange_code(&state, form).await,
        "refresh_token" => exchange_refresh(&state, form).await,
        other => Err(OauthError::invalid_request(format!(
            "unsupported grant_type: {}",
            other
        ))),
    }
}

async fn authenticate_client(
    state: &OidcState,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Result<store::OAuthClient, OauthError> {
    let client_id = client_id.ok_or_else(|| OauthError::invalid_request("client_id required"))?;
    let client = state
        .store
        .get_client(client_id)
        .await
        .map_err(|_| OauthError::server_error())?
        .ok_or_else(|| OauthError::invalid_client("unknown client"))?;

    if !client.is_public {
        // client_secret_post for confidential clients.
        let secret = client_secret
            .ok_or_else(|| OauthError::invalid_client("client_secret required"))?;
        if !client.verify_secret(secret) {
            return Err(OauthError::invalid_client("bad client credentials"));
        }
    }
    Ok(client)
}

async fn exchange_code(
    state: &OidcState,
    form: TokenForm,
) -> Result<Json<TokenResponse>, OauthError> {
    let client = authenticate_client(
        state,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )
    .await?;

    let code = form
        .code
        .ok_or_else(|| OauthError::invalid_request("code required"))?;

    let session = state
        .store
        .consume_session(&code)
        .await
        .map_err(|_| OauthError::server_error())?
        .ok_or_else(|| OauthError::invalid_grant("unknown code"))?;

    if !session.is_valid() {
        warn!(client_id = %client.client_id, "expired or replayed authorization code");
        return Err(OauthError::invalid_grant("code expired or already used"));
    }
    if session.client_id != client.client_id {
        return Err(OauthError::invalid_grant("code issued to another client"));
    }
    if form.redirect_uri.as_deref() != Some(session.redirect_uri.as_str()) {
        return Err(OauthError::invalid_grant("redirect_uri mismatch"));
    }

    if !session.code_challenge.is_empty() {
        let verifier = form
            .code_verifier
            .ok_or_else(|| OauthError::invalid_request("code_verifier required"))?;
        if !pkce::verify_s256(&verifier, &session.code_challenge) {
            return Err(OauthError::invalid_grant("PKCE verification failed"));
        }
    } else if client.is_public {
        return Err(OauthError::invalid_grant("PKCE required for public clients"));
    }

    let user = state
        .identity
        .get_user(&session.user_id)
        .await
        .map_err(|_| OauthError::server_error())?
        .filter(|u| u.is_active)
        .ok_or_else(|| OauthError::invalid_grant("subject no longer valid"))?;

    issue_tokens(state, &client.client_id, &user, &session.scope, session.nonce).await
}

async fn exchange_refresh(
    state: &OidcState,
    form: TokenForm,
) -> Result<Json<TokenResponse>, OauthError> {
    let client = authenticate_client(
        state,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )
    .await?;

    let refresh_token = form
        .refresh_token
        .ok_or_else(|| OauthError::invalid_request("refresh_token required"))?;

    let record = state
        .store
        .get_refresh_token(&refresh_token)
        .await
        .map_err(|_| OauthError::server_error())?
        .ok_or_else(|| OauthError::invalid_grant("unknown refresh token"))?;

    if record.revoked || record.expires_at <= Utc::now() {
        return Err(OauthError::invalid_grant("refresh token expired or revoked"));
    }
    if record.client_id != client.client_id {
        return Err(OauthError::invalid_grant("token issued to another client"));
    }

    let user = state
        .identity
        .get_user(&record.user_id)
        .await
        .map_err(|_| OauthError::server_error())?
        .filter(|u| u.is_active)
        .ok_or_else(|| OauthError::invalid_grant("subject no longer valid"))?;

    // Rotation: the presented token dies with this exchange.
    state
        .store
        .revoke_refresh_token(&refresh_token)
        .await
        .map_err(|_| OauthError::server_error())?;

    issue_tokens(state, &client.client_id, &user, &record.scope, None).await
}

async fn issue_tokens(
    state: &OidcState,
    client_id: &str,
    user: &crate::domain::UserProfile,
    scope: &str,
    nonce: Option<String>,
) -> Result<Json<TokenResponse>, OauthError> {
    let access_token = state
        .issuer
        .issue_access_token(user, scope)
        .map_err(|_| OauthError::server_error())?;

    let refresh_token = pkce::random_token();
    let record = RefreshTokenRecord {
        user_id: user.id.clone(),
        client_id: client_id.to_string(),
        scope: scope.to_string(),
        expires_at: Utc::now() + Duration::seconds(state.auth_config.refresh_token_ttl_secs),
        revoked: false,
    };
    state
        .store
        .store_refresh_token(&refresh_token, &record)
        .await
        .map_err(|_| OauthError::server_error())?;

    let id_token = if scope.split_whitespace().any(|s| s == "openid") {
        Some(
            state
                .issuer
                .issue_id_token(user, client_id, nonce)
                .map_err(|_| OauthError::server_error())?,
        )
    } else {
        None
    };

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.issuer.access_ttl_secs(),
        refresh_token,
        scope: scope.to_string(),
        id_token,
    }))
}

// ===== Revoke =====

#[derive(Debug, Deserialize)]
struct RevokeForm {
    token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type_hint: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

async fn revoke(
    State(state): State<OidcState>,
    headers: HeaderMap,
    Form(form): Form<RevokeForm>,
) -> Result<StatusCode, OauthError> {
    check_ip_limit(&state, &headers).await?;
    authenticate_client(
        &state,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )
    .await?;

    // Try as a refresh token first, then as an access token jti.
    let revoked = state
        .store
        .revoke_refresh_token(&form.token)
        .await
        .map_err(|_| OauthError::server_error())?;

    if !revoked {
        if let Ok(claims) = state.validator.validate(&form.token).await {
            state.revocations.revoke(&claims.jti).await;
        }
    }

    // RFC 7009: revocation always reports success.
    Ok(StatusCode::OK)
}

// ===== Userinfo =====

async fn userinfo(
    State(state): State<OidcState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, OauthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| OauthError::invalid_client("bearer token required"))?;

    let claims = state
        .validator
        .validate(token)
        .await
        .map_err(|_| OauthError::invalid_client("invalid token"))?;

    let user = state
        .identity
        .get_user(&claims.sub)
        .await
        .map_err(|_| OauthError::server_error())?
        .ok_or_else(|| OauthError::invalid_client("unknown subject"))?;

    Ok(Json(json!({
        "sub": user.id,
        "email": user.email,
        "email_verified": user.email_verified,
        "name": user.name,
        "picture": user.picture,
        "updated_at": user.updated_at.timestamp(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urlencode_preserves_state_safely() {
        assert_eq!(urlencode("abc123"), "abc123");
        assert_eq!(urlencode("a b&c"), "a+b%26c");
    }
}

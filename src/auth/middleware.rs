//! Axum middleware that turns a bearer token into an `AuthContext` request
//! extension. Scope checks happen in the handlers against the route map.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::claims::AuthContext;
use super::{RoleCache, TokenValidator};
use crate::api::error::ApiError;
use crate::domain::GatewayError;

#[derive(Clone)]
pub struct AuthState {
    pub validator: Arc<TokenValidator>,
    pub roles: Arc<RoleCache>,
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = authenticate(&auth, &headers).await.map_err(ApiError::from)?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

async fn authenticate(
    auth: &AuthState,
    headers: &HeaderMap,
) -> crate::domain::Result<AuthContext> {
    let token = bearer_token(headers)
        .ok_or_else(|| GatewayError::unauthorized("missing bearer token"))?;

    let claims = auth.validator.validate(token).await?;

    // Tokens from this issuer carry tier and role; external tokens fall back
    // to the cached server-side lookup.
    let (tier, role) = match (claims.tier(), claims.role.clone()) {
        (Some(tier), Some(role)) => (tier, role),
        _ => auth.roles.lookup(&claims.sub).await?,
    };

    Ok(AuthContext {
        user_id: claims.sub.clone(),
        scopes: claims.scopes(),
        tier,
        role,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

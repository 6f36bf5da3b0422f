//! SQLite-backed stores for OAuth clients, authorization codes, and refresh
//! tokens. Secrets and refresh tokens are stored as sha256 hex only.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use super::pkce::sha256_hex;
use crate::domain::Result;

pub const AUTH_CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub is_public: bool,
    pub secret_hash: Option<String>,
}

impl OAuthClient {
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == uri)
    }

    pub fn verify_secret(&self, secret: &str) -> bool {
        match &self.secret_hash {
            Some(hash) => {
                constant_time_eq::constant_time_eq(sha256_hex(secret).as_bytes(), hash.as_bytes())
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthCodeSession {
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub user_id: String,
    pub client_id: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[async_trait]
pub trait OidcStore: Send + Sync {
    async fn get_client(&self, client_id: &str) -> Result<Option<OAuthClient>>;

    async fn create_session(&self, session: &AuthCodeSession) -> Result<()>;
    /// Fetch and consume: the code is single-use, marked used atomically.
    async fn consume_session(&self, code: &str) -> Result<Option<AuthCodeSession>>;

    async fn store_refresh_token(
        &self,
        token: &str,
        record: &RefreshTokenRecord,
    ) -> Result<()>;
    async fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>>;
    async fn revoke_refresh_token(&self, token: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteOidcStore {
    pool: SqlitePool,
}

impl SqliteOidcStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Dev/test helper; the client catalog is otherwise managed externally.
    pub async fn register_client(
        &self,
        client_id: &str,
        client_name: &str,
        redirect_uris: &[String],
        secret: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_clients (client_id, client_name, redirect_uris, is_public, secret_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(client_id)
        .bind(client_name)
        .bind(serde_json::to_string(redirect_uris)?)
        .bind(if secret.is_none() { 1 } else { 0 })
        .bind(secret.map(sha256_hex))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OidcStore for SqliteOidcStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<OAuthClient>> {
        let row = sqlx::query("SELECT * FROM oauth_clients WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let uris: String = row.try_get("redirect_uris")?;
            Ok(OAuthClient {
                client_id: row.try_get("client_id")?,
                client_name: row.try_get("client_name")?,
                redirect_uris: serde_json::from_str(&uris).unwrap_or_default(),
                is_public: row.try_get::<i64, _>("is_public")? != 0,
                secret_hash: row.try_get("secret_hash")?,
            })
        })
        .transpose()
    }

    async fn create_session(&self, session: &AuthCodeSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oidc_sessions (
                code, client_id, user_id, redirect_uri, scope,
                code_challenge, code_challenge_method, nonce, expires_at, used
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&session.code)
        .bind(&session.client_id)
        .bind(&session.user_id)
        .bind(&session.redirect_uri)
        .bind(&session.scope)
        .bind(&session.code_challenge)
        .bind(&session.code_challenge_method)
        .bind(&session.nonce)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_session(&self, code: &str) -> Result<Option<AuthCodeSession>> {
        let mut txn = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM oidc_sessions WHERE code = ?")
            .bind(code)
            .fetch_optional(&mut *txn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let session = AuthCodeSession {
            code: row.try_get("code")?,
            client_id: row.try_get("client_id")?,
            user_id: row.try_get("user_id")?,
            redirect_uri: row.try_get("redirect_uri")?,
            scope: row.try_get("scope")?,
            code_challenge: row.try_get("code_challenge")?,
            code_challenge_method: row.try_get("code_challenge_method")?,
            nonce: row.try_get("nonce")?,
            expires_at: row.try_get("expires_at")?,
            used: row.try_get::<i64, _>("used")? != 0,
        };

        sqlx::query("UPDATE oidc_sessions SET used = 1 WHERE code = ?")
            .bind(code)
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        Ok(Some(session))
    }

    async fn store_refresh_token(&self, token: &str, record: &RefreshTokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, user_id, client_id, scope, expires_at, revoked, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(sha256_hex(token))
        .bind(&record.user_id)
        .bind(&record.client_id)
        .bind(&record.scope)
        .bind(record.expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenRecord>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = ?")
            .bind(sha256_hex(token))
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(RefreshTokenRecord {
                user_id: row.try_get("user_id")?,
                client_id: row.try_get("client_id")?,
                scope: row.try_get("scope")?,
                expires_at: row.try_get("expires_at")?,
                revoked: row.try_get::<i64, _>("revoked")? != 0,
            })
        })
        .transpose()
    }

    async fn revoke_refresh_token(&self, token: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE token_hash = ?")
            .bind(sha256_hex(token))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Build a session for a freshly issued authorization code.
pub fn new_session(
    code: String,
    client_id: String,
    user_id: String,
    redirect_uri: String,
    scope: String,
    code_challenge: String,
    nonce: Option<String>,
) -> AuthCodeSession {
    AuthCodeSession {
        code,
        client_id,
        user_id,
        redirect_uri,
        scope,
        code_challenge,
        code_challenge_method: "S256".to_string(),
        nonce,
        expires_at: Utc::now() + Duration::minutes(AUTH_CODE_TTL_MINUTES),
        used: false,
    }
}

impl AuthCodeSession {
    pub fn is_valid(&self) -> bool {
        !self.used && self.expires_at > Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_redirect_allowlist() {
        let client = OAuthClient {
            client_id: "app".to_string(),
            client_name: "App".to_string(),
            redirect_uris: vec!["https://app.example.com/callback".to_string()],
            is_public: true,
            secret_hash: None,
        };
        assert!(client.allows_redirect("https://app.example.com/callback"));
        assert!(!client.allows_redirect("https://evil.example.com/callback"));
    }

    #[test]
    fn test_confidential_client_secret_verification() {
        let client = OAuthClient {
            client_id: "backend".to_string(),
            client_name: "Backend".to_string(),
            redirect_uris: vec![],
            is_public: false,
            secret_hash: Some(sha256_hex("s3cret")),
        };
        assert!(client.verify_secret("s3cret"));
        assert!(!client.verify_secret("guess"));

        let public = OAuthClient {
            secret_hash: None,
            ..client
        };
        assert!(!public.verify_secret("anything"));
    }

    #[test]
    fn test_session_validity() {
        let mut session = new_session(
            "code".to_string(),
            "app".to_string(),
            "user-1".to_string(),
            "https://app/cb".to_string(),
            "openid".to_string(),
            "challenge".to_string(),
            None,
        );
        assert!(session.is_valid());

        session.used = true;
        assert!(!session.is_valid());

        session.used = false;
        session.expires_at = Utc::now() - Duration::minutes(1);
        assert!(!session.is_valid());
    }
}

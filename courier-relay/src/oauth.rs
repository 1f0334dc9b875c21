//! OAuth2 access tokens for the FCM HTTP v1 API.
//!
//! ```text
//! service-account JSON ──► RS256 assertion ──► token_uri ──► access token
//!                                                            (cached until
//!                                                             near expiry)
//! ```
//!
//! Google access tokens live about an hour. [`ServiceAccountTokens`] keeps
//! the current one and mints a new one shortly before it runs out.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Scope required to send FCM messages.
pub const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Google rejects assertions valid for longer than an hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Token acquisition errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// Credentials file unreadable or malformed
    Credentials(String),
    /// Assertion could not be signed
    Signing(String),
    /// HTTP client or network failure
    Transport(String),
    /// Token endpoint answered with a non-success status
    Rejected { status: u16, body: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Credentials(e) => write!(f, "Invalid credentials: {e}"),
            AuthError::Signing(e) => write!(f, "Assertion signing failed: {e}"),
            AuthError::Transport(e) => write!(f, "Token request failed: {e}"),
            AuthError::Rejected { status, body } => {
                write!(f, "Token endpoint rejected request with status {status}: {body}")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Supplies bearer tokens to [`FcmNotifier`](crate::push::FcmNotifier).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Forget any cached token. Called after the push service answers 401.
    async fn invalidate(&self) {}
}

// ─── Service account ──────────────────────────────────────────────────

/// The fields of a Google service-account key file that token minting needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: Option<String>,
    pub private_key_id: Option<String>,
    /// PEM-encoded RSA key
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        serde_json::from_str(json).map_err(|e| AuthError::Credentials(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Credentials(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_LIFETIME_SECS as u64
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Mints access tokens with the JWT-bearer grant and caches them.
///
/// Concurrent callers share one in-flight refresh.
pub struct ServiceAccountTokens {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    http: reqwest::Client,
    refresh_margin: Duration,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokens {
    pub fn new(key: ServiceAccountKey, timeout: Duration) -> Result<Self, AuthError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AuthError::Credentials(format!("private_key: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        Ok(Self {
            key,
            signing_key,
            http,
            refresh_margin: Duration::from_secs(60),
            cached: Mutex::new(None),
        })
    }

    /// Refresh this long before the reported expiry (default: 60s).
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn assertion(&self) -> Result<String, AuthError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: FCM_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    async fn fetch(&self) -> Result<TokenResponse, AuthError> {
        let assertion = self.assertion()?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Transport(format!("malformed token response: {e}")))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(self.refresh_margin);
        log::debug!(
            "Fetched access token for {} (expires in {}s)",
            self.key.client_email,
            fresh.expires_in
        );

        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const PRIVATE_KEY: &str = include_str!("../tests/fixtures/service_account_key.pem");
    const PUBLIC_KEY: &str = include_str!("../tests/fixtures/service_account_key.pub.pem");

    #[derive(Debug, Deserialize)]
    struct Claims {
        iss: String,
        scope: String,
        aud: String,
        iat: i64,
        exp: i64,
    }

    fn key_json(token_uri: &str) -> String {
        json!({
            "type": "service_account",
            "project_id": "courier-test",
            "private_key_id": "key-1",
            "private_key": PRIVATE_KEY,
            "client_email": "relay@courier-test.iam.gserviceaccount.com",
            "client_id": "1234567890",
            "token_uri": token_uri
        })
        .to_string()
    }

    /// Read one HTTP request, headers and body.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Token endpoint answering request N with `token-N`. Returns its URI
    /// and the request bodies it has seen.
    async fn token_endpoint(
        status_line: &'static str,
        expires_in: u64,
    ) -> (String, Arc<std::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}/token", listener.local_addr().unwrap());
        let bodies = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = bodies.clone();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let body = request
                    .split_once("\r\n\r\n")
                    .map(|(_, body)| body.to_string())
                    .unwrap_or_default();
                let count = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(body);
                    seen.len()
                };
                let payload = json!({
                    "access_token": format!("token-{count}"),
                    "expires_in": expires_in,
                    "token_type": "Bearer"
                })
                .to_string();
                let response = format!(
                    "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        (uri, bodies)
    }

    fn tokens_for(uri: &str) -> ServiceAccountTokens {
        let key = ServiceAccountKey::from_json(&key_json(uri)).unwrap();
        ServiceAccountTokens::new(key, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_key_parsing() {
        let key = ServiceAccountKey::from_json(&key_json("https://example.test/token")).unwrap();
        assert_eq!(key.project_id.as_deref(), Some("courier-test"));
        assert_eq!(key.token_uri, "https://example.test/token");

        let mut minimal: serde_json::Value = serde_json::from_str(&key_json("unused")).unwrap();
        minimal.as_object_mut().unwrap().remove("token_uri");
        let key = ServiceAccountKey::from_json(&minimal.to_string()).unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);

        let debug = format!("{key:?}");
        assert!(!debug.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_malformed_credentials() {
        assert!(matches!(
            ServiceAccountKey::from_json("{\"client_email\": \"x\"}"),
            Err(AuthError::Credentials(_))
        ));

        let key = ServiceAccountKey::from_json(
            &json!({"private_key": "not a pem", "client_email": "x@y"}).to_string(),
        )
        .unwrap();
        assert!(matches!(
            ServiceAccountTokens::new(key, Duration::from_secs(1)),
            Err(AuthError::Credentials(_))
        ));

        let missing = ServiceAccountKey::from_file("/nonexistent/courier/key.json");
        assert!(matches!(missing, Err(AuthError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_token_cached_while_valid() {
        let (uri, bodies) = token_endpoint("HTTP/1.1 200 OK", 3600).await;
        let tokens = tokens_for(&uri);

        assert_eq!(tokens.access_token().await.unwrap(), "token-1");
        assert_eq!(tokens.access_token().await.unwrap(), "token-1");
        assert_eq!(bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_refreshed_after_expiry() {
        // 61s lifetime minus a 60s margin: due for refresh after one second
        let (uri, bodies) = token_endpoint("HTTP/1.1 200 OK", 61).await;
        let tokens = tokens_for(&uri).with_refresh_margin(Duration::from_secs(60));

        assert_eq!(tokens.access_token().await.unwrap(), "token-1");
        assert_eq!(tokens.access_token().await.unwrap(), "token-1");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(tokens.access_token().await.unwrap(), "token-2");
        assert_eq!(bodies.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (uri, _) = token_endpoint("HTTP/1.1 200 OK", 3600).await;
        let tokens = tokens_for(&uri);

        assert_eq!(tokens.access_token().await.unwrap(), "token-1");
        tokens.invalidate().await;
        assert_eq!(tokens.access_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_assertion_is_signed_jwt_bearer_grant() {
        let (uri, bodies) = token_endpoint("HTTP/1.1 200 OK", 3600).await;
        let tokens = tokens_for(&uri);
        tokens.access_token().await.unwrap();

        let body = bodies.lock().unwrap()[0].clone();
        let form: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();
        assert_eq!(form["grant_type"], JWT_BEARER_GRANT);

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[uri.as_str()]);
        let decoded = jsonwebtoken::decode::<Claims>(
            &form["assertion"],
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.header.kid.as_deref(), Some("key-1"));
        assert_eq!(decoded.claims.iss, "relay@courier-test.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.scope, FCM_SCOPE);
        assert_eq!(decoded.claims.aud, uri);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[tokio::test]
    async fn test_rejected_grant_not_cached() {
        let (uri, bodies) = token_endpoint("HTTP/1.1 400 Bad Request", 3600).await;
        let tokens = tokens_for(&uri);

        let err = tokens.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 400, .. }));
        assert!(tokens.access_token().await.is_err());
        assert_eq!(bodies.lock().unwrap().len(), 2);
    }
}

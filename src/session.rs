//! Session manager: token lifecycle, durable persistence and restore.
//!
//! Owns the authentication state exclusively; every other component treats
//! tokens as read-only, reading the mirrored token keys from the
//! reload-surviving store (the live transports cannot depend on this module).

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::response_error;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::models::{
    AuthState, AuthTokens, LoginCredentials, LoginOutcome, LoginResponse, ProfileUpdate, User,
};
use crate::storage::KeyValueStore;

/// Key holding the serialized [`AuthState`] blob.
pub const AUTH_STORAGE_KEY: &str = "auth";
/// Mirror keys holding the bare token strings for components that read
/// tokens directly (fetch helpers, live transports).
pub const ACCESS_TOKEN_KEY: &str = "auth_access_token";
pub const REFRESH_TOKEN_KEY: &str = "auth_refresh_token";

#[derive(Deserialize)]
struct Claims {
    exp: i64,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Decode the embedded expiry of a signed access token without any network
/// round-trip. Returns `None` for anything that is not a well-formed JWT.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Some(claims.exp)
}

/// A token is valid strictly before its embedded expiry; at the exact expiry
/// instant it is already invalid.
pub fn is_token_valid(token: &str) -> bool {
    match token_expiry(token) {
        Some(exp) => unix_now() < exp,
        None => false,
    }
}

pub struct SessionManager {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    state: RwLock<AuthState>,
    /// Reload-surviving store; also carries the mirror token keys.
    durable: Arc<dyn KeyValueStore>,
    /// Session-only store, used for the blob when "remember me" is off.
    session_only: Arc<dyn KeyValueStore>,
}

impl SessionManager {
    /// Build the manager and run the startup restore protocol: adopt a
    /// persisted session whose access token is still in the future, purge
    /// everything otherwise. This is the only place token validity is decided
    /// by decoding rather than by asking the server.
    pub fn new(
        config: Arc<ClientConfig>,
        durable: Arc<dyn KeyValueStore>,
        session_only: Arc<dyn KeyValueStore>,
    ) -> Self {
        let manager = Self {
            http: reqwest::Client::new(),
            config,
            state: RwLock::new(AuthState::default()),
            durable,
            session_only,
        };
        manager.restore();
        manager
    }

    fn restore(&self) {
        let stored = self
            .durable
            .get(AUTH_STORAGE_KEY)
            .or_else(|| self.session_only.get(AUTH_STORAGE_KEY));
        let Some(blob) = stored else { return };

        match serde_json::from_str::<AuthState>(&blob) {
            Ok(AuthState {
                user: Some(user),
                tokens: Some(tokens),
                ..
            }) if is_token_valid(&tokens.access_token) => {
                self.mirror_tokens(&tokens);
                *self.state.write().expect("state lock poisoned") = AuthState {
                    user: Some(user.normalized()),
                    tokens: Some(tokens),
                    is_authenticated: true,
                    is_loading: false,
                    error: None,
                };
                info!("restored persisted session");
            }
            _ => {
                debug!("persisted session missing or expired; purging");
                self.purge_storage();
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Authenticate against the aggregator. Network and server errors come
    /// back as [`LoginOutcome::Failed`]; a second-factor challenge is its own
    /// outcome and leaves the session unauthenticated.
    pub async fn login(&self, credentials: &LoginCredentials) -> LoginOutcome {
        if credentials.username.trim().is_empty() || credentials.password.is_empty() {
            return LoginOutcome::Failed {
                message: "username and password are required".to_string(),
            };
        }

        {
            let mut state = self.state.write().expect("state lock poisoned");
            state.is_loading = true;
            state.error = None;
        }

        match self.try_login(credentials).await {
            Ok(outcome) => {
                if let LoginOutcome::Failed { message } = &outcome {
                    self.fail_login(message.clone());
                }
                outcome
            }
            Err(e) => {
                let message = e.to_string();
                self.fail_login(message.clone());
                LoginOutcome::Failed { message }
            }
        }
    }

    async fn try_login(&self, credentials: &LoginCredentials) -> Result<LoginOutcome> {
        let url = self.config.endpoint("auth/login")?;
        let resp = self
            .http
            .post(url)
            .timeout(self.config.action_timeout)
            .json(credentials)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = response_error(resp).await;
            return Ok(LoginOutcome::Failed {
                message: err.to_string(),
            });
        }

        let body: LoginResponse = resp.json().await?;

        if body.requires_totp {
            self.state.write().expect("state lock poisoned").is_loading = false;
            return Ok(LoginOutcome::SecondFactorRequired {
                temp_token: body.temp_token,
            });
        }

        let (Some(user), Some(tokens)) = (body.user, body.tokens) else {
            return Ok(LoginOutcome::Failed {
                message: "malformed login response".to_string(),
            });
        };

        let new_state = AuthState {
            user: Some(user.normalized()),
            tokens: Some(tokens.clone()),
            is_authenticated: true,
            is_loading: false,
            error: None,
        };
        *self.state.write().expect("state lock poisoned") = new_state.clone();
        self.mirror_tokens(&tokens);
        self.persist_blob(&new_state, credentials.remember_me);
        info!(username = %credentials.username, "login succeeded");
        Ok(LoginOutcome::Success)
    }

    fn fail_login(&self, message: String) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.is_loading = false;
        state.error = Some(message);
    }

    /// Notify the server best-effort, then unconditionally clear the session
    /// and every persisted token. Logout never fails client-side.
    pub async fn logout(&self) {
        let token = self.get_access_token();
        if let (Some(token), Ok(url)) = (token, self.config.endpoint("auth/logout")) {
            if let Err(e) = self
                .http
                .post(url)
                .bearer_auth(&token)
                .timeout(self.config.action_timeout)
                .send()
                .await
            {
                debug!(error = %e, "logout notification failed; ignoring");
            }
        }
        self.clear();
        info!("logged out");
    }

    /// Exchange the refresh token for a new pair. Fail-closed: any failure
    /// clears the session entirely and returns `false`.
    ///
    /// Safe to call while authenticated; callers are expected to invoke this
    /// proactively while [`Self::needs_refresh`] reports true (a 60 s margin
    /// is a reasonable default).
    pub async fn refresh_token(&self) -> bool {
        let refresh = {
            let state = self.state.read().expect("state lock poisoned");
            state.tokens.as_ref().map(|t| t.refresh_token.clone())
        };
        let Some(refresh) = refresh else { return false };

        match self.try_refresh(&refresh).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "token refresh failed; clearing session");
                self.clear();
                false
            }
        }
    }

    async fn try_refresh(&self, refresh: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct RefreshResponse {
            tokens: AuthTokens,
        }

        let url = self.config.endpoint("auth/refresh")?;
        let resp = self
            .http
            .post(url)
            .timeout(self.config.action_timeout)
            .json(&serde_json::json!({ "refreshToken": refresh }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(response_error(resp).await);
        }

        let body: RefreshResponse = resp.json().await?;
        let snapshot = {
            let mut state = self.state.write().expect("state lock poisoned");
            state.tokens = Some(body.tokens.clone());
            state.is_authenticated = true;
            state.clone()
        };
        self.mirror_tokens(&body.tokens);
        self.repersist(&snapshot);
        Ok(())
    }

    /// Whether less than `margin` remains before the access token expires.
    /// Also true for a held token whose expiry cannot be decoded.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        let state = self.state.read().expect("state lock poisoned");
        let Some(tokens) = state.tokens.as_ref() else {
            return false;
        };
        match token_expiry(&tokens.access_token) {
            Some(exp) => exp - unix_now() < margin.as_secs() as i64,
            None => true,
        }
    }

    /// Authenticated partial profile mutation. Fails immediately, without a
    /// network call, when no token pair is held. Never retried.
    pub async fn update_profile(&self, updates: &ProfileUpdate) -> bool {
        #[derive(Deserialize)]
        struct ProfileResponse {
            user: User,
        }

        let Some(token) = self.get_access_token() else {
            return false;
        };
        let Ok(url) = self.config.endpoint("auth/profile") else {
            return false;
        };

        let resp = self
            .http
            .patch(url)
            .bearer_auth(&token)
            .timeout(self.config.action_timeout)
            .json(updates)
            .send()
            .await;
        let Ok(resp) = resp else { return false };
        if !resp.status().is_success() {
            return false;
        }
        let Ok(body) = resp.json::<ProfileResponse>().await else {
            return false;
        };

        let snapshot = {
            let mut state = self.state.write().expect("state lock poisoned");
            state.user = Some(body.user.normalized());
            state.clone()
        };
        self.repersist(&snapshot);
        true
    }

    /// Authenticated password change; `true` only on a 2xx response.
    pub async fn change_password(&self, current: &str, new: &str) -> bool {
        let Some(token) = self.get_access_token() else {
            return false;
        };
        let Ok(url) = self.config.endpoint("auth/password") else {
            return false;
        };

        match self
            .http
            .post(url)
            .bearer_auth(&token)
            .timeout(self.config.action_timeout)
            .json(&serde_json::json!({
                "currentPassword": current,
                "newPassword": new,
            }))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "password change failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Pure reads
    // ------------------------------------------------------------------

    pub fn has_role(&self, role: &str) -> bool {
        let state = self.state.read().expect("state lock poisoned");
        state.user.as_ref().is_some_and(|u| u.has_role(role))
    }

    pub fn get_access_token(&self) -> Option<String> {
        let state = self.state.read().expect("state lock poisoned");
        state.tokens.as_ref().map(|t| t.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().expect("state lock poisoned").is_authenticated
    }

    /// Snapshot of the full session state for UI consumption.
    pub fn state(&self) -> AuthState {
        self.state.read().expect("state lock poisoned").clone()
    }

    pub fn clear_error(&self) {
        self.state.write().expect("state lock poisoned").error = None;
    }

    // ------------------------------------------------------------------
    // Persistence plumbing
    // ------------------------------------------------------------------

    fn mirror_tokens(&self, tokens: &AuthTokens) {
        self.durable.set(ACCESS_TOKEN_KEY, &tokens.access_token);
        self.durable.set(REFRESH_TOKEN_KEY, &tokens.refresh_token);
    }

    fn persist_blob(&self, state: &AuthState, remember: bool) {
        let Ok(blob) = serde_json::to_string(state) else {
            return;
        };
        if remember {
            self.durable.set(AUTH_STORAGE_KEY, &blob);
            self.session_only.remove(AUTH_STORAGE_KEY);
        } else {
            self.session_only.set(AUTH_STORAGE_KEY, &blob);
            self.durable.remove(AUTH_STORAGE_KEY);
        }
    }

    /// Re-serialize into whichever store currently holds the blob.
    fn repersist(&self, state: &AuthState) {
        let Ok(blob) = serde_json::to_string(state) else {
            return;
        };
        if self.durable.get(AUTH_STORAGE_KEY).is_some() {
            self.durable.set(AUTH_STORAGE_KEY, &blob);
        } else if self.session_only.get(AUTH_STORAGE_KEY).is_some() {
            self.session_only.set(AUTH_STORAGE_KEY, &blob);
        }
    }

    fn purge_storage(&self) {
        self.durable.remove(AUTH_STORAGE_KEY);
        self.durable.remove(ACCESS_TOKEN_KEY);
        self.durable.remove(REFRESH_TOKEN_KEY);
        self.session_only.remove(AUTH_STORAGE_KEY);
    }

    fn clear(&self) {
        *self.state.write().expect("state lock poisoned") = AuthState::default();
        self.purge_storage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use url::Url;

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    fn test_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new(
            Url::parse("http://localhost:3001/api/").unwrap(),
        ))
    }

    fn stored_state(exp: i64) -> String {
        let tokens = AuthTokens {
            access_token: make_jwt(exp),
            refresh_token: "refresh-1".to_string(),
            expires_in: 3600,
            token_type: "Bearer".to_string(),
        };
        let user: User = serde_json::from_str(
            r#"{"id":"u1","username":"ops","role":"admin"}"#,
        )
        .unwrap();
        serde_json::to_string(&AuthState {
            user: Some(user),
            tokens: Some(tokens),
            is_authenticated: true,
            is_loading: false,
            error: None,
        })
        .unwrap()
    }

    #[test]
    fn token_validity_boundary() {
        let now = unix_now();
        assert!(is_token_valid(&make_jwt(now + 60)));
        // exact expiry is already invalid
        assert!(!is_token_valid(&make_jwt(now)));
        assert!(!is_token_valid(&make_jwt(now - 1)));
        assert!(!is_token_valid("not-a-jwt"));
        assert!(!is_token_valid("a.!!!.c"));
    }

    #[test]
    fn restore_adopts_valid_session_and_mirrors_tokens() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session_only: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        durable.set(AUTH_STORAGE_KEY, &stored_state(unix_now() + 3600));

        let manager = SessionManager::new(test_config(), durable.clone(), session_only);
        assert!(manager.is_authenticated());
        assert!(manager.has_role("admin"));
        assert!(durable.get(ACCESS_TOKEN_KEY).is_some());
        assert!(durable.get(REFRESH_TOKEN_KEY).is_some());
    }

    #[test]
    fn restore_purges_expired_session() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session_only: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        durable.set(AUTH_STORAGE_KEY, &stored_state(unix_now() - 10));
        durable.set(ACCESS_TOKEN_KEY, "stale");

        let manager = SessionManager::new(test_config(), durable.clone(), session_only);
        assert!(!manager.is_authenticated());
        assert!(manager.state().user.is_none());
        assert_eq!(durable.get(AUTH_STORAGE_KEY), None);
        assert_eq!(durable.get(ACCESS_TOKEN_KEY), None);
    }

    #[test]
    fn restore_falls_back_to_session_store() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session_only: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        session_only.set(AUTH_STORAGE_KEY, &stored_state(unix_now() + 3600));

        let manager = SessionManager::new(test_config(), durable, session_only);
        assert!(manager.is_authenticated());
    }

    #[test]
    fn restore_rejects_blob_without_user() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session_only: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tokens = AuthTokens {
            access_token: make_jwt(unix_now() + 3600),
            refresh_token: "r".to_string(),
            expires_in: 3600,
            token_type: "Bearer".to_string(),
        };
        let blob = serde_json::to_string(&AuthState {
            user: None,
            tokens: Some(tokens),
            is_authenticated: true,
            is_loading: false,
            error: None,
        })
        .unwrap();
        durable.set(AUTH_STORAGE_KEY, &blob);

        let manager = SessionManager::new(test_config(), durable.clone(), session_only);
        assert!(!manager.is_authenticated());
        assert_eq!(durable.get(AUTH_STORAGE_KEY), None);
    }

    #[tokio::test]
    async fn login_rejects_empty_credentials_without_network() {
        let manager = SessionManager::new(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );
        let outcome = manager
            .login(&LoginCredentials::new("", "secret"))
            .await;
        assert!(matches!(outcome, LoginOutcome::Failed { .. }));
        assert!(!manager.is_authenticated());
    }

    #[test]
    fn needs_refresh_margins() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let session_only: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        durable.set(AUTH_STORAGE_KEY, &stored_state(unix_now() + 30));
        let manager = SessionManager::new(test_config(), durable, session_only);

        assert!(manager.needs_refresh(Duration::from_secs(60)));
        assert!(!manager.needs_refresh(Duration::from_secs(5)));

        let unauthenticated = SessionManager::new(
            test_config(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );
        assert!(!unauthenticated.needs_refresh(Duration::from_secs(60)));
    }
}

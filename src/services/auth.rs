//! Bearer token lifecycle against the backend
//!
//! States: Unauthenticated -> Authenticated -> (Refreshing) -> Authenticated,
//! with LockedOut as a terminal state when the backend rejects the device
//! credentials. The whole state sits behind one async mutex that is held
//! across the login/refresh exchange, so concurrent callers wait for the
//! in-flight exchange instead of starting their own (a backend that rotates
//! refresh tokens on first use would otherwise invalidate the losers).

use crate::infra::config::Config;
use crate::io::backend::{Backend, BackendError, Credentials, TokenGrant};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Errors surfaced to token consumers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    /// Credentials were rejected; not retried automatically
    #[error("backend rejected device credentials; delivery halted until reconfigured")]
    LockedOut,
    /// Login or refresh could not complete; retry later
    #[error("auth exchange failed: {0}")]
    Unavailable(BackendError),
}

impl AuthError {
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthError::LockedOut)
    }
}

/// Credential pair held while authenticated
pub struct AuthToken {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
}

impl AuthToken {
    fn from_grant(grant: TokenGrant, now: Instant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: now + Duration::from_secs(grant.expires_in),
        }
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    #[inline]
    fn expires_within(&self, margin: Duration, now: Instant) -> bool {
        now + margin >= self.expires_at
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken").field("expires_at", &self.expires_at).finish_non_exhaustive()
    }
}

enum AuthState {
    Unauthenticated,
    Authenticated(AuthToken),
    LockedOut,
}

/// Observable session state, readable without waiting on an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticated,
    Refreshing,
    LockedOut,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Unauthenticated => "unauthenticated",
            AuthStatus::Authenticated => "authenticated",
            AuthStatus::Refreshing => "refreshing",
            AuthStatus::LockedOut => "locked_out",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => AuthStatus::Authenticated,
            2 => AuthStatus::Refreshing,
            3 => AuthStatus::LockedOut,
            _ => AuthStatus::Unauthenticated,
        }
    }
}

/// Single owner of the device's bearer credential
pub struct AuthSession {
    backend: Arc<dyn Backend>,
    credentials: Credentials,
    refresh_margin: Duration,
    state: Mutex<AuthState>,
    status: AtomicU8,
    exchanges: AtomicU64,
}

impl AuthSession {
    pub fn new(config: &Config, backend: Arc<dyn Backend>) -> Self {
        let credentials = Credentials {
            username: config.backend_username().to_string(),
            password: config.backend_password().to_string(),
        };
        Self::with_credentials(backend, credentials, config.token_refresh_margin())
    }

    pub fn with_credentials(
        backend: Arc<dyn Backend>,
        credentials: Credentials,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            backend,
            credentials,
            refresh_margin,
            state: Mutex::new(AuthState::Unauthenticated),
            status: AtomicU8::new(0),
            exchanges: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> AuthStatus {
        AuthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Login and refresh calls issued so far
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: AuthStatus) {
        let v = match status {
            AuthStatus::Unauthenticated => 0,
            AuthStatus::Authenticated => 1,
            AuthStatus::Refreshing => 2,
            AuthStatus::LockedOut => 3,
        };
        self.status.store(v, Ordering::Release);
    }

    /// Return a usable access token, logging in or refreshing first if needed
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match &*state {
            AuthState::LockedOut => return Err(AuthError::LockedOut),
            AuthState::Authenticated(token) if !token.expires_within(self.refresh_margin, now) => {
                return Ok(token.access_token.clone());
            }
            AuthState::Authenticated(token) => {
                let refresh_token = token.refresh_token.clone();
                let fallback = (!token.is_expired(now)).then(|| token.access_token.clone());

                self.set_status(AuthStatus::Refreshing);
                self.exchanges.fetch_add(1, Ordering::Relaxed);
                match self.backend.refresh(&refresh_token).await {
                    Ok(grant) => {
                        let token = AuthToken::from_grant(grant, Instant::now());
                        let access = token.access_token.clone();
                        debug!(expires_in_s = %token.expires_at.saturating_duration_since(Instant::now()).as_secs(), "auth_token_refreshed");
                        *state = AuthState::Authenticated(token);
                        self.set_status(AuthStatus::Authenticated);
                        return Ok(access);
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, token_still_valid = %fallback.is_some(), "auth_refresh_failed");
                        if let Some(access) = fallback {
                            self.set_status(AuthStatus::Authenticated);
                            return Ok(access);
                        }
                        // Expired token: one login attempt before giving up this call
                        *state = AuthState::Unauthenticated;
                        self.set_status(AuthStatus::Unauthenticated);
                    }
                    Err(e) => {
                        // Revoked or unusable refresh token, whatever the status code
                        warn!(error = %e, "auth_refresh_rejected");
                        *state = AuthState::Unauthenticated;
                        self.set_status(AuthStatus::Unauthenticated);
                    }
                }
            }
            AuthState::Unauthenticated => {}
        }

        self.login_locked(&mut state).await
    }

    /// Drop the current token if it is the one the backend just rejected
    pub async fn invalidate(&self, rejected_access_token: &str) {
        let mut state = self.state.lock().await;
        if let AuthState::Authenticated(token) = &*state {
            if token.access_token == rejected_access_token {
                info!("auth_token_invalidated");
                *state = AuthState::Unauthenticated;
                self.set_status(AuthStatus::Unauthenticated);
            }
        }
    }

    async fn login_locked(&self, state: &mut AuthState) -> Result<String, AuthError> {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        match self.backend.login(&self.credentials).await {
            Ok(grant) => {
                let token = AuthToken::from_grant(grant, Instant::now());
                let access = token.access_token.clone();
                info!(username = %self.credentials.username, "auth_login_succeeded");
                *state = AuthState::Authenticated(token);
                self.set_status(AuthStatus::Authenticated);
                Ok(access)
            }
            Err(e) if e.is_auth() => {
                log_locked_out(&self.credentials.username, &e);
                *state = AuthState::LockedOut;
                self.set_status(AuthStatus::LockedOut);
                Err(AuthError::LockedOut)
            }
            Err(e) => {
                warn!(error = %e, "auth_login_failed");
                Err(AuthError::Unavailable(e))
            }
        }
    }
}

/// Operator-facing fatal auth error (cold path)
#[cold]
fn log_locked_out(username: &str, e: &BackendError) {
    error!(
        username = %username,
        error = %e,
        "auth_locked_out: backend rejected device credentials, fix [backend] username/password and restart"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::PotholeEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Backend that only implements the auth endpoints
    struct AuthBackend {
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        login_result: parking_lot::Mutex<Result<u64, BackendError>>,
        refresh_result: parking_lot::Mutex<Result<u64, BackendError>>,
        delay: Duration,
    }

    impl AuthBackend {
        fn new(expires_in: u64) -> Self {
            Self {
                logins: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                login_result: parking_lot::Mutex::new(Ok(expires_in)),
                refresh_result: parking_lot::Mutex::new(Ok(3600)),
                delay: Duration::from_millis(20),
            }
        }

        fn grant(&self, prefix: &str, n: usize, expires_in: u64) -> TokenGrant {
            TokenGrant {
                access_token: format!("{prefix}-access-{n}"),
                refresh_token: format!("{prefix}-refresh-{n}"),
                expires_in,
            }
        }
    }

    #[async_trait]
    impl Backend for AuthBackend {
        async fn login(&self, _credentials: &Credentials) -> Result<TokenGrant, BackendError> {
            tokio::time::sleep(self.delay).await;
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            let result = self.login_result.lock().clone();
            result.map(|expires_in| self.grant("login", n, expires_in))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, BackendError> {
            tokio::time::sleep(self.delay).await;
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            let result = self.refresh_result.lock().clone();
            result.map(|expires_in| self.grant("refresh", n, expires_in))
        }

        async fn upload_event(&self, _: &str, _: &PotholeEvent) -> Result<(), BackendError> {
            Ok(())
        }

        async fn upload_image(&self, _: &str, _: Uuid, _: Bytes) -> Result<(), BackendError> {
            Ok(())
        }

        async fn health(&self, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn session(backend: Arc<AuthBackend>) -> AuthSession {
        let credentials = Credentials { username: "dev".to_string(), password: "pw".to_string() };
        AuthSession::with_credentials(backend, credentials, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_login_then_reuse_token() {
        let backend = Arc::new(AuthBackend::new(3600));
        let auth = session(backend.clone());

        assert_eq!(auth.status(), AuthStatus::Unauthenticated);
        assert_eq!(auth.access_token().await.unwrap(), "login-access-1");
        assert_eq!(auth.access_token().await.unwrap(), "login-access-1");

        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
        assert_eq!(auth.status(), AuthStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let backend = Arc::new(AuthBackend::new(3600));
        let auth = Arc::new(session(backend.clone()));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.access_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "login-access-1");
        }

        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
        assert_eq!(auth.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        // Token lifetime below the refresh margin forces a refresh on next use
        let backend = Arc::new(AuthBackend::new(30));
        let auth = Arc::new(session(backend.clone()));
        auth.access_token().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.access_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "refresh-access-1");
        }

        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_login() {
        let backend = Arc::new(AuthBackend::new(30));
        *backend.refresh_result.lock() = Err(BackendError::Unauthorized(401));
        let auth = session(backend.clone());

        assert_eq!(auth.access_token().await.unwrap(), "login-access-1");
        assert_eq!(auth.access_token().await.unwrap(), "login-access-2");

        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_network_error_keeps_unexpired_token() {
        let backend = Arc::new(AuthBackend::new(30));
        *backend.refresh_result.lock() = Err(BackendError::Timeout);
        let auth = session(backend.clone());

        auth.access_token().await.unwrap();
        assert_eq!(auth.access_token().await.unwrap(), "login-access-1");
        assert_eq!(auth.status(), AuthStatus::Authenticated);
        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_error_with_any_status_falls_back_to_login() {
        let backend = Arc::new(AuthBackend::new(0));
        let auth = session(backend.clone());
        auth.access_token().await.unwrap();

        let failures = [
            BackendError::Rejected { status: 400, body: "invalid_grant".to_string() },
            BackendError::Server(500),
            BackendError::Decode("missing access_token".to_string()),
        ];
        for (i, failure) in failures.into_iter().enumerate() {
            *backend.refresh_result.lock() = Err(failure);
            let expected = format!("login-access-{}", i + 2);
            assert_eq!(auth.access_token().await.unwrap(), expected);
            assert_eq!(auth.status(), AuthStatus::Authenticated);
        }

        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 3);
        assert_eq!(backend.logins.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_refresh_network_error_on_expired_token_tries_login() {
        let backend = Arc::new(AuthBackend::new(0));
        *backend.refresh_result.lock() = Err(BackendError::Network("down".to_string()));
        let auth = session(backend.clone());

        auth.access_token().await.unwrap();
        assert_eq!(auth.access_token().await.unwrap(), "login-access-2");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_login_network_errors_are_unavailable() {
        let backend = Arc::new(AuthBackend::new(0));
        *backend.refresh_result.lock() = Err(BackendError::Network("down".to_string()));
        let auth = session(backend.clone());
        auth.access_token().await.unwrap();

        *backend.login_result.lock() = Err(BackendError::Network("down".to_string()));
        let err = auth.access_token().await.unwrap_err();
        assert_eq!(err, AuthError::Unavailable(BackendError::Network("down".to_string())));
        assert!(!err.is_fatal());
        assert_eq!(auth.status(), AuthStatus::Unauthenticated);

        // Recovers through login once the backend is reachable again
        *backend.login_result.lock() = Ok(3600);
        assert_eq!(auth.access_token().await.unwrap(), "login-access-3");
    }

    #[tokio::test]
    async fn test_bad_credentials_lock_out() {
        let backend = Arc::new(AuthBackend::new(3600));
        *backend.login_result.lock() = Err(BackendError::Unauthorized(401));
        let auth = session(backend.clone());

        assert_eq!(auth.access_token().await.unwrap_err(), AuthError::LockedOut);
        assert_eq!(auth.status(), AuthStatus::LockedOut);

        // Never retried automatically
        assert_eq!(auth.access_token().await.unwrap_err(), AuthError::LockedOut);
        assert_eq!(backend.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_login_network_error_is_retryable() {
        let backend = Arc::new(AuthBackend::new(3600));
        *backend.login_result.lock() = Err(BackendError::Timeout);
        let auth = session(backend.clone());

        assert_eq!(auth.access_token().await.unwrap_err(), AuthError::Unavailable(BackendError::Timeout));
        assert_eq!(auth.status(), AuthStatus::Unauthenticated);

        *backend.login_result.lock() = Ok(3600);
        assert_eq!(auth.access_token().await.unwrap(), "login-access-2");
    }

    #[tokio::test]
    async fn test_invalidate_only_drops_matching_token() {
        let backend = Arc::new(AuthBackend::new(3600));
        let auth = session(backend.clone());

        let token = auth.access_token().await.unwrap();
        auth.invalidate("some-older-token").await;
        assert_eq!(auth.status(), AuthStatus::Authenticated);

        auth.invalidate(&token).await;
        assert_eq!(auth.status(), AuthStatus::Unauthenticated);
        assert_eq!(auth.access_token().await.unwrap(), "login-access-2");
    }
}

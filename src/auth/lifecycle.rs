//! Token lifecycle evaluation and proactive refresh
//!
//! A token moves `Absent -> Fresh -> ExpiringSoon -> Expired -> Absent`; the
//! last step happens when an expired credential is cleared, and the cycle
//! restarts on the next login. The state is never stored: it is recomputed
//! from the issuance time on every check.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::grant::TokenGrant;
use super::store::CredentialStore;
use crate::error::ApiError;

/// Derived state of the stored access token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No token is stored
    Absent,
    Fresh,
    /// Still valid, but inside the warning window before expiry
    ExpiringSoon,
    Expired,
}

impl LifecycleState {
    /// Whether a token in this state may still be sent
    pub fn is_usable(&self) -> bool {
        matches!(self, LifecycleState::Fresh | LifecycleState::ExpiringSoon)
    }
}

/// Expiry policy for access tokens
///
/// These are client-side policy constants; the server may expire tokens on
/// its own schedule, which the 401 handling covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Age at which a token is considered expired
    pub lifetime: Duration,
    /// How long before expiry a refresh is attempted
    pub warning_window: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            lifetime: Duration::days(7),
            warning_window: Duration::hours(1),
        }
    }
}

/// Computes the lifecycle state of a token issued at `issued_at`
///
/// `Absent` without a token; `Expired` once `now - issued_at >= lifetime`;
/// `ExpiringSoon` once `now - issued_at >= lifetime - warning_window`;
/// otherwise `Fresh`.
pub fn lifecycle_state(
    now: DateTime<Utc>,
    issued_at: Option<DateTime<Utc>>,
    policy: &TokenPolicy,
) -> LifecycleState {
    let Some(issued_at) = issued_at else {
        return LifecycleState::Absent;
    };

    let age = now.signed_duration_since(issued_at);
    if age >= policy.lifetime {
        LifecycleState::Expired
    } else if age >= policy.lifetime - policy.warning_window {
        LifecycleState::ExpiringSoon
    } else {
        LifecycleState::Fresh
    }
}

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;
}

/// Checks the credential before each dispatch
///
/// Refreshes are single-flight: concurrent dispatches that all see an
/// expiring token wait on one refresh instead of each issuing their own.
#[derive(Debug, Default)]
pub struct TokenMonitor {
    refresh_lock: Mutex<()>,
}

impl TokenMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token to attach to the next request
    ///
    /// # Returns
    /// * `Ok(None)` if no token is stored (public endpoints still work)
    /// * `Ok(Some(token))` for a fresh token, or an expiring one after at most
    ///   one refresh attempt (a failed refresh keeps the current token)
    /// * `Err` with code `AUTH_REQUIRED` if the token has expired; the
    ///   credential is cleared and no request should be sent
    pub async fn authorize(
        &self,
        store: &CredentialStore,
        refresher: &dyn TokenRefresher,
    ) -> Result<Option<String>, ApiError> {
        match store.evaluate_and_clean() {
            LifecycleState::Absent => return Ok(None),
            LifecycleState::Expired => {
                tracing::warn!("Access token expired; re-authentication required");
                return Err(ApiError::auth_required());
            }
            LifecycleState::ExpiringSoon => self.refresh(store, refresher).await,
            LifecycleState::Fresh => {}
        }

        Ok(store.get())
    }

    async fn refresh(&self, store: &CredentialStore, refresher: &dyn TokenRefresher) {
        let _guard = self.refresh_lock.lock().await;

        // Another dispatch may have refreshed while this one waited
        if store.state() != LifecycleState::ExpiringSoon {
            return;
        }

        let Some(refresh_token) = store.refresh_token() else {
            tracing::debug!("Access token expiring soon but no refresh token is stored");
            return;
        };

        match refresher.refresh(&refresh_token).await {
            Ok(grant) => {
                let refresh_token = grant.refresh_token.unwrap_or(refresh_token);
                match store.set(&grant.access_token, Some(&refresh_token)) {
                    Ok(()) => tracing::info!("Access token refreshed"),
                    Err(e) => tracing::warn!(error = %e, "Refreshed token could not be persisted"),
                }
            }
            Err(e) => {
                tracing::warn!(
                    code = %e.code(),
                    error = %e,
                    "Proactive token refresh failed; continuing with current token"
                );
            }
        }
    }
}

//! Session credentials and their lifecycle
//!
//! `store` owns the persisted access token, its issuance time and the optional
//! refresh token. `lifecycle` derives whether that token is fresh, about to
//! expire or dead, and drives proactive refresh before a dispatch.

mod grant;
pub mod lifecycle;
pub mod store;

pub use grant::{LoginRequest, TokenGrant};
pub use lifecycle::{lifecycle_state, LifecycleState, TokenMonitor, TokenPolicy, TokenRefresher};
pub use store::CredentialStore;

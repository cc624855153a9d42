//! Wire shapes for the login and refresh endpoints

use serde::{Deserialize, Serialize};

/// Credentials posted to the login endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Tokens returned by a successful login or refresh
///
/// The API has used several spellings over time, so all of them are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    #[serde(alias = "token", alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
}

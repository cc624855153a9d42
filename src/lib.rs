//! Pestdesk API client library
//!
//! A resilient client for the CRM REST API: it attaches the bearer token to
//! every request, refreshes the token before it expires, retries transient
//! failures, caches idempotent reads and reports every failure as one
//! normalized `ApiError`.

pub mod auth;
pub mod cache;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod storage;
pub mod transport;

pub use auth::{CredentialStore, LifecycleState, TokenPolicy};
pub use cache::ResponseCache;
pub use client::{ApiClient, ClientBuilder, RequestOptions};
pub use config::ClientConfig;
pub use error::{ApiError, ErrorCode, ErrorKind};
pub use reqwest::Method;

//! API client for the CRM backend
//!
//! Every call goes through one dispatch path:
//! 1. resolve the URL against the configured base
//! 2. check the token lifecycle (refresh if expiring, fail fast if expired)
//! 3. serve GETs from the response cache when possible
//! 4. send, retrying transient failures per the retry policy
//! 5. on 401, clear the credential and surface the error without retrying
//! 6. cache successful GETs; invalidate cached reads of a path after a write to it

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::{
    CredentialStore, LifecycleState, LoginRequest, TokenGrant, TokenMonitor, TokenRefresher,
};
use crate::cache::{cache_key, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClientConfig, ConfigError};
use crate::error::{normalize, ApiError, RawFailure};
use crate::retry::{FixedDelay, RetryDecision, RetryPolicy};
use crate::storage::{KeyValueStore, MemoryStore, StorageError};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Query parameters appended to the path
    pub query: Vec<(String, String)>,
    /// Overrides the configured per-attempt timeout
    pub timeout: Option<Duration>,
    /// Overrides the configured cache TTL for a GET; zero disables caching
    pub cache_ttl: Option<Duration>,
    /// Extra cache patterns to drop after a successful write
    pub invalidates: Vec<String>,
    /// Skip the lifecycle check and send no bearer token
    pub public: bool,
}

impl RequestOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Always go to the network and do not cache the result
    pub fn no_cache(self) -> Self {
        self.cache_ttl(Duration::ZERO)
    }

    pub fn invalidate(mut self, pattern: impl Into<String>) -> Self {
        self.invalidates.push(pattern.into());
        self
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

/// Builder for `ApiClient`
///
/// Anything not supplied falls back to the production default: `reqwest`
/// transport, in-memory storage, the system clock and `FixedDelay` retries.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where the credential is persisted
    pub fn storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<ApiClient, ConfigError> {
        let base_url = self.config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = ResponseCache::new(clock.clone());
        let credentials = CredentialStore::new(
            self.storage.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            clock,
            self.config.token_policy,
            cache.clone(),
        );

        Ok(ApiClient {
            inner: Arc::new(Inner {
                base_url,
                config: self.config,
                transport: self
                    .transport
                    .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
                retry_policy: self
                    .retry_policy
                    .unwrap_or_else(|| Arc::new(FixedDelay::default())),
                credentials,
                cache,
                monitor: TokenMonitor::new(),
            }),
        })
    }
}

/// Client for the CRM REST API
///
/// Cloning is cheap; clones share the credential, cache and transport.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    base_url: Url,
    transport: Arc<dyn Transport>,
    retry_policy: Arc<dyn RetryPolicy>,
    credentials: CredentialStore,
    cache: ResponseCache,
    monitor: TokenMonitor,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("credentials", &self.inner.credentials)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl ApiClient {
    /// Start building a client for `config`
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            storage: None,
            clock: None,
            retry_policy: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get_with(path, RequestOptions::default()).await
    }

    pub async fn get_with<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let data = self.request(Method::GET, path, None, options).await?;
        decode(data)
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_with(path, body, RequestOptions::default()).await
    }

    pub async fn post_with<B, T>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_body(Method::POST, path, body, options).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.put_with(path, body, RequestOptions::default()).await
    }

    pub async fn put_with<B, T>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_body(Method::PUT, path, body, options).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.patch_with(path, body, RequestOptions::default()).await
    }

    pub async fn patch_with<B, T>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send_body(Method::PATCH, path, body, options).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.delete_with(path, RequestOptions::default()).await
    }

    pub async fn delete_with<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let data = self.request(Method::DELETE, path, None, options).await?;
        decode(data)
    }

    async fn send_body<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| {
            ApiError::invalid_request(format!("Failed to encode request body: {}", e))
        })?;
        let data = self.request(method, path, Some(body), options).await?;
        decode(data)
    }

    /// Dispatches one logical operation, including any retries
    ///
    /// # Returns
    /// * `Ok(Value)` - the decoded JSON body (`Value::Null` for an empty body)
    /// * `Err(ApiError)` - the normalized error of the last attempt
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        let inner = &self.inner;
        let url = inner.resolve(path, &options.query)?;

        let token = if options.public {
            None
        } else {
            inner.monitor.authorize(&inner.credentials, &**inner).await?
        };
        let epoch = inner.credentials.epoch();

        let cacheable = method == Method::GET;
        let ttl = options.cache_ttl.unwrap_or(inner.config.cache_ttl);
        let key = cache_key(&method, &url);

        if cacheable && !ttl.is_zero() {
            if let Some(data) = inner.cache.get(&key) {
                tracing::debug!(%key, "Cache hit");
                return Ok(data);
            }
        }

        let mut headers = options.headers;
        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        let request = HttpRequest {
            method: method.clone(),
            url: url.clone(),
            headers,
            body,
        };
        let timeout = options.timeout.unwrap_or(inner.config.timeout);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!(%method, %url, attempt, "Dispatching request");

            let err = match inner.send_once(request.clone(), timeout).await {
                Ok(data) => {
                    if cacheable {
                        // The session may have been cleared or replaced while in flight
                        if inner.credentials.epoch() == epoch {
                            inner.cache.set(key, data.clone(), ttl);
                        } else {
                            tracing::debug!(%key, "Credential changed during request; not caching");
                        }
                    } else {
                        inner.cache.invalidate(url.path());
                        for pattern in &options.invalidates {
                            inner.cache.invalidate(pattern);
                        }
                    }
                    return Ok(data);
                }
                Err(err) => err,
            };

            if err.status() == Some(401) {
                tracing::warn!(%method, %url, "Credential rejected; clearing session");
                inner.credentials.clear();
                return Err(err);
            }

            match inner.retry_policy.decide(&err, attempt) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        %method,
                        %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = %err.code(),
                        error = %err,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }

    /// Logs in and stores the returned tokens
    ///
    /// # Returns
    /// The full login response body (it usually carries the user record)
    pub async fn login(&self, email: &str, password: &str) -> Result<Value, ApiError> {
        let body = serde_json::to_value(LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })
        .map_err(|e| ApiError::invalid_request(e.to_string()))?;

        let login_path = self.inner.config.login_path.clone();
        let response = self
            .request(
                Method::POST,
                &login_path,
                Some(body),
                RequestOptions::default().public(),
            )
            .await?;

        let grant: TokenGrant = decode(response.clone())?;
        self.persist_grant(&grant);
        tracing::info!("Logged in");
        Ok(response)
    }

    /// Forgets the session and every cached response
    pub fn logout(&self) {
        self.inner.credentials.clear();
        tracing::info!("Logged out");
    }

    /// Fetches the signed-in user's profile, cached for five minutes
    pub async fn fetch_profile<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let profile_path = self.inner.config.profile_path.clone();
        self.get_with(&profile_path, RequestOptions::default().cache_ttl(PROFILE_CACHE_TTL))
            .await
    }

    /// Stores a token obtained elsewhere
    pub fn set_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        self.inner.credentials.set(access_token, refresh_token)
    }

    pub fn clear_token(&self) {
        self.inner.credentials.clear();
    }

    /// Whether a usable token is stored; an expired one is cleared
    pub fn is_authenticated(&self) -> bool {
        self.inner.credentials.is_authenticated()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.credentials.state()
    }

    /// Drops cached responses whose key contains `pattern`
    pub fn invalidate_cache(&self, pattern: &str) -> usize {
        self.inner.cache.invalidate(pattern)
    }

    fn persist_grant(&self, grant: &TokenGrant) {
        if let Err(e) = self
            .inner
            .credentials
            .set(&grant.access_token, grant.refresh_token.as_deref())
        {
            if self.inner.credentials.state().is_usable() {
                tracing::warn!(
                    error = %e,
                    "Session could not be persisted; it will not survive a restart"
                );
            } else {
                tracing::warn!(error = %e, "Session could not be stored; log in again");
            }
        }
    }
}

/// TTL for the profile endpoint, which changes rarely
const PROFILE_CACHE_TTL: Duration = Duration::from_secs(300);

impl Inner {
    /// Joins `path` onto the base URL and appends `query`
    ///
    /// The base path is kept, so `https://host/api` + `/orders` is `https://host/api/orders`.
    fn resolve(&self, path: &str, query: &[(String, String)]) -> Result<Url, ApiError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined).map_err(|e| {
            ApiError::invalid_request(format!("Invalid request path '{}': {}", path, e))
        })?;

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// One attempt: send with a timeout and decode the response
    async fn send_once(&self, request: HttpRequest, timeout: Duration) -> Result<Value, ApiError> {
        let response = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(normalize(e.into())),
            Err(_) => return Err(normalize(TransportError::Timeout.into())),
        };
        decode_response(response)
    }
}

#[async_trait]
impl TokenRefresher for Inner {
    /// Calls the refresh endpoint directly, bypassing the dispatcher so a
    /// refresh can never trigger another refresh or a retry loop
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let url = self.resolve(&self.config.refresh_path, &[])?;
        let request = HttpRequest {
            method: Method::POST,
            url,
            headers: Vec::new(),
            body: Some(json!({ "refreshToken": refresh_token })),
        };
        let data = self.send_once(request, self.config.timeout).await?;
        decode(data)
    }
}

/// Turns a response into its JSON body or a normalized error
fn decode_response(response: HttpResponse) -> Result<Value, ApiError> {
    if !response.is_success() {
        return Err(normalize(RawFailure::Status {
            status: response.status,
            status_text: response.status_text,
            body: response.body,
        }));
    }
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|e| normalize(e.into()))
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data).map_err(|e| normalize(e.into()))
}

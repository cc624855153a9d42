//! Shared fixtures for client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pestdesk::clock::ManualClock;
use pestdesk::retry::{FixedDelay, RetryPolicy};
use pestdesk::storage::{KeyValueStore, MemoryStore};
use pestdesk::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use pestdesk::{ApiClient, ClientConfig};

pub const BASE_URL: &str = "https://crm.test/api";

/// One scripted reaction of the fake transport
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with a status and body
    Respond(u16, String),
    /// Fail without a response
    Fail(TransportError),
    /// Answer after a delay
    Delayed(Duration, u16, String),
    /// Never answer within any reasonable timeout
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Reply::Respond(status, body.to_string())
    }
}

/// Transport that plays back scripted replies in order and records requests
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();

        match reply {
            Some(Reply::Respond(status, body)) => Ok(HttpResponse {
                status,
                status_text: String::new(),
                body,
            }),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Delayed(delay, status, body)) => {
                tokio::time::sleep(delay).await;
                Ok(HttpResponse {
                    status,
                    status_text: String::new(),
                    body,
                })
            }
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Err(TransportError::Other("hung reply resolved".to_string()))
            }
            None => Err(TransportError::Other("no scripted reply left".to_string())),
        }
    }
}

/// A client wired to fakes, plus handles to them
pub struct Harness {
    pub client: ApiClient,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub storage: Arc<dyn KeyValueStore>,
}

/// Retries without waiting, so failure tests stay fast
pub fn no_wait_retries() -> Arc<dyn RetryPolicy> {
    Arc::new(FixedDelay {
        max_attempts: 3,
        delay: Duration::ZERO,
    })
}

pub fn harness(replies: impl IntoIterator<Item = Reply>) -> Harness {
    harness_with_config(ClientConfig::with_base_url(BASE_URL), replies)
}

pub fn harness_with_config(
    config: ClientConfig,
    replies: impl IntoIterator<Item = Reply>,
) -> Harness {
    harness_with(config, no_wait_retries(), Arc::new(MemoryStore::new()), replies)
}

pub fn harness_with(
    config: ClientConfig,
    retry_policy: Arc<dyn RetryPolicy>,
    storage: Arc<dyn KeyValueStore>,
    replies: impl IntoIterator<Item = Reply>,
) -> Harness {
    let transport = ScriptedTransport::new(replies);
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
    ));

    let client = ApiClient::builder(config)
        .transport(transport.clone())
        .clock(clock.clone())
        .storage(storage.clone())
        .retry_policy(retry_policy)
        .build()
        .expect("test config should be valid");

    Harness {
        client,
        transport,
        clock,
        storage,
    }
}

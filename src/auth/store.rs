//! Persisted session credential
//!
//! The `CredentialStore` is the only component that writes the access token,
//! its issuance time and the refresh token. Reading an expired token through
//! `get()` deletes it: a dead credential is never handed out, and the next
//! `is_authenticated()` reports `false`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::lifecycle::{lifecycle_state, LifecycleState, TokenPolicy};
use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::storage::{KeyValueStore, StorageError};

/// Storage key for the bearer token
pub const ACCESS_TOKEN_KEY: &str = "pestdesk.access_token";

/// Storage key for the RFC 3339 time the token was stored
pub const ISSUED_AT_KEY: &str = "pestdesk.token_issued_at";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "pestdesk.refresh_token";

/// Snapshot of the persisted fields
#[derive(Debug, Default)]
struct Record {
    access_token: Option<String>,
    issued_at: Option<DateTime<Utc>>,
    /// A token without a readable issue time, or an issue time without a token
    inconsistent: bool,
}

/// Owner of the session credential
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
    cache: ResponseCache,
    /// Serializes compound read-modify-write sequences on the record
    lock: Mutex<()>,
    /// Bumped whenever the credential is cleared or replaced by another token
    epoch: AtomicU64,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}

impl CredentialStore {
    /// Creates a store over `storage`
    ///
    /// `cache` is cleared whenever the credential is cleared or replaced by a
    /// different token.
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
        cache: ResponseCache,
    ) -> Self {
        Self {
            storage,
            clock,
            policy,
            cache,
            lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Identifies the current credential
    ///
    /// A response fetched under one epoch must not be cached once the epoch
    /// has moved on: the session it belongs to is gone.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Stores a new access token issued now
    ///
    /// Overwrites any prior record. A `None` refresh token removes the stored one.
    /// Every field is written even if an earlier write fails. If the record
    /// left behind is not exactly the new credential, it is wiped rather than
    /// kept half-updated, and the first storage error is returned.
    pub fn set(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock();

        let previous = self.storage.get(ACCESS_TOKEN_KEY);
        let issued_at = self.clock.now().to_rfc3339();

        let results = [
            self.storage.set(ACCESS_TOKEN_KEY, access_token),
            self.storage.set(ISSUED_AT_KEY, &issued_at),
            match refresh_token {
                Some(refresh_token) => self.storage.set(REFRESH_TOKEN_KEY, refresh_token),
                None => self.storage.remove(REFRESH_TOKEN_KEY),
            },
        ];

        let written = self.storage.get(ACCESS_TOKEN_KEY).as_deref() == Some(access_token)
            && self.storage.get(ISSUED_AT_KEY).as_deref() == Some(issued_at.as_str())
            && self.storage.get(REFRESH_TOKEN_KEY).as_deref() == refresh_token;

        if !written {
            tracing::warn!("Credential could not be stored; clearing the partial record");
            self.clear_locked();
        } else if previous.as_deref() != Some(access_token) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.cache.clear();
        }

        results.into_iter().collect()
    }

    /// Returns the access token if one is stored and not expired
    ///
    /// An expired or inconsistent record is wiped as a side effect.
    pub fn get(&self) -> Option<String> {
        let _guard = self.lock.lock();
        let record = self.read_record();
        let state = self.state_of(&record);

        if state == LifecycleState::Expired || record.inconsistent {
            self.clear_locked();
            return None;
        }
        record.access_token
    }

    /// Current lifecycle state, without side effects
    pub fn state(&self) -> LifecycleState {
        let record = self.read_record();
        self.state_of(&record)
    }

    /// Current lifecycle state; wipes the record if it is expired or inconsistent
    ///
    /// An expired credential reads as `Expired` once; afterwards the store is
    /// `Absent`.
    pub fn evaluate_and_clean(&self) -> LifecycleState {
        let _guard = self.lock.lock();
        let record = self.read_record();
        let state = self.state_of(&record);

        if state == LifecycleState::Expired || record.inconsistent {
            self.clear_locked();
        }
        state
    }

    pub fn is_expired(&self) -> bool {
        self.state() == LifecycleState::Expired
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.state() == LifecycleState::ExpiringSoon
    }

    /// Whether a usable token is stored; clears an expired one
    pub fn is_authenticated(&self) -> bool {
        self.get().is_some()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.storage.get(REFRESH_TOKEN_KEY)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.read_record().issued_at
    }

    /// Wipes every credential field and the response cache
    pub fn clear(&self) {
        let _guard = self.lock.lock();
        self.clear_locked();
    }

    fn clear_locked(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for key in [ACCESS_TOKEN_KEY, ISSUED_AT_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!(key, error = %e, "Failed to remove credential field");
            }
        }
        self.cache.clear();
    }

    fn read_record(&self) -> Record {
        let access_token = self.storage.get(ACCESS_TOKEN_KEY);
        let raw_issued_at = self.storage.get(ISSUED_AT_KEY);
        let issued_at = raw_issued_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let inconsistent = access_token.is_some() != issued_at.is_some()
            || (raw_issued_at.is_some() && issued_at.is_none());

        Record {
            access_token,
            issued_at,
            inconsistent,
        }
    }

    fn state_of(&self, record: &Record) -> LifecycleState {
        if record.access_token.is_none() || record.inconsistent {
            return LifecycleState::Absent;
        }
        lifecycle_state(self.clock.now(), record.issued_at, &self.policy)
    }
}

//! Per-account pooled remote sessions
//!
//! Authenticating is expensive, so sessions (HTTP agent + bearer token)
//! are acquired from and released back to a per-account pool instead of
//! being rebuilt per item. Tokens themselves come from a [`TokenProvider`];
//! the OAuth bootstrap lives outside the core.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::storage::{
    content_hash_of, LinkStore, PropertyValue, RecordId, RecordKind, SystemKind,
};

/// Supplies a bearer token for an account.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self, account: &str) -> Result<String>;
}

/// Fixed token for every account; used by the CLI (token from the
/// environment) and by tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self, _account: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// One authenticated remote session.
pub struct Session {
    pub agent: ureq::Agent,
    pub token: String,
}

/// Acquire-or-create / release-to-pool session reuse, per account.
pub struct SessionPool {
    provider: Arc<dyn TokenProvider>,
    idle: Mutex<HashMap<String, Vec<Session>>>,
}

impl SessionPool {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, account: &str) -> Result<Session> {
        if let Some(session) = self
            .idle
            .lock()
            .unwrap()
            .get_mut(account)
            .and_then(|pool| pool.pop())
        {
            debug!("Reuse session ({account})");
            return Ok(session);
        }
        debug!("Create new session ({account})");
        let token = self.provider.access_token(account)?;
        Ok(Session {
            agent: ureq::Agent::new_with_defaults(),
            token,
        })
    }

    pub fn release(&self, account: &str, session: Session) {
        debug!("Release session ({account})");
        self.idle
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default()
            .push(session);
    }
}

/// Persists tokens in the link store under the reserved token record id,
/// keyed by an account digest property. Replacing a token hard-deletes
/// the previous record; tokens are cache state, not user content.
pub struct TokenCache {
    store: Arc<dyn LinkStore>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self { store }
    }

    fn account_digest(account: &str) -> String {
        content_hash_of(account.as_bytes())
    }

    fn find_link(&self, account: &str) -> Option<crate::storage::VersionedLink> {
        let digest = Self::account_digest(account);
        self.store
            .find()
            .find(|l| {
                l.id() == &RecordId::System(SystemKind::Token)
                    && !l.is_deleted()
                    && l.property("email") == Some(&PropertyValue::Text(digest.clone()))
            })
            .cloned()
    }

    /// Load the stored token for an account, if any.
    pub fn load(&self, account: &str) -> Option<String> {
        let link = self.find_link(account)?;
        match self.store.get(&link) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) => {
                warn!("Stored token read failed ({account}): {e:#}");
                None
            }
        }
    }

    /// Store a token, replacing any previous record for the account.
    pub fn save(&self, account: &str, token: &str) -> Result<()> {
        let old = self.find_link(account);
        let link = self
            .store
            .new_link(RecordId::System(SystemKind::Token), RecordKind::Metadata, None)
            .with_property(
                "email",
                PropertyValue::Text(Self::account_digest(account)),
            );
        if !self.store.put(&link, token.as_bytes()) {
            anyhow::bail!("Failed to store token ({account})");
        }
        info!("Token stored successfully ({account})");
        if let Some(old) = old {
            if self.store.remove(&old, false) {
                debug!("Old token removed successfully ({account})");
            } else {
                warn!("Old token remove failed ({account})");
            }
        }
        Ok(())
    }
}

/// Token provider that consults the store-backed cache before falling
/// back to the inner provider, persisting what it hands out.
pub struct CachedTokenProvider {
    cache: TokenCache,
    inner: Arc<dyn TokenProvider>,
}

impl CachedTokenProvider {
    pub fn new(store: Arc<dyn LinkStore>, inner: Arc<dyn TokenProvider>) -> Self {
        Self {
            cache: TokenCache::new(store),
            inner,
        }
    }
}

impl TokenProvider for CachedTokenProvider {
    fn access_token(&self, account: &str) -> Result<String> {
        if let Some(token) = self.cache.load(account) {
            debug!("Using stored token ({account})");
            return Ok(token);
        }
        let token = self
            .inner
            .access_token(account)
            .with_context(|| format!("No token available for {account}"))?;
        self.cache.save(account, &token)?;
        Ok(token)
    }
}

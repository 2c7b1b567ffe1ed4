//! Remote mail service integration
//!
//! This module provides:
//! - the `MailRemote` trait the reconciliation engine drives
//! - wire types shared by the real client and the in-memory mock
//! - pooled authenticated sessions
//! - the Gmail API implementation (synchronous HTTP via ureq)

mod gmail;
mod mock;
mod session;

pub use gmail::GmailRemote;
pub use mock::MockRemote;
pub use session::{
    CachedTokenProvider, Session, SessionPool, StaticTokenProvider, TokenCache, TokenProvider,
};

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Typed remote failure classes. `NotFound` is intentionally absent:
/// absence is modeled as `Ok(None)` by the operations that can observe it.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The service asked us to back off; retried with a fixed sleep.
    #[error("rate limit exceeded")]
    RateLimited,
    /// Any other unexpected HTTP status.
    #[error("unexpected status {0}")]
    Status(u16),
    /// Connection-level failure; retried as transient.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Label kind as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelType {
    System,
    User,
}

/// A provider-side label. Unknown provider fields are preserved in
/// `extra` so the stored snapshot keeps full fidelity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub label_type: LabelType,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteLabel {
    pub fn new(id: impl Into<String>, name: impl Into<String>, label_type: LabelType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label_type,
            extra: serde_json::Map::new(),
        }
    }
}

/// Item summary from an enumeration listing; ids only, no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Which representation of an item to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// Full representation including the raw payload.
    Raw,
    /// Cheap representation without the payload, for drift checks.
    Minimal,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Raw => "raw",
            MessageFormat::Minimal => "minimal",
        }
    }
}

/// A fetched item. `raw` is present only for [`MessageFormat::Raw`];
/// everything else round-trips through `extra` untouched so stored
/// metadata compares structurally equal across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageEnvelope {
    /// Creation time in milliseconds since the epoch, when known.
    pub fn internal_date_millis(&self) -> Option<i64> {
        self.internal_date.as_deref()?.parse().ok()
    }

    /// The metadata snapshot stored locally: the envelope minus the raw
    /// payload field, as a JSON value for structural comparison.
    pub fn metadata_value(&self) -> Result<serde_json::Value> {
        let mut without_raw = self.clone();
        without_raw.raw = None;
        serde_json::to_value(without_raw).context("Failed to serialize item metadata")
    }
}

/// Payload for inserting an item at a destination account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertMessage {
    pub label_ids: Vec<String>,
    pub raw: String,
}

/// The remote mail/directory service the engine reconciles against.
///
/// Implementations own auth, pagination and retry; a "not found" response
/// is a terminal non-error surfaced as `None`.
pub trait MailRemote: Send + Sync {
    fn list_labels(&self, account: &str) -> Result<Vec<RemoteLabel>>;

    /// Enumerate current item ids matching `query`, e.g. `label:all` or a
    /// recency-narrowed variant.
    fn list_messages(&self, account: &str, query: &str) -> Result<BTreeMap<String, MessageSummary>>;

    fn get_message(
        &self,
        account: &str,
        id: &str,
        format: MessageFormat,
    ) -> Result<Option<MessageEnvelope>>;

    /// Create a label by name, or return the existing one when the name is
    /// already taken (create-or-find; a concurrent-create race is benign).
    fn create_label(&self, account: &str, name: &str) -> Result<RemoteLabel>;

    /// Insert a reconstructed item; returns the destination-assigned id.
    fn insert_message(&self, account: &str, message: &InsertMessage) -> Result<String>;
}

/// Decode URL-safe base64 with or without padding.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .context("Invalid base64url payload")
}

/// Encode to URL-safe base64 without padding.
pub fn encode_base64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Trim a snippet for log output.
pub fn str_trim(text: &str, length: usize) -> String {
    if text.chars().count() > length {
        let trimmed: String = text.chars().take(length).collect();
        format!("{trimmed}...")
    } else {
        text.to_string()
    }
}

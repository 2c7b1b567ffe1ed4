//! In-memory [`MailRemote`] implementation
//!
//! Used by tests and as a stand-in while wiring new providers. State is
//! fully scripted: accounts, labels, messages, and per-id failure
//! injection for exercising the engine's error isolation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use super::{
    encode_base64url, InsertMessage, LabelType, MailRemote, MessageEnvelope, MessageFormat,
    MessageSummary, RemoteLabel,
};

#[derive(Debug, Clone)]
struct MockMessage {
    raw: Vec<u8>,
    label_ids: Vec<String>,
    snippet: String,
    internal_date_millis: i64,
}

#[derive(Default)]
struct MockState {
    labels: HashMap<String, Vec<RemoteLabel>>,
    messages: HashMap<String, BTreeMap<String, MockMessage>>,
    fail_ids: HashSet<String>,
    inserted: Vec<(String, InsertMessage)>,
    created_labels: Vec<(String, String)>,
    queries: Vec<String>,
    label_seq: u64,
    insert_seq: u64,
}

/// Scriptable in-memory remote service.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_label(&self, account: &str, id: &str, name: &str, label_type: LabelType) {
        let mut state = self.state.lock().unwrap();
        state
            .labels
            .entry(account.to_string())
            .or_default()
            .push(RemoteLabel::new(id, name, label_type));
    }

    pub fn add_message(
        &self,
        account: &str,
        id: &str,
        raw: &[u8],
        label_ids: &[&str],
        internal_date_millis: i64,
        snippet: &str,
    ) {
        let mut state = self.state.lock().unwrap();
        state.messages.entry(account.to_string()).or_default().insert(
            id.to_string(),
            MockMessage {
                raw: raw.to_vec(),
                label_ids: label_ids.iter().map(|s| s.to_string()).collect(),
                snippet: snippet.to_string(),
                internal_date_millis,
            },
        );
    }

    pub fn remove_message(&self, account: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(messages) = state.messages.get_mut(account) {
            messages.remove(id);
        }
    }

    /// Make `get_message` fail for this id, exercising per-item error
    /// isolation in the engine.
    pub fn fail_on(&self, id: &str) {
        self.state.lock().unwrap().fail_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_ids.clear();
    }

    /// Messages inserted via [`MailRemote::insert_message`], in order.
    pub fn inserted(&self) -> Vec<(String, InsertMessage)> {
        self.state.lock().unwrap().inserted.clone()
    }

    /// `(account, name)` pairs passed to [`MailRemote::create_label`] that
    /// actually created a label.
    pub fn created_labels(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created_labels.clone()
    }

    /// Enumeration queries observed, in order.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

impl MailRemote for MockRemote {
    fn list_labels(&self, account: &str) -> Result<Vec<RemoteLabel>> {
        let state = self.state.lock().unwrap();
        Ok(state.labels.get(account).cloned().unwrap_or_default())
    }

    fn list_messages(
        &self,
        account: &str,
        query: &str,
    ) -> Result<BTreeMap<String, MessageSummary>> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(query.to_string());
        let messages = state.messages.get(account).cloned().unwrap_or_default();
        Ok(messages
            .into_keys()
            .map(|id| {
                (
                    id.clone(),
                    MessageSummary {
                        id,
                        thread_id: None,
                    },
                )
            })
            .collect())
    }

    fn get_message(
        &self,
        account: &str,
        id: &str,
        format: MessageFormat,
    ) -> Result<Option<MessageEnvelope>> {
        let state = self.state.lock().unwrap();
        if state.fail_ids.contains(id) {
            return Err(anyhow!("injected failure for {id}"));
        }
        let Some(message) = state.messages.get(account).and_then(|m| m.get(id)) else {
            return Ok(None);
        };
        let raw = match format {
            MessageFormat::Raw => Some(encode_base64url(&message.raw)),
            MessageFormat::Minimal => None,
        };
        Ok(Some(MessageEnvelope {
            id: id.to_string(),
            label_ids: message.label_ids.clone(),
            snippet: Some(message.snippet.clone()),
            internal_date: Some(message.internal_date_millis.to_string()),
            raw,
            extra: serde_json::Map::new(),
        }))
    }

    fn create_label(&self, account: &str, name: &str) -> Result<RemoteLabel> {
        let mut state = self.state.lock().unwrap();
        let labels = state.labels.entry(account.to_string()).or_default();
        if let Some(existing) = labels.iter().find(|l| l.name == name) {
            // create-or-find: a concurrent create already won the race
            return Ok(existing.clone());
        }
        state.label_seq += 1;
        let label = RemoteLabel::new(
            format!("Label_{}", state.label_seq),
            name,
            LabelType::User,
        );
        state
            .labels
            .get_mut(account)
            .unwrap()
            .push(label.clone());
        state
            .created_labels
            .push((account.to_string(), name.to_string()));
        Ok(label)
    }

    fn insert_message(&self, account: &str, message: &InsertMessage) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.insert_seq += 1;
        let id = format!("inserted-{}", state.insert_seq);
        state
            .inserted
            .push((account.to_string(), message.clone()));
        Ok(id)
    }
}

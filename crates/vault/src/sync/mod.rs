//! Reconciliation engine for backup and restore
//!
//! Drives the diff between the remote service's current item set and the
//! versioned local archive. Per-item work fans out onto a bounded worker
//! pool; a shared error counter gates the destructive tombstone step, and
//! an explicit cancellation token stops the pass between items.

mod backup;
mod filter;
mod restore;

pub use backup::BackupStats;
pub use filter::RestoreFilter;
pub use restore::RestoreStats;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use serde_json::Value;

use crate::exec::DEFAULT_WORKERS;
use crate::remote::{InsertMessage, LabelType, MailRemote, RemoteLabel};
use crate::storage::{
    new_version_token, LinkCollection, LinkStore, RecordId, RecordKind, SystemKind, VersionedLink,
};

/// One account's reconciliation engine: a local link store on one side, a
/// remote mail service on the other.
pub struct MailboxEngine {
    email: String,
    store: Arc<dyn LinkStore>,
    remote: Arc<dyn MailRemote>,
    workers: usize,
    dry_run: bool,
}

impl MailboxEngine {
    pub fn new(
        email: impl Into<String>,
        store: Arc<dyn LinkStore>,
        remote: Arc<dyn MailRemote>,
    ) -> Self {
        Self {
            email: email.into(),
            store,
            remote,
            workers: DEFAULT_WORKERS,
            dry_run: false,
        }
    }

    /// Worker pool width for per-item fan-out.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        self
    }

    /// Short-circuit every mutating store operation and every mutating
    /// remote call to a logged no-op, so a full pass is observable
    /// without side effects.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub(crate) fn storage_put(&self, link: &VersionedLink, data: &[u8]) -> bool {
        if self.dry_run {
            info!("DRY MODE storage put: {link}");
            return true;
        }
        self.store.put(link, data)
    }

    pub(crate) fn storage_remove(&self, link: &VersionedLink) -> bool {
        if self.dry_run {
            info!("DRY MODE storage remove: {link}");
            return true;
        }
        self.store.remove(link, true)
    }

    pub(crate) fn create_label_checked(&self, account: &str, name: &str) -> Result<RemoteLabel> {
        info!("Restoring label if not exists: {name}");
        if self.dry_run {
            info!("DRY MODE: create label if not exists");
            return Ok(RemoteLabel::new(
                format!("Label_DRY{}", new_version_token()),
                name,
                LabelType::User,
            ));
        }
        self.remote.create_label(account, name)
    }

    pub(crate) fn insert_message_checked(
        &self,
        account: &str,
        message: &InsertMessage,
    ) -> Result<String> {
        if self.dry_run {
            info!("DRY MODE message insert");
            return Ok(format!("DRYMODE{}", new_version_token()));
        }
        self.remote.insert_message(account, message)
    }

    /// Read the stored JSON payload of a link.
    pub(crate) fn load_json(&self, link: &VersionedLink) -> Result<Value> {
        let bytes = self.store.get(link)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed stored JSON ({link})"))
    }

    /// The latest non-deleted label snapshot link, if any.
    pub(crate) fn label_snapshot_link(&self, links: &LinkCollection) -> Option<VersionedLink> {
        links
            .find(|l| {
                l.id() == &RecordId::System(SystemKind::Labels)
                    && l.kind() == RecordKind::Metadata
                    && !l.is_deleted()
            })
            .cloned()
    }

    /// Merge every stored label snapshot, oldest first, into an id-keyed
    /// map. Parse failures are fatal: restore cannot remap labels without
    /// a trustworthy snapshot.
    pub(crate) fn load_label_snapshot(
        &self,
        links: &LinkCollection,
    ) -> Result<HashMap<String, RemoteLabel>> {
        info!("Loading labels...");
        let versions = links.latest_by(
            |l| {
                l.id() == &RecordId::System(SystemKind::Labels)
                    && l.kind() == RecordKind::Metadata
                    && !l.is_deleted()
            },
            |l| l.version().unwrap_or_default().to_string(),
        );

        let mut result = HashMap::new();
        for link in versions.values() {
            let bytes = self.store.get(link)?;
            let labels: Vec<RemoteLabel> = serde_json::from_slice(&bytes)
                .context("Stored labels read from JSON failed")?;
            for label in labels {
                result.insert(label.id.clone(), label);
            }
        }
        info!("Labels loaded successfully ({})", result.len());
        Ok(result)
    }

    pub(crate) fn fetch_remote_labels(&self, account: &str) -> Result<Vec<RemoteLabel>> {
        info!("Getting labels from server ({account})");
        self.remote.list_labels(account)
    }
}

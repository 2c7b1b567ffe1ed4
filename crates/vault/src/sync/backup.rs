//! Backup pass: diff local-latest against remote-current
//!
//! New items are fetched in full and stored as object + metadata records;
//! known items are drift-checked against the cheap minimal representation
//! and get a new metadata version only on change. Ids left in the working
//! set after the barrier are exactly what the remote no longer has; they
//! are tombstoned only when the whole pass ran without a single error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use log::{debug, error, info};

use super::MailboxEngine;
use crate::exec::{CancelToken, ErrorCounter, TaskPool};
use crate::remote::{decode_base64url, str_trim, MessageFormat, MessageSummary};
use crate::storage::{content_hash_of, ItemLinks, RecordId, RecordKind, VersionedLink};

/// Outcome counters of one backup pass.
#[derive(Debug, Default, Clone)]
pub struct BackupStats {
    /// Items the remote enumeration returned.
    pub remote_messages: usize,
    /// Usable items known locally before the pass.
    pub stored_messages: usize,
    /// Object payloads stored.
    pub payload_writes: usize,
    /// Metadata versions written (new items and drift).
    pub metadata_writes: usize,
    /// Items tombstoned because the remote no longer has them.
    pub tombstoned: usize,
    /// Per-item task failures.
    pub errors: usize,
}

#[derive(Default)]
struct BackupCounters {
    payload_writes: AtomicUsize,
    metadata_writes: AtomicUsize,
}

impl MailboxEngine {
    /// Run one backup pass. `quick_sync_days` narrows remote enumeration
    /// by recency and disables the deletion step.
    pub fn backup(
        &self,
        quick_sync_days: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<BackupStats> {
        info!("Starting backup for {}", self.email);
        let mut stats = BackupStats::default();

        info!("Scanning backup storage...");
        let stored_all = self.store.find();
        info!("Stored records: {}", stored_all.len());

        let labels_link = self.label_snapshot_link(&stored_all);
        self.backup_labels(labels_link.as_ref())
            .context("Backup aborted: storing labels failed")?;

        let quick_sync_days = quick_sync_days.filter(|days| *days >= 1);
        if let Some(days) = quick_sync_days {
            info!("Quick syncing, going back {days} days");
        }

        let mut stored = stored_all.item_index(|_| true);
        drop(stored_all);
        stored.retain(|id, links| match &links.metadata {
            None => {
                error!("{id} metadata is not found locally");
                false
            }
            Some(metadata) if metadata.is_deleted() => {
                debug!("{id} metadata is already deleted");
                false
            }
            Some(_) => true,
        });
        stats.stored_messages = stored.len();
        info!("Stored messages: {}", stored.len());

        let mut query = String::from("label:all");
        if let Some(days) = quick_sync_days {
            let after = Utc::now() - chrono::Duration::days(i64::from(days));
            query = format!("label:all after:{}", after.format("%Y/%m/%d"));
        }
        info!("Getting all message ids from server...");
        let remote_messages = self.remote.list_messages(&self.email, &query)?;
        info!("Message count: {}", remote_messages.len());
        stats.remote_messages = remote_messages.len();

        let stored = Mutex::new(stored);
        let errors = ErrorCounter::new();
        let counters = BackupCounters::default();
        let pool = TaskPool::new(self.workers)?;

        info!("Processing...");
        let completed = pool.run_all(
            remote_messages.into_values().collect(),
            cancel,
            |summary| {
                let id = summary.id.clone();
                if let Err(e) = self.backup_one(&summary, &stored, &counters) {
                    errors.increment();
                    error!("{id} {e:#}");
                }
            },
        );
        if !completed {
            anyhow::bail!("Backup cancelled");
        }
        info!("Processed");

        stats.payload_writes = counters.payload_writes.load(Ordering::SeqCst);
        stats.metadata_writes = counters.metadata_writes.load(Ordering::SeqCst);
        stats.errors = errors.get();
        if stats.errors > 0 {
            // a partially failed pass must never look like a deletion pass
            anyhow::bail!("Backup failed with {} errors", stats.errors);
        }

        if quick_sync_days.is_none() {
            let remaining = stored.into_inner().unwrap();
            info!("Marking deleted messages...");
            for (id, links) in &remaining {
                if cancel.is_cancelled() {
                    anyhow::bail!("Backup cancelled");
                }
                self.tombstone_item(id, links, &mut stats);
            }
            info!("Mark as deleted: complete");
        } else {
            info!("Quick sync mode, skipping deletion for local storage");
        }

        info!("Backup finished for {}", self.email);
        Ok(stats)
    }

    fn tombstone_item(&self, id: &str, links: &ItemLinks, stats: &mut BackupStats) {
        let Some(metadata_link) = &links.metadata else {
            return;
        };
        debug!("{id} marking as deleted in local storage...");
        if !self.storage_remove(metadata_link) {
            error!("{id} mark as deleted failed");
            return;
        }
        debug!("{id} metadata marked as deleted");
        match &links.object {
            None => info!("{id} marked as deleted"),
            Some(object_link) => {
                if self.storage_remove(object_link) {
                    debug!("{id} object marked as deleted");
                    info!("{id} marked as deleted");
                } else {
                    error!("{id} object mark as deleted failed");
                }
            }
        }
        stats.tombstoned += 1;
    }

    /// Snapshot the remote label set, skipping the write when the stored
    /// snapshot is structurally identical. A write failure here is fatal
    /// to the whole pass: labels are a prerequisite for restore.
    fn backup_labels(&self, existing: Option<&VersionedLink>) -> Result<()> {
        info!("Backing up labels...");
        let labels = self.fetch_remote_labels(&self.email)?;
        let labels_value = serde_json::to_value(&labels)?;

        if let Some(link) = existing {
            debug!("Label snapshot exists, checking for changes");
            match self.load_json(link) {
                Ok(stored) if stored == labels_value => {
                    info!("Labels are unchanged, not saving");
                    return Ok(());
                }
                Ok(_) => debug!("Labels changed"),
                Err(e) => error!("Stored labels loading or parsing failed: {e:#}"),
            }
        }

        let link = self.store.new_link(
            RecordId::System(crate::storage::SystemKind::Labels),
            RecordKind::Metadata,
            None,
        );
        if !self.storage_put(&link, &serde_json::to_vec(&labels_value)?) {
            anyhow::bail!("Error while storing labels");
        }
        info!("Labels backed up successfully");
        Ok(())
    }

    fn backup_one(
        &self,
        summary: &MessageSummary,
        stored: &Mutex<BTreeMap<String, ItemLinks>>,
        counters: &BackupCounters,
    ) -> Result<()> {
        let id = &summary.id;
        let links = stored.lock().unwrap().get(id).cloned();
        let is_new = links.is_none();
        if is_new {
            debug!("{id} is new");
        }

        let mut format = MessageFormat::Raw;
        if let Some(links) = &links {
            if let Some(object_link) = &links.object {
                // payload already present; backfill its hash if it predates
                // the integrity-hash feature, then only drift-check metadata
                if object_link.content_hash().is_none() {
                    debug!("{id} object record has no content hash, attaching it");
                    let hashed = self.store.content_hash_add(object_link)?;
                    if let Some(entry) = stored.lock().unwrap().get_mut(id) {
                        entry.object = Some(hashed);
                    }
                    debug!("{id} object record is signed by content hash");
                }
                format = MessageFormat::Minimal;
            }
        }

        let Some(envelope) = self.remote.get_message(&self.email, id, format)? else {
            // deleted remotely between enumeration and fetch; the id stays
            // in the working set and the tombstone step handles it
            info!("{id} is not found on server");
            return Ok(());
        };

        let snippet = str_trim(envelope.snippet.as_deref().unwrap_or(""), 64);
        if is_new {
            info!("{id} new message, snippet: {snippet}");
        } else {
            debug!("{id} snippet: {snippet}");
        }

        let created_at = envelope
            .internal_date_millis()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

        if let Some(raw) = &envelope.raw {
            let raw = decode_base64url(raw)?;
            let link = self
                .store
                .new_link(RecordId::item(id.clone()), RecordKind::Object, created_at)
                .with_content_hash(content_hash_of(&raw));
            if !self.storage_put(&link, &raw) {
                anyhow::bail!("Message payload save failed");
            }
            info!("{id} message is saved");
            counters.payload_writes.fetch_add(1, Ordering::SeqCst);
        }

        let metadata = envelope.metadata_value()?;
        let mut write_metadata = true;
        if let Some(metadata_link) = links.as_ref().and_then(|l| l.metadata.as_ref()) {
            match self.load_json(metadata_link) {
                Ok(stored_metadata) if stored_metadata == metadata => write_metadata = false,
                Ok(_) => {}
                // unreadable local metadata: force a fresh write
                Err(e) => error!("{id} stored metadata load failed: {e:#}"),
            }
        }

        if write_metadata {
            let link =
                self.store
                    .new_link(RecordId::item(id.clone()), RecordKind::Metadata, created_at);
            if !self.storage_put(&link, &serde_json::to_vec(&metadata)?) {
                anyhow::bail!("Metadata put failed");
            }
            info!("{id} metadata is saved");
            counters.metadata_writes.fetch_add(1, Ordering::SeqCst);
        } else {
            debug!("{id} metadata is unchanged, skipping write");
        }

        stored.lock().unwrap().remove(id);
        Ok(())
    }
}

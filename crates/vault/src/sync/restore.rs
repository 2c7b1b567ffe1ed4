//! Restore pass: upload stored items back to a remote account
//!
//! Candidates come from the latest-version index filtered by
//! [`RestoreFilter`]. Label ids are remapped through the stored label
//! snapshot onto the destination account's label set, creating missing
//! user labels on demand. Uploads fan out onto the worker pool with
//! per-item error isolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use super::{MailboxEngine, RestoreFilter};
use crate::exec::{CancelToken, ErrorCounter, TaskPool};
use crate::remote::{encode_base64url, str_trim, InsertMessage, RemoteLabel};
use crate::storage::ItemLinks;

/// Outcome counters of one restore pass.
#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    /// Items the filter selected with both halves present.
    pub candidates: usize,
    /// Items uploaded to the destination.
    pub uploaded: usize,
    /// Items skipped because they carry the CHAT label.
    pub skipped_chat: usize,
    /// Per-item task failures.
    pub errors: usize,
}

#[derive(Default)]
struct RestoreCounters {
    uploaded: AtomicUsize,
    skipped_chat: AtomicUsize,
}

/// Source-label-id to destination-label mapping, built lazily.
///
/// Seeded with the destination's current labels keyed by their own ids,
/// so same-account restores resolve without any remote calls. On a miss
/// the stored snapshot supplies the label name, which is matched against
/// the destination by name or created there.
struct LabelMap {
    snapshot: HashMap<String, RemoteLabel>,
    table: Mutex<HashMap<String, RemoteLabel>>,
}

impl LabelMap {
    fn new(snapshot: HashMap<String, RemoteLabel>, destination: Vec<RemoteLabel>) -> Self {
        let table = destination
            .into_iter()
            .map(|label| (label.id.clone(), label))
            .collect();
        Self {
            snapshot,
            table: Mutex::new(table),
        }
    }

    /// Map a message's source label ids (plus extra label names) to
    /// destination label ids. CHAT is never mapped; callers skip those
    /// messages before getting here.
    fn resolve(
        &self,
        engine: &MailboxEngine,
        to_email: &str,
        message_label_ids: &[String],
        add_labels: &[String],
    ) -> Result<Vec<String>> {
        let mut table = self.table.lock().unwrap();
        let mut result = Vec::new();

        for label_id in message_label_ids {
            if label_id == "CHAT" {
                continue;
            }
            if let Some(label) = table.get(label_id) {
                result.push(label.id.clone());
                continue;
            }
            let Some(stored) = self.snapshot.get(label_id) else {
                warn!("Label {label_id} cannot be restored, no local data for it");
                continue;
            };
            if let Some(existing) = table.values().find(|l| l.name == stored.name).cloned() {
                // same name already present at the destination under a
                // different id; alias the source id to it
                result.push(existing.id.clone());
                table.insert(label_id.clone(), existing);
                continue;
            }
            let created = engine.create_label_checked(to_email, &stored.name)?;
            result.push(created.id.clone());
            table.insert(label_id.clone(), created);
        }

        for name in add_labels {
            let label = match table.values().find(|l| &l.name == name).cloned() {
                Some(label) => label,
                None => {
                    let created = engine.create_label_checked(to_email, name)?;
                    table.insert(created.id.clone(), created.clone());
                    created
                }
            };
            if !result.contains(&label.id) {
                result.push(label.id.clone());
            }
        }

        Ok(result)
    }
}

impl MailboxEngine {
    /// Run one restore pass against `to_email` (defaults to the engine's
    /// own account).
    pub fn restore(
        &self,
        filter: &RestoreFilter,
        to_email: Option<&str>,
        add_labels: &[String],
        cancel: &CancelToken,
    ) -> Result<RestoreStats> {
        let to_email = to_email.unwrap_or(&self.email);
        info!("Starting restore to {to_email} from {}", self.email);
        let mut stats = RestoreStats::default();

        if filter.is_noop() {
            warn!("Nothing to restore, you should use --restore-deleted or --restore-missing flag");
            return Ok(stats);
        }

        info!("Scanning backup storage...");
        let stored_all = self.store.find();
        info!("Stored records: {}", stored_all.len());

        let snapshot = self
            .load_label_snapshot(&stored_all)
            .context("Stored labels loading failed")?;
        let destination_labels = self.fetch_remote_labels(to_email)?;

        // cross-account restores never dedupe by source id: the two
        // accounts do not share an id space
        let destination_ids = if to_email == self.email {
            self.remote.list_messages(to_email, "label:all")?
        } else {
            BTreeMap::new()
        };

        let mut candidates = stored_all.item_index(|link| filter.matches(link, &destination_ids));
        candidates.retain(|id, links| {
            if links.metadata.is_none() || links.object.is_none() {
                debug!("{id} is filtered out or incomplete, skipping");
                return false;
            }
            true
        });
        stats.candidates = candidates.len();
        info!("Number of messages to restore: {}", candidates.len());

        let labels = LabelMap::new(snapshot, destination_labels);
        let errors = ErrorCounter::new();
        let counters = RestoreCounters::default();
        let pool = TaskPool::new(self.workers)?;

        let completed = pool.run_all(
            candidates.into_iter().collect::<Vec<_>>(),
            cancel,
            |(id, links)| {
                if let Err(e) = self.restore_one(&id, &links, to_email, &labels, add_labels, &counters)
                {
                    errors.increment();
                    error!("{id} {e:#}");
                }
            },
        );
        if !completed {
            bail!("Restore cancelled");
        }

        stats.uploaded = counters.uploaded.load(Ordering::SeqCst);
        stats.skipped_chat = counters.skipped_chat.load(Ordering::SeqCst);
        stats.errors = errors.get();
        if stats.errors > 0 {
            bail!("Messages uploaded with {} errors", stats.errors);
        }
        info!("Messages uploaded successfully ({})", stats.uploaded);
        Ok(stats)
    }

    fn restore_one(
        &self,
        id: &str,
        links: &ItemLinks,
        to_email: &str,
        labels: &LabelMap,
        add_labels: &[String],
        counters: &RestoreCounters,
    ) -> Result<()> {
        info!("{id} restoring message...");
        let metadata_link = links.metadata.as_ref().context("Metadata link missing")?;
        let object_link = links.object.as_ref().context("Object link missing")?;

        let metadata = self.load_json(metadata_link)?;

        if self.store.content_hash_check(object_link)? == Some(false) {
            bail!("Stored payload content hash mismatch");
        }
        let payload = self.store.get(object_link)?;

        let label_ids: Vec<String> = metadata
            .get("labelIds")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if label_ids.iter().any(|l| l == "CHAT") {
            info!("{id} message with CHAT label is not supported");
            counters.skipped_chat.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let remapped = labels.resolve(self, to_email, &label_ids, add_labels)?;

        let snippet = metadata
            .get("snippet")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        debug!("{id} snippet: {}", str_trim(snippet, 80));

        let message = InsertMessage {
            label_ids: remapped,
            raw: encode_base64url(&payload),
        };
        let new_id = self.insert_message_checked(to_email, &message)?;
        info!("{id}->{new_id} message uploaded ({} bytes)", payload.len());
        counters.uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

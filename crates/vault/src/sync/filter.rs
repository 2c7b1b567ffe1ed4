//! Restore candidate filter
//!
//! Decides which stored links a restore pass considers. Object links
//! always match (the pairing step drops ids missing either half);
//! metadata links are filtered by date range, tombstone state and
//! presence at the destination.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::remote::MessageSummary;
use crate::storage::{RecordId, RecordKind, VersionedLink};

#[derive(Debug, Default, Clone)]
pub struct RestoreFilter {
    date_from: Option<DateTime<Utc>>,
    date_to: Option<DateTime<Utc>>,
    match_deleted: bool,
    match_missing: bool,
}

impl RestoreFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_date_from(mut self, dt: Option<DateTime<Utc>>) -> Self {
        self.date_from = dt;
        self
    }

    pub fn with_date_to(mut self, dt: Option<DateTime<Utc>>) -> Self {
        self.date_to = dt;
        self
    }

    /// Also match tombstoned records (restore deleted items).
    pub fn with_match_deleted(mut self, match_deleted: bool) -> Self {
        self.match_deleted = match_deleted;
        self
    }

    /// Match only records absent from the destination enumeration.
    pub fn with_match_missing(mut self, match_missing: bool) -> Self {
        self.match_missing = match_missing;
        self
    }

    /// True when the filter selects nothing at all; a restore pass with a
    /// no-op filter has no tasks.
    pub fn is_noop(&self) -> bool {
        !self.match_deleted && !self.match_missing
    }

    pub fn matches(
        &self,
        link: &VersionedLink,
        destination_ids: &BTreeMap<String, MessageSummary>,
    ) -> bool {
        if link.kind() == RecordKind::Object {
            return true;
        }

        let version_millis: i64 = link
            .version()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        if let Some(date_to) = self.date_to {
            if version_millis >= date_to.timestamp_millis() {
                return false;
            }
        }
        if let Some(date_from) = self.date_from {
            if version_millis < date_from.timestamp_millis() {
                return false;
            }
        }

        if link.is_deleted() {
            return self.match_deleted;
        }
        if !self.match_missing {
            return true;
        }
        match link.id() {
            RecordId::Item(id) => !destination_ids.contains_key(id),
            RecordId::System(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    fn meta_link(id: &str, version_millis: i64, deleted: bool) -> VersionedLink {
        let link = VersionedLink::new(RecordId::item(id), RecordKind::Metadata, Path::new("/d"))
            .with_version(version_millis.to_string());
        if deleted { link.with_deleted() } else { link }
    }

    fn dest(ids: &[&str]) -> BTreeMap<String, MessageSummary> {
        ids.iter()
            .map(|id| {
                (
                    id.to_string(),
                    MessageSummary {
                        id: id.to_string(),
                        thread_id: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_object_links_always_match() {
        let link = VersionedLink::new(RecordId::item("a"), RecordKind::Object, Path::new("/d"));
        let filter = RestoreFilter::new();
        assert!(filter.matches(&link, &dest(&[])));
    }

    #[test]
    fn test_deleted_needs_match_deleted() {
        let link = meta_link("a", 1_000, true);
        assert!(!RestoreFilter::new().matches(&link, &dest(&[])));
        assert!(
            RestoreFilter::new()
                .with_match_deleted(true)
                .matches(&link, &dest(&[]))
        );
    }

    #[test]
    fn test_missing_checks_destination() {
        let filter = RestoreFilter::new().with_match_missing(true);
        let link = meta_link("a", 1_000, false);
        assert!(filter.matches(&link, &dest(&[])));
        assert!(!filter.matches(&link, &dest(&["a"])));
    }

    #[test]
    fn test_date_bounds_compare_version_tokens() {
        let cutoff = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let before = meta_link("a", cutoff.timestamp_millis() - 1, false);
        let after = meta_link("b", cutoff.timestamp_millis() + 1, false);

        let upto = RestoreFilter::new()
            .with_match_deleted(true)
            .with_date_to(Some(cutoff));
        assert!(upto.matches(&before, &dest(&[])));
        assert!(!upto.matches(&after, &dest(&[])));

        let from = RestoreFilter::new()
            .with_match_deleted(true)
            .with_date_from(Some(cutoff));
        assert!(!from.matches(&before, &dest(&[])));
        assert!(from.matches(&after, &dest(&[])));
    }

    #[test]
    fn test_is_noop() {
        assert!(RestoreFilter::new().is_noop());
        assert!(!RestoreFilter::new().with_match_deleted(true).is_noop());
        assert!(!RestoreFilter::new().with_match_missing(true).is_noop());
    }
}

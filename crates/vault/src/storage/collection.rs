//! In-memory filter/group/latest-wins resolution over a batch of links
//!
//! Built fresh from a `LinkStore::find` scan per reconciliation pass and
//! discarded afterwards. Ties within a group are resolved by the greatest
//! version token; a missing token sorts lowest.

use std::collections::BTreeMap;

use super::link::{RecordId, RecordKind, VersionedLink};

/// Snapshot of links returned by a store scan.
#[derive(Debug, Default, Clone)]
pub struct LinkCollection {
    links: Vec<VersionedLink>,
}

/// The current (latest-wins) metadata and object links for one item id.
#[derive(Debug, Default, Clone)]
pub struct ItemLinks {
    pub metadata: Option<VersionedLink>,
    pub object: Option<VersionedLink>,
}

impl LinkCollection {
    pub fn new(links: Vec<VersionedLink>) -> Self {
        Self { links }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionedLink> {
        self.links.iter()
    }

    /// The single highest-version link satisfying `filter`, if any.
    pub fn find<F>(&self, filter: F) -> Option<&VersionedLink>
    where
        F: Fn(&VersionedLink) -> bool,
    {
        let mut best: Option<&VersionedLink> = None;
        for link in self.links.iter().filter(|l| filter(l)) {
            match best {
                Some(current) if !link.is_newer_than(current) => {}
                _ => best = Some(link),
            }
        }
        best
    }

    /// Group matching links by `key` and keep the highest version per key.
    pub fn latest_by<K, F, G>(&self, filter: F, key: G) -> BTreeMap<K, VersionedLink>
    where
        K: Ord,
        F: Fn(&VersionedLink) -> bool,
        G: Fn(&VersionedLink) -> K,
    {
        let mut result: BTreeMap<K, VersionedLink> = BTreeMap::new();
        for link in self.links.iter().filter(|l| filter(l)) {
            let k = key(link);
            match result.get(&k) {
                Some(current) if !link.is_newer_than(current) => {}
                _ => {
                    result.insert(k, link.clone());
                }
            }
        }
        result
    }

    /// Resolve the current `(metadata, object)` link pair for every user
    /// item matching `filter`. System records never appear here.
    pub fn item_index<F>(&self, filter: F) -> BTreeMap<String, ItemLinks>
    where
        F: Fn(&VersionedLink) -> bool,
    {
        let latest = self.latest_by(
            |l| !l.id().is_system() && filter(l),
            |l| (l.id().clone(), l.kind()),
        );
        let mut result: BTreeMap<String, ItemLinks> = BTreeMap::new();
        for ((id, kind), link) in latest {
            let RecordId::Item(id) = id else { continue };
            let entry = result.entry(id).or_default();
            match kind {
                RecordKind::Metadata => entry.metadata = Some(link),
                RecordKind::Object => entry.object = Some(link),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::link::SystemKind;
    use std::path::Path;

    fn link(id: &str, kind: RecordKind, version: &str) -> VersionedLink {
        VersionedLink::new(RecordId::item(id), kind, Path::new("/d")).with_version(version)
    }

    #[test]
    fn test_find_latest_wins_regardless_of_order() {
        let newest = link("a", RecordKind::Metadata, "300");
        let collection = LinkCollection::new(vec![
            link("a", RecordKind::Metadata, "200"),
            newest.clone(),
            link("a", RecordKind::Metadata, "100"),
        ]);

        let found = collection.find(|_| true).unwrap();
        assert_eq!(found, &newest);
    }

    #[test]
    fn test_find_none_when_no_match() {
        let collection = LinkCollection::new(vec![link("a", RecordKind::Metadata, "1")]);
        assert!(collection.find(|l| l.is_deleted()).is_none());
    }

    #[test]
    fn test_missing_version_sorts_lowest() {
        let unversioned = VersionedLink::new(RecordId::item("a"), RecordKind::Metadata, "/d");
        let versioned = link("a", RecordKind::Metadata, "100");
        let collection = LinkCollection::new(vec![versioned.clone(), unversioned]);
        assert_eq!(collection.find(|_| true).unwrap(), &versioned);
    }

    #[test]
    fn test_latest_by_groups_independently() {
        let collection = LinkCollection::new(vec![
            link("a", RecordKind::Metadata, "100"),
            link("a", RecordKind::Metadata, "300"),
            link("b", RecordKind::Metadata, "200"),
        ]);

        let grouped = collection.latest_by(|_| true, |l| l.id().clone());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&RecordId::item("a")].version(), Some("300"));
        assert_eq!(grouped[&RecordId::item("b")].version(), Some("200"));
    }

    #[test]
    fn test_item_index_resolves_pairs_and_skips_system() {
        let system = VersionedLink::new(
            RecordId::System(SystemKind::Labels),
            RecordKind::Metadata,
            Path::new("/d"),
        )
        .with_version("999");

        let collection = LinkCollection::new(vec![
            link("a", RecordKind::Metadata, "100"),
            link("a", RecordKind::Metadata, "150"),
            link("a", RecordKind::Object, "100"),
            link("b", RecordKind::Object, "50"),
            system,
        ]);

        let index = collection.item_index(|_| true);
        assert_eq!(index.len(), 2);

        let a = &index["a"];
        assert_eq!(a.metadata.as_ref().unwrap().version(), Some("150"));
        assert_eq!(a.object.as_ref().unwrap().version(), Some("100"));

        let b = &index["b"];
        assert!(b.metadata.is_none());
        assert!(b.object.is_some());
    }
}

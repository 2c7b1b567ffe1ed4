//! Versioned object storage
//!
//! Identity, content kind, version and deletion state are encoded entirely
//! in addressable records; writes are append-only and never destructive.

mod collection;
mod link;
mod store;

pub use collection::{ItemLinks, LinkCollection};
pub use link::{
    date_shard, new_version_token, PropertyValue, RecordId, RecordKind, SystemKind,
    VersionedLink, RESERVED_PREFIX, TEMP_EXTENSION,
};
pub use store::{content_hash_of, FileLinkStore, LinkStore};

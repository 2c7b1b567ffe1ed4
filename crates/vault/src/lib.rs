//! Vault crate - versioned mailbox archival
//!
//! This crate provides platform-independent backup and restore logic:
//! - Versioned link storage (append-only records, tombstones, hashes)
//! - The `LinkStore` trait and its filesystem implementation
//! - Gmail API client with pooled sessions and retry
//! - The reconciliation engine driving backup and restore passes
//! - A bounded worker pool with explicit cancellation
//!
//! This crate has no UI dependencies; the `mailvault` binary is a thin
//! CLI wrapper around it.

pub mod config;
pub mod exec;
pub mod remote;
pub mod storage;
pub mod sync;

pub use config::{settings_path, token_from_env, VaultSettings, SETTINGS_ENV, TOKEN_ENV};
pub use exec::{CancelToken, ErrorCounter, TaskPool, DEFAULT_WORKERS};
pub use remote::{
    CachedTokenProvider, GmailRemote, InsertMessage, LabelType, MailRemote, MessageEnvelope,
    MessageFormat, MessageSummary, MockRemote, RemoteError, RemoteLabel, SessionPool,
    StaticTokenProvider, TokenCache, TokenProvider,
};
pub use storage::{
    content_hash_of, FileLinkStore, ItemLinks, LinkCollection, LinkStore, PropertyValue, RecordId,
    RecordKind, SystemKind, VersionedLink,
};
pub use sync::{BackupStats, MailboxEngine, RestoreFilter, RestoreStats};

//! Versioned link records and the filename codec
//!
//! A [`VersionedLink`] addresses exactly one immutable version of one stored
//! record. Everything that identifies the record (logical id, content kind,
//! version token, deletion flag, content hash, extra properties) is encoded
//! in the on-disk file name, so the store needs no side database.
//!
//! File name layout:
//!
//! ```text
//! <escaped-id>.<key>=<value>.<key>=<value>.<extension>
//! 18f2a9c01.metadata=.mutation=1712345678901.json
//! 18f2a9c01.hash=s9f86d08....mutation=1712345678902.object=.eml.zst
//! ```
//!
//! Property segments are emitted in sorted key order so encoding is
//! deterministic. A property with no value serializes as a bare `key=` flag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Prefix marking system records (label snapshots, stored tokens).
pub const RESERVED_PREFIX: &str = "--mailvault-";

const PROP_DELETED: &str = "deleted";
const PROP_METADATA: &str = "metadata";
const PROP_OBJECT: &str = "object";
const PROP_MUTATION: &str = "mutation";
const PROP_HASH: &str = "hash";

/// Extension marking an in-progress write. Purged during scans, never a
/// valid record.
pub const TEMP_EXTENSION: &str = "tmp";

/// Logical identity of a stored record.
///
/// System records share the store with user items but are excluded from
/// per-item reconciliation. They are dispatched by this explicit variant
/// rather than by string-prefix checks; the on-disk encoding keeps the
/// reserved prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    /// A backed-up provider item, keyed by its provider id.
    Item(String),
    /// A system record owned by the tool itself.
    System(SystemKind),
}

/// The system records the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SystemKind {
    /// JSON snapshot of the provider-side label set.
    Labels,
    /// Stored authorization token for an account.
    Token,
}

impl RecordId {
    pub fn item(id: impl Into<String>) -> Self {
        RecordId::Item(id.into())
    }

    pub fn is_system(&self) -> bool {
        matches!(self, RecordId::System(_))
    }

    /// The string form used on disk.
    pub fn as_str(&self) -> &str {
        match self {
            RecordId::Item(id) => id,
            RecordId::System(SystemKind::Labels) => "--mailvault-labels--",
            RecordId::System(SystemKind::Token) => "--mailvault-token--",
        }
    }

    /// Inverse of [`RecordId::as_str`]. Reserved-prefixed ids that name no
    /// known system record are rejected so they never enter item diffing.
    pub fn parse(s: &str) -> Option<RecordId> {
        if !s.starts_with(RESERVED_PREFIX) {
            return Some(RecordId::Item(s.to_string()));
        }
        match s {
            "--mailvault-labels--" => Some(RecordId::System(SystemKind::Labels)),
            "--mailvault-token--" => Some(RecordId::System(SystemKind::Token)),
            _ => None,
        }
    }
}

/// What a record's payload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// JSON snapshot of provider-side fields.
    Metadata,
    /// Raw payload, stored zstd-compressed.
    Object,
}

impl RecordKind {
    /// File extension records of this kind are written with.
    pub fn extension(&self) -> &'static str {
        match self {
            RecordKind::Metadata => "json",
            RecordKind::Object => "eml.zst",
        }
    }
}

/// Value of an open extension property: a bare flag or a short string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Flag,
    Text(String),
}

/// An addressable pointer to one immutable version of one stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLink {
    id: RecordId,
    kind: RecordKind,
    version: Option<String>,
    deleted: bool,
    content_hash: Option<String>,
    extension: String,
    dir: PathBuf,
    extra: BTreeMap<String, PropertyValue>,
}

impl VersionedLink {
    /// Create a link rooted at `dir`. Prefer `LinkStore::new_link`, which
    /// also picks the date shard and a fresh version token.
    pub fn new(id: RecordId, kind: RecordKind, dir: impl Into<PathBuf>) -> Self {
        let extension = kind.extension().to_string();
        Self {
            id,
            kind,
            version: None,
            deleted: false,
            content_hash: None,
            extension,
            dir: dir.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Version token, a millisecond-epoch string. Lexicographic order
    /// equals chronological order.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.extra.get(key)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// True when `self` is a strictly newer version than `other`.
    /// A missing version token sorts lowest.
    pub fn is_newer_than(&self, other: &VersionedLink) -> bool {
        self.version > other.version
    }

    /// The encoded file name for this exact version.
    pub fn file_name(&self) -> String {
        let mut props: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        if self.deleted {
            props.insert(PROP_DELETED, None);
        }
        match self.kind {
            RecordKind::Metadata => props.insert(PROP_METADATA, None),
            RecordKind::Object => props.insert(PROP_OBJECT, None),
        };
        if let Some(v) = self.version.as_deref() {
            props.insert(PROP_MUTATION, Some(v));
        }
        if let Some(h) = self.content_hash.as_deref() {
            props.insert(PROP_HASH, Some(h));
        }
        for (k, v) in &self.extra {
            let value = match v {
                PropertyValue::Flag => None,
                PropertyValue::Text(s) => Some(s.as_str()),
            };
            props.insert(k.as_str(), value);
        }

        let mut name = escape(self.id.as_str());
        for (k, v) in props {
            name.push('.');
            name.push_str(&escape(k));
            name.push('=');
            if let Some(v) = v {
                name.push_str(&escape(v));
            }
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }

    /// Full path of this version on disk.
    pub fn path(&self) -> PathBuf {
        self.dir.join(self.file_name())
    }

    /// Parse a file name back into a link rooted at `dir`.
    ///
    /// Returns `None` for names that are not valid records: unknown
    /// reserved ids, missing version or kind, malformed segments. Temp
    /// files are valid to parse only far enough for the caller to spot
    /// the extension; they are rejected here too.
    pub fn from_file_name(dir: &Path, name: &str) -> Option<VersionedLink> {
        if name.ends_with(&format!(".{TEMP_EXTENSION}")) {
            return None;
        }
        let mut segments = name.split('.');
        let id = RecordId::parse(&unescape(segments.next()?)?)?;

        let mut deleted = false;
        let mut is_metadata = false;
        let mut is_object = false;
        let mut version = None;
        let mut content_hash = None;
        let mut extra = BTreeMap::new();
        let mut extension_parts: Vec<&str> = Vec::new();

        for segment in segments {
            if !extension_parts.is_empty() {
                // already inside the extension; keep accumulating
                extension_parts.push(segment);
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                extension_parts.push(segment);
                continue;
            };
            let key = unescape(key)?;
            match key.as_str() {
                PROP_DELETED => deleted = true,
                PROP_METADATA => is_metadata = true,
                PROP_OBJECT => is_object = true,
                PROP_MUTATION => version = Some(unescape(value)?),
                PROP_HASH => content_hash = Some(unescape(value)?),
                _ => {
                    let value = if value.is_empty() {
                        PropertyValue::Flag
                    } else {
                        PropertyValue::Text(unescape(value)?)
                    };
                    extra.insert(key, value);
                }
            }
        }

        if extension_parts.is_empty() {
            return None;
        }
        let kind = match (is_metadata, is_object) {
            (true, false) => RecordKind::Metadata,
            (false, true) => RecordKind::Object,
            _ => return None,
        };

        Some(VersionedLink {
            id,
            kind,
            version,
            deleted,
            content_hash,
            extension: extension_parts.join("."),
            dir: dir.to_path_buf(),
            extra,
        })
    }
}

impl std::fmt::Display for VersionedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// Mint a fresh version token: millisecond epoch as a decimal string.
pub fn new_version_token() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Compute the date-sharded directory for a record: `root/YYYY/MM-DD` when
/// a creation time is known, else `root` itself.
pub fn date_shard(root: &Path, created_at: Option<DateTime<Utc>>) -> PathBuf {
    match created_at {
        Some(ts) => root
            .join(ts.format("%Y").to_string())
            .join(ts.format("%m-%d").to_string()),
        None => root.to_path_buf(),
    }
}

/// Escape an id, property key or value so the codec's delimiters
/// (`.`, `=`), path separators and the escape character itself cannot
/// appear literally.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            '=' => out.push_str("%3D"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]. Returns `None` on a truncated or invalid escape.
fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let hi = chars.next()?;
        let lo = chars.next()?;
        let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
        out.push(byte as char);
    }
    Some(out)
}

//! Engine-side view of the remote head state.
//!
//! The store only knows names, ids and a content-type string; this module
//! turns that into typed records and holds the per-cycle metadata cache.
//! The cache is rebuilt wholesale from a full list at the start of every
//! cycle and only patched in place by the engine's own successful writes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use cloudsnap_core::ObjectMeta;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TAG_DELETED: &str = "cloudsnap/deleted";
const TAG_SYMLINK: &str = "cloudsnap/symlink";
const TAG_DATA_PREFIX: &str = "cloudsnap/data";

/// RFC3339 with fixed millisecond precision; lexicographic order equals
/// chronological order, which the mtime-skip and time-travel paths rely on.
pub const MODIFIED_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// What a record represents, carried out-of-band in the store's
/// content-type field. `Regular` keeps the permission bits for restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Regular { mode: u32 },
    Symlink,
    Deleted,
}

impl FileKind {
    pub fn to_tag(&self) -> String {
        match self {
            FileKind::Regular { mode } => format!("{TAG_DATA_PREFIX}{mode:03o}"),
            FileKind::Symlink => TAG_SYMLINK.to_string(),
            FileKind::Deleted => TAG_DELETED.to_string(),
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            TAG_DELETED => Some(FileKind::Deleted),
            TAG_SYMLINK => Some(FileKind::Symlink),
            _ => {
                let octal = tag.strip_prefix(TAG_DATA_PREFIX)?;
                let mode = u32::from_str_radix(octal, 8).ok()?;
                Some(FileKind::Regular { mode })
            }
        }
    }

    /// Plain kinds bypass the crypto pipeline on both ends.
    pub fn is_plain(&self) -> bool {
        !matches!(self, FileKind::Regular { .. })
    }
}

/// One head record per logical path. `composite_name` is
/// `relpath + "/" + sha256hex(plaintext)`; the hash suffix is the cheap
/// "did this exact content already get uploaded" fingerprint.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub composite_name: String,
    pub id: String,
    pub size_bytes: u64,
    pub trashed: bool,
    pub kind: FileKind,
    pub modified_time: String,
}

impl FileRecord {
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, UnknownTag> {
        let kind = FileKind::from_tag(&meta.content_type).ok_or_else(|| UnknownTag {
            name: meta.name.clone(),
            tag: meta.content_type.clone(),
        })?;
        Ok(Self {
            composite_name: meta.name.clone(),
            id: meta.id.clone(),
            size_bytes: meta.size,
            trashed: meta.trashed,
            kind,
            modified_time: meta.modified_time.clone(),
        })
    }

    pub fn rel_path(&self) -> &str {
        name_part(&self.composite_name)
    }

    pub fn hash_hex(&self) -> &str {
        hash_part(&self.composite_name)
    }
}

#[derive(Debug)]
pub struct UnknownTag {
    pub name: String,
    pub tag: String,
}

pub fn composite_name(rel_path: &str, hash_hex: &str) -> String {
    format!("{rel_path}/{hash_hex}")
}

pub fn name_part(composite: &str) -> &str {
    match composite.rfind('/') {
        Some(at) => &composite[..at],
        None => composite,
    }
}

pub fn hash_part(composite: &str) -> &str {
    match composite.rfind('/') {
        Some(at) => &composite[at + 1..],
        None => "",
    }
}

pub fn content_hash_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn format_modified(modified: SystemTime) -> Result<String, time::error::Format> {
    OffsetDateTime::from(modified).format(MODIFIED_FORMAT)
}

/// Per-cycle snapshot of the remote head, keyed by logical relative path.
/// At most one non-trashed record per path.
#[derive(Debug, Default)]
pub struct MetadataCache {
    records: HashMap<String, FileRecord>,
}

impl MetadataCache {
    pub fn from_records(records: Vec<FileRecord>) -> Self {
        let mut cache = Self::default();
        for record in records {
            cache.insert(record);
        }
        cache
    }

    pub fn get(&self, rel_path: &str) -> Option<&FileRecord> {
        self.records.get(rel_path)
    }

    pub fn insert(&mut self, record: FileRecord) {
        self.records.insert(record.rel_path().to_string(), record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRecord)> {
        self.records.iter()
    }

    /// Cached logical paths strictly below `rel_path`, for the
    /// deleted-directory cascade.
    pub fn paths_under(&self, rel_path: &str) -> Vec<String> {
        let prefix = format!("{rel_path}/");
        self.records
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

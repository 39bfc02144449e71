//! Answers "what did this path look like at time T" from the head record
//! and, when the head is too new, the store's revision history.
//!
//! Timestamps are fixed-width RFC3339 strings, so ordering is plain string
//! comparison throughout.

use cloudsnap_core::{StoreClient, StoreError};
use thiserror::Error;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};

use super::crypto::{CryptoError, CryptoPipeline};
use super::record::{FileKind, FileRecord, MODIFIED_FORMAT};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
    #[error("couldn't decode content: {0}")]
    Crypto(#[from] CryptoError),
    #[error("revision {id} has unrecognized content type {tag}")]
    UnknownTag { id: String, tag: String },
}

/// A record's state at the requested time. `content` is `None` when the
/// caller's `skip_time` matched, meaning the caller already has these bytes.
pub struct Resolved {
    pub kind: FileKind,
    pub content: Option<Vec<u8>>,
}

/// Resolves `record` at time `at` (`None` means now). When `skip_time`
/// equals the winning version's timestamp the content fetch is skipped.
pub async fn resolve_at(
    store: &StoreClient,
    crypto: &CryptoPipeline,
    record: &FileRecord,
    at: Option<&str>,
    skip_time: Option<&str>,
) -> Result<Resolved, ResolveError> {
    match at {
        Some(at) if record.modified_time.as_str() > at => {
            resolve_from_revisions(store, crypto, record, at, skip_time).await
        }
        _ => {
            if skip_time == Some(record.modified_time.as_str()) {
                return Ok(Resolved {
                    kind: record.kind.clone(),
                    content: None,
                });
            }
            let bytes = store.get_content(&record.id, None).await?;
            decode(crypto, record.kind.clone(), bytes)
        }
    }
}

async fn resolve_from_revisions(
    store: &StoreClient,
    crypto: &CryptoPipeline,
    record: &FileRecord,
    at: &str,
    skip_time: Option<&str>,
) -> Result<Resolved, ResolveError> {
    let revisions = store.list_revisions(&record.id).await?;
    let mut best: Option<&cloudsnap_core::RevisionMeta> = None;
    for revision in &revisions {
        if revision.modified_time.as_str() > at {
            continue;
        }
        // On equal timestamps the later entry wins; revision listings come
        // back oldest first.
        match best {
            Some(current) if revision.modified_time < current.modified_time => {}
            _ => best = Some(revision),
        }
    }
    let Some(revision) = best else {
        // Nothing qualifies: the path did not exist yet at that time.
        return Ok(Resolved {
            kind: FileKind::Deleted,
            content: None,
        });
    };
    let kind = FileKind::from_tag(&revision.content_type).ok_or_else(|| ResolveError::UnknownTag {
        id: revision.id.clone(),
        tag: revision.content_type.clone(),
    })?;
    if skip_time == Some(revision.modified_time.as_str()) {
        return Ok(Resolved { kind, content: None });
    }
    let bytes = store.get_content(&record.id, Some(&revision.id)).await?;
    decode(crypto, kind, bytes)
}

fn decode(
    crypto: &CryptoPipeline,
    kind: FileKind,
    bytes: Vec<u8>,
) -> Result<Resolved, ResolveError> {
    let content = if kind.is_plain() {
        bytes
    } else {
        crypto.open(&bytes)?
    };
    Ok(Resolved {
        kind,
        content: Some(content),
    })
}

#[derive(Debug, Error)]
#[error("can't parse {spec:?} as a duration like 2h45m or an absolute time like 2024-03-05T12:30")]
pub struct TimeSpecError {
    spec: String,
}

/// Parses the `--at` argument into a canonical timestamp string. Accepts a
/// relative duration (`45m`, `2h45m`, `3d`) subtracted from `now`, or an
/// absolute prefix of the timestamp format, padded out to full precision.
pub fn parse_time_spec(spec: &str, now: OffsetDateTime) -> Result<String, TimeSpecError> {
    let error = || TimeSpecError {
        spec: spec.to_string(),
    };
    if let Some(ago) = parse_duration_spec(spec) {
        return (now - ago).format(MODIFIED_FORMAT).map_err(|_| error());
    }
    let mut padded = spec.to_string();
    loop {
        padded = match padded.len() {
            4 | 7 => format!("{padded}-01"),
            10 => format!("{padded}T00"),
            13 | 16 => format!("{padded}:00"),
            19 => format!("{padded}.000"),
            23 => format!("{padded}Z"),
            24 => break,
            _ => return Err(error()),
        };
    }
    let parsed = PrimitiveDateTime::parse(&padded, MODIFIED_FORMAT).map_err(|_| error())?;
    parsed
        .assume_utc()
        .format(MODIFIED_FORMAT)
        .map_err(|_| error())
}

fn parse_duration_spec(spec: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut any_unit = false;
    for ch in spec.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        let unit = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            'w' => 7 * 86400,
            _ => return None,
        };
        total += Duration::seconds(value * unit);
        any_unit = true;
    }
    if !digits.is_empty() || !any_unit {
        return None;
    }
    Some(total)
}

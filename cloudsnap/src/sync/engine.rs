//! The reconciliation engine: makes the remote archive mirror local disk.
//!
//! One engine instance owns the metadata cache and the store client; the
//! coordinator is its only caller, so all state stays single-threaded.
//! `reconcile` is idempotent and tolerant of stale candidates: it re-checks
//! the filesystem and the cache itself and does nothing when the archive
//! already matches.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudsnap_core::{ObjectPatch, StoreClient, StoreError};
use thiserror::Error;

use crate::alert;
use crate::config::Config;

use super::crypto::{CryptoError, CryptoPipeline};
use super::glob::match_glob;
use super::record::{
    FileKind, FileRecord, MetadataCache, composite_name, content_hash_hex, format_modified,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
    #[error("crypto pipeline failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("couldn't format timestamp: {0}")]
    Time(#[from] time::error::Format),
    #[error("remote record {name} has unrecognized content type {tag}")]
    UnknownTag { name: String, tag: String },
}

pub struct SyncEngine {
    config: Arc<Config>,
    store: StoreClient,
    crypto: CryptoPipeline,
    cache: MetadataCache,
}

impl SyncEngine {
    pub fn new(config: Arc<Config>, store: StoreClient, crypto: CryptoPipeline) -> Self {
        Self {
            config,
            store,
            crypto,
            cache: MetadataCache::default(),
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StoreClient {
        &mut self.store
    }

    pub fn crypto(&self) -> &CryptoPipeline {
        &self.crypto
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    #[cfg(test)]
    pub fn cache_mut(&mut self) -> &mut MetadataCache {
        &mut self.cache
    }

    /// Rebuilds the metadata cache from a full remote listing. An
    /// unrecognized content type means the archive holds records this
    /// build can't interpret, which is fatal rather than skippable.
    pub async fn refresh_cache(&mut self) -> Result<(), EngineError> {
        let objects = self
            .store
            .list_objects(&self.config.store_parent, &self.config.profile)
            .await?;
        let mut records = Vec::with_capacity(objects.len());
        for meta in &objects {
            let record = FileRecord::from_meta(meta).map_err(|err| EngineError::UnknownTag {
                name: err.name,
                tag: err.tag,
            })?;
            records.push(record);
        }
        self.cache = MetadataCache::from_records(records);
        Ok(())
    }

    /// Brings the archive up to date for one path. Directories queue their
    /// entries, vanished directories queue every cached path beneath them;
    /// the worklist keeps the recursion off the call stack.
    pub async fn reconcile(&mut self, abs_path: &Path) -> Result<(), EngineError> {
        let mut pending = VecDeque::new();
        pending.push_back(abs_path.to_path_buf());
        while let Some(path) = pending.pop_front() {
            self.reconcile_one(&path, &mut pending).await?;
        }
        Ok(())
    }

    async fn reconcile_one(
        &mut self,
        abs: &Path,
        pending: &mut VecDeque<PathBuf>,
    ) -> Result<(), EngineError> {
        let Ok(rel) = abs.strip_prefix(&self.config.root) else {
            eprintln!(
                "[cloudsnap] skipping {}: outside {}",
                abs.display(),
                self.config.root.display()
            );
            return Ok(());
        };
        let rel = rel.to_string_lossy().into_owned();

        let ignored = self.is_ignored(&rel);
        let record = self.cache.get(&rel).cloned();
        if ignored && record.as_ref().map_or(true, |r| r.trashed) {
            return Ok(());
        }
        if let Some(record) = &record {
            if record.id.is_empty() {
                // Raced a concurrent writer during this cycle's listing;
                // the next full relist sees the settled record.
                return Ok(());
            }
        }

        match std::fs::symlink_metadata(abs) {
            Err(_) => match record {
                Some(record) if !record.trashed => self.write_tombstone(&rel, &record).await,
                _ => {
                    // Unstattable with no live record of its own: most
                    // likely a directory that vanished. Directories have no
                    // records, so cascade to every cached path beneath it.
                    for path in self.cache.paths_under(&rel) {
                        pending.push_back(self.config.root.join(path));
                    }
                    Ok(())
                }
            },
            Ok(_) if ignored => match record {
                // The early return above covered trashed and absent records.
                Some(record) => self.write_tombstone(&rel, &record).await,
                None => Ok(()),
            },
            Ok(meta) if meta.is_dir() => {
                self.queue_directory(abs, pending);
                Ok(())
            }
            Ok(meta) => self.reconcile_file(&rel, abs, &meta, record.as_ref()).await,
        }
    }

    async fn reconcile_file(
        &mut self,
        rel: &str,
        abs: &Path,
        meta: &std::fs::Metadata,
        record: Option<&FileRecord>,
    ) -> Result<(), EngineError> {
        let Ok(mtime) = meta.modified() else {
            self.warn(format!("skipping {rel}: no modification time"));
            return Ok(());
        };
        let modified = format_modified(mtime)?;
        if let Some(record) = record {
            if !record.trashed && modified == record.modified_time {
                return Ok(());
            }
        }

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = match std::fs::read_link(abs) {
                Ok(target) => target,
                Err(err) => {
                    self.warn(format!("skipping {rel}: couldn't read symlink: {err}"));
                    return Ok(());
                }
            };
            let Some(target) = target.to_str() else {
                self.warn(format!("skipping {rel}: symlink target is not valid UTF-8"));
                return Ok(());
            };
            let content = target.as_bytes().to_vec();
            return self
                .write_object(rel, record, FileKind::Symlink, false, Some(modified), "", content)
                .await;
        }
        if !file_type.is_file() {
            eprintln!("[cloudsnap] skipping {rel}: not a regular file");
            return Ok(());
        }
        if meta.len() > self.config.size_limit_bytes {
            self.warn(format!(
                "skipping {rel}: too big ({} MB); raise CLOUDSNAP_SIZE_LIMIT_MB or ignore it",
                meta.len() / 1_000_000
            ));
            return Ok(());
        }

        let plaintext = match std::fs::read(abs) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.warn(format!("couldn't read {rel}: {err}"));
                return Ok(());
            }
        };
        let hash = content_hash_hex(&plaintext);
        let sealed = self.crypto.seal(&plaintext)?;
        if let Some(record) = record {
            // Matching ciphertext length and plaintext hash means the bytes
            // never changed, just the mtime. Leave the archive alone.
            if !record.trashed
                && sealed.len() as u64 == record.size_bytes
                && hash == record.hash_hex()
            {
                return Ok(());
            }
        }
        let mode = permissions_mode(meta);
        self.write_object(
            rel,
            record,
            FileKind::Regular { mode },
            false,
            Some(modified),
            &hash,
            sealed,
        )
        .await
    }

    /// Tombstones keep the revision history reachable: empty content, the
    /// hash suffix dropped from the name, trashed set.
    async fn write_tombstone(&mut self, rel: &str, existing: &FileRecord) -> Result<(), EngineError> {
        self.write_object(rel, Some(existing), FileKind::Deleted, true, None, "", Vec::new())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_object(
        &mut self,
        rel: &str,
        existing: Option<&FileRecord>,
        kind: FileKind,
        trashed: bool,
        modified: Option<String>,
        hash: &str,
        content: Vec<u8>,
    ) -> Result<(), EngineError> {
        let name = composite_name(rel, hash);
        let patch = ObjectPatch {
            name: name.clone(),
            parent: existing
                .is_none()
                .then(|| self.config.store_parent.clone()),
            profile: existing.is_none().then(|| self.config.profile.clone()),
            trashed: existing.is_some().then_some(trashed),
            modified_time: if trashed { None } else { modified.clone() },
            content_type: kind.to_tag(),
        };
        let size_bytes = content.len() as u64;
        let id = self
            .store
            .upload(existing.map(|record| record.id.as_str()), &patch, &content)
            .await?;
        let modified_time = modified
            .or_else(|| existing.map(|record| record.modified_time.clone()))
            .unwrap_or_default();
        self.cache.insert(FileRecord {
            composite_name: name,
            id,
            size_bytes,
            trashed,
            kind,
            modified_time,
        });
        if trashed {
            eprintln!("[cloudsnap] {rel} trashed.");
        } else if existing.is_some() {
            eprintln!("[cloudsnap] {rel} updated.");
        } else {
            eprintln!("[cloudsnap] {rel} created.");
        }
        Ok(())
    }

    fn queue_directory(&mut self, abs: &Path, pending: &mut VecDeque<PathBuf>) {
        let mut dirs = vec![abs.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    self.warn(format!("can't walk {}: {err}", dir.display()));
                    continue;
                }
            };
            for entry in entries {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                match entry.file_type() {
                    Ok(file_type) if file_type.is_dir() => dirs.push(path),
                    Ok(_) => pending.push_back(path),
                    Err(err) => {
                        eprintln!("[cloudsnap] can't inspect {}: {err}", path.display());
                    }
                }
            }
        }
    }

    fn is_ignored(&self, rel: &str) -> bool {
        self.config
            .ignore
            .iter()
            .any(|glob| match_glob(glob, rel))
    }

    fn warn(&self, message: String) {
        eprintln!("[cloudsnap] warning: {message}");
        alert::alert(&self.config.warn_command);
    }
}

#[cfg(unix)]
fn permissions_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permissions_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

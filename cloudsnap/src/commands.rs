//! One-shot subcommands operating on the archive: inspect, compare,
//! restore, force a backup, and the initial OAuth bootstrap.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;

use crate::config::Config;
use crate::sync::crypto::CryptoPipeline;
use crate::sync::engine::SyncEngine;
use crate::sync::glob::match_glob;
use crate::sync::record::{FileKind, FileRecord, MetadataCache, format_modified};
use crate::sync::timetravel::{Resolved, resolve_at};
use crate::token_provider::TokenProvider;

const OAUTH_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const OAUTH_SCOPE: &str = "store.objects";

/// Builds an engine with a fresh access token and a populated cache.
async fn open_engine(config: &Arc<Config>) -> anyhow::Result<SyncEngine> {
    let refresh_token = config
        .refresh_token
        .clone()
        .context("CLOUDSNAP_REFRESH_TOKEN is not set; run `cloudsnap auth` first")?;
    let mut tokens = TokenProvider::new(config.oauth_client()?, refresh_token);
    let access_token = tokens.valid_access_token().await?;
    let store = config.store_client(access_token)?;
    let crypto = CryptoPipeline::new(&config.passphrase)?;
    let mut engine = SyncEngine::new(config.clone(), store, crypto);
    engine.refresh_cache().await?;
    Ok(engine)
}

/// Prefixes relative globs with the current directory's position under the
/// root, so `cloudsnap cat notes.txt` works from any subdirectory. A glob
/// starting with `/` addresses the root directly.
fn full_globs(root: &Path, args: &[String]) -> Vec<String> {
    let prefix = std::env::current_dir()
        .ok()
        .and_then(|cwd| {
            cwd.strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    args.iter()
        .map(|arg| {
            if let Some(anchored) = arg.strip_prefix('/') {
                anchored.trim_start_matches('/').to_string()
            } else if prefix.is_empty() {
                arg.clone()
            } else {
                format!("{prefix}/{arg}")
            }
        })
        .collect()
}

/// All cached paths matching any glob, sorted. No globs selects everything.
fn select_paths(cache: &MetadataCache, globs: &[String]) -> Vec<String> {
    let mut selected: Vec<String> = cache
        .iter()
        .filter(|(rel, _)| globs.is_empty() || globs.iter().any(|glob| match_glob(glob, rel)))
        .map(|(rel, _)| rel.clone())
        .collect();
    selected.sort();
    selected
}

pub async fn cat(config: &Arc<Config>, at: Option<&str>, args: &[String]) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    let globs = full_globs(&config.root, args);
    for rel in select_paths(engine.cache(), &globs) {
        let Some(record) = engine.cache().get(&rel) else { continue };
        let resolved = resolve_at(engine.store(), engine.crypto(), record, at, None)
            .await
            .with_context(|| format!("couldn't resolve {rel}"))?;
        match resolved.kind {
            FileKind::Deleted => println!("{rel} is deleted."),
            FileKind::Symlink => println!(
                "{rel} is a symlink to {}.",
                String::from_utf8_lossy(&resolved.content.unwrap_or_default())
            ),
            FileKind::Regular { .. } => {
                std::io::stdout().write_all(&resolved.content.unwrap_or_default())?;
            }
        }
    }
    Ok(())
}

pub async fn list(config: &Arc<Config>, args: &[String]) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    let globs = full_globs(&config.root, args);
    for rel in select_paths(engine.cache(), &globs) {
        let Some(record) = engine.cache().get(&rel) else { continue };
        println!(
            "{rel}: {} bytes, {}, modified {}{}",
            record.size_bytes,
            record.kind.to_tag(),
            record.modified_time,
            if record.trashed { ", trashed" } else { "" }
        );
        let revisions = engine.store().list_revisions(&record.id).await?;
        for revision in revisions {
            println!(
                "  revision {}: {}, modified {}",
                revision.id, revision.content_type, revision.modified_time
            );
        }
    }
    Ok(())
}

pub async fn save(config: &Arc<Config>, args: &[String]) -> anyhow::Result<()> {
    anyhow::ensure!(!args.is_empty(), "save needs at least one path");
    let mut engine = open_engine(config).await?;
    for arg in args {
        let abs = std::path::absolute(arg)
            .with_context(|| format!("couldn't make {arg} absolute"))?;
        engine.reconcile(&abs).await?;
    }
    Ok(())
}

pub async fn restore(config: &Arc<Config>, at: Option<&str>, args: &[String]) -> anyhow::Result<()> {
    anyhow::ensure!(
        !args.is_empty(),
        "restore overwrites local files; name what to restore explicitly"
    );
    let engine = open_engine(config).await?;
    let globs = full_globs(&config.root, args);
    for rel in select_paths(engine.cache(), &globs) {
        let Some(record) = engine.cache().get(&rel) else { continue };
        let resolved = resolve_at(engine.store(), engine.crypto(), record, at, None)
            .await
            .with_context(|| format!("couldn't resolve {rel}"))?;
        restore_one(&config.root, &rel, resolved)?;
    }
    Ok(())
}

fn restore_one(root: &Path, rel: &str, resolved: Resolved) -> anyhow::Result<()> {
    let full = root.join(rel);
    match resolved.kind {
        FileKind::Deleted => Ok(()),
        FileKind::Symlink => {
            let target = String::from_utf8_lossy(&resolved.content.unwrap_or_default()).into_owned();
            let _ = std::fs::remove_file(&full);
            ensure_parent(&full)?;
            symlink(&target, &full).with_context(|| format!("couldn't restore symlink {rel}"))?;
            println!("restored symlink {rel} -> {target}");
            Ok(())
        }
        FileKind::Regular { mode } => {
            let _ = std::fs::remove_file(&full);
            ensure_parent(&full)?;
            write_with_mode(&full, &resolved.content.unwrap_or_default(), mode)
                .with_context(|| format!("couldn't restore {rel}"))?;
            println!("restored {rel}");
            Ok(())
        }
    }
}

fn ensure_parent(full: &Path) -> anyhow::Result<()> {
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("couldn't create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &str, full: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, full)
}

#[cfg(not(unix))]
fn symlink(_target: &str, _full: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other("symlinks are unsupported here"))
}

fn write_with_mode(full: &Path, content: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(full)?;
    file.write_all(content)
}

pub async fn diff(config: &Arc<Config>, at: Option<&str>, args: &[String]) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    let globs = full_globs(&config.root, args);
    for rel in select_paths(engine.cache(), &globs) {
        let Some(record) = engine.cache().get(&rel) else { continue };
        diff_one(&engine, config, record, &rel, at).await?;
    }
    Ok(())
}

async fn diff_one(
    engine: &SyncEngine,
    config: &Arc<Config>,
    record: &FileRecord,
    rel: &str,
    at: Option<&str>,
) -> anyhow::Result<()> {
    let full = config.root.join(rel);
    let meta = match std::fs::symlink_metadata(&full) {
        Ok(meta) => meta,
        Err(err) => {
            // The path only lives in the archive; note that unless it is
            // gone on both sides.
            let resolved =
                resolve_at(engine.store(), engine.crypto(), record, at, Some(&record.modified_time))
                    .await?;
            if resolved.kind != FileKind::Deleted {
                println!("only in archive: {rel} ({err})");
            }
            return Ok(());
        }
    };
    let local_time = format_modified(meta.modified()?)?;
    let resolved =
        resolve_at(engine.store(), engine.crypto(), record, at, Some(&local_time)).await?;
    if resolved.kind == FileKind::Deleted {
        println!("only local: {rel} (trashed in the archive)");
        return Ok(());
    }
    // Identical timestamps: the skip elided the fetch, nothing to compare.
    let Some(archive_content) = resolved.content else {
        return Ok(());
    };

    let file_type = meta.file_type();
    match (&resolved.kind, file_type.is_symlink(), file_type.is_file()) {
        (FileKind::Symlink, true, _) => {
            let local_target = std::fs::read_link(&full)?;
            let archive_target = String::from_utf8_lossy(&archive_content).into_owned();
            if Path::new(&archive_target) != local_target {
                println!("symlink {rel} differs:");
                println!("- {archive_target}");
                println!("+ {}", local_target.display());
            }
            Ok(())
        }
        (FileKind::Regular { .. }, false, true) => {
            run_diff(rel, &archive_content, &full)
        }
        _ => {
            println!(
                "{rel}: archive has {}, local is {}",
                resolved.kind.to_tag(),
                if file_type.is_symlink() {
                    "a symlink"
                } else if file_type.is_file() {
                    "a regular file"
                } else {
                    "something else"
                }
            );
            Ok(())
        }
    }
}

/// Shells out to `diff -u`, feeding the archive version on stdin.
fn run_diff(rel: &str, archive_content: &[u8], full: &Path) -> anyhow::Result<()> {
    let mut child = std::process::Command::new("diff")
        .arg("-u")
        .arg(format!("--label=archive/{rel}"))
        .arg(format!("--label=current/{rel}"))
        .arg("-")
        .arg(full)
        .stdin(Stdio::piped())
        .spawn()
        .context("couldn't run diff; is it installed?")?;
    if let Some(mut stdin) = child.stdin.take() {
        // diff may exit early; a broken pipe here is fine.
        let _ = stdin.write_all(archive_content);
    }
    child.wait().context("diff didn't finish")?;
    Ok(())
}

pub async fn quota(config: &Arc<Config>) -> anyhow::Result<()> {
    let refresh_token = config
        .refresh_token
        .clone()
        .context("CLOUDSNAP_REFRESH_TOKEN is not set; run `cloudsnap auth` first")?;
    let mut tokens = TokenProvider::new(config.oauth_client()?, refresh_token);
    let store = config.store_client(tokens.valid_access_token().await?)?;
    let quota = store.get_quota().await?;
    println!("used:  {:>8} MB", mb(quota.used_bytes));
    println!("trash: {:>8} MB", mb(quota.trash_bytes));
    println!("free:  {:>8} MB", mb(quota.free_bytes()));
    println!("limit: {:>8} MB", mb(quota.limit_bytes));
    Ok(())
}

fn mb(bytes: u64) -> u64 {
    bytes.div_ceil(1_000_000)
}

pub async fn auth(config: &Arc<Config>) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.refresh_token.is_none(),
        "CLOUDSNAP_REFRESH_TOKEN is already set; unset it to authorize again"
    );
    let oauth = config.oauth_client()?;
    let url = oauth.authorize_url(OAUTH_REDIRECT_URI, OAUTH_SCOPE)?;
    println!("visit this url and authorize cloudsnap:");
    println!("{url}");
    println!("then paste the code here:");
    let mut code = String::new();
    std::io::stdin()
        .read_line(&mut code)
        .context("couldn't read the code")?;
    let token = oauth.exchange_code(code.trim(), OAUTH_REDIRECT_URI).await?;
    let refresh_token = token
        .refresh_token
        .context("the token response carried no refresh token")?;
    println!("add this to the environment (keep it secret):");
    println!("CLOUDSNAP_REFRESH_TOKEN={refresh_token}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::composite_name;

    fn cache_with(paths: &[&str]) -> MetadataCache {
        MetadataCache::from_records(
            paths
                .iter()
                .enumerate()
                .map(|(index, rel)| FileRecord {
                    composite_name: composite_name(rel, "ff"),
                    id: format!("obj-{index}"),
                    size_bytes: 1,
                    trashed: false,
                    kind: FileKind::Regular { mode: 0o644 },
                    modified_time: String::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn empty_globs_select_everything_sorted() {
        let cache = cache_with(&["b.txt", "a/x.txt", "a.txt"]);
        assert_eq!(select_paths(&cache, &[]), vec!["a.txt", "a/x.txt", "b.txt"]);
    }

    #[test]
    fn globs_select_matching_paths() {
        let cache = cache_with(&["docs/a.md", "docs/b.md", "src/main.rs"]);
        assert_eq!(
            select_paths(&cache, &["docs/*".to_string()]),
            vec!["docs/a.md", "docs/b.md"]
        );
        assert_eq!(
            select_paths(&cache, &["**.rs".to_string()]),
            vec!["src/main.rs"]
        );
    }

    #[test]
    fn leading_slash_anchors_at_the_root() {
        // cwd is not under this root, so relative args pass through as-is.
        let root = Path::new("/nonexistent-archive-root");
        let globs = full_globs(root, &["/docs/*".to_string(), "notes.txt".to_string()]);
        assert_eq!(globs, vec!["docs/*", "notes.txt"]);
    }
}

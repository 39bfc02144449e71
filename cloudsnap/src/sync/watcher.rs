//! Change source: initial recursive scan plus live filesystem watching.
//!
//! Watches are registered per directory (never following symlinks) and the
//! watch table grows as directories are created or moved in, shrinks when
//! they disappear. Candidate paths go onto a bounded queue consumed by the
//! coordinator; the queue is sized generously and overflow is fatal, because
//! a silently dropped event would be a silently missed backup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const EVENT_QUEUE_CAPACITY: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Removed,
    Modified,
    MovedFrom,
    MovedTo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch backend error: {0}")]
    Notify(#[from] notify::Error),
}

/// Keeps the background watch task (and with it the platform watcher) alive.
pub struct ChangeSource {
    _task: JoinHandle<()>,
}

/// Starts the scan-then-watch loop rooted at `root`. Every regular file and
/// symlink found by the initial scan, and every path named by a later
/// filesystem event, arrives on the returned receiver as a candidate for
/// reconciliation.
pub fn start_change_source(
    root: PathBuf,
) -> Result<(ChangeSource, mpsc::Receiver<PathBuf>), WatchError> {
    let (candidate_tx, candidate_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    // The notify callback runs on the platform watch thread; it only ever
    // hands raw events over and never blocks on the candidate queue.
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        if let Ok(event) = result {
            let _ = raw_tx.send(event);
        }
    })?;
    let task = tokio::spawn(watch_loop(root, watcher, raw_rx, candidate_tx));
    Ok((ChangeSource { _task: task }, candidate_rx))
}

async fn watch_loop(
    root: PathBuf,
    mut watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<Event>,
    candidates: mpsc::Sender<PathBuf>,
) {
    let mut watches: HashSet<PathBuf> = HashSet::new();
    register_tree(&root, &mut watcher, &mut watches, &candidates).await;
    eprintln!(
        "[cloudsnap] watching {} directories under {}",
        watches.len(),
        root.display()
    );

    while let Some(event) = raw_rx.recv().await {
        for change in map_event(event) {
            match change.kind {
                ChangeKind::Created | ChangeKind::MovedTo => {
                    if is_directory(&change.path) {
                        register_tree(&change.path, &mut watcher, &mut watches, &candidates).await;
                    }
                }
                ChangeKind::Removed | ChangeKind::MovedFrom => {
                    if watches.remove(&change.path) {
                        let _ = watcher.unwatch(&change.path);
                    }
                }
                ChangeKind::Modified => {}
            }
            if !forward(&candidates, change.path) {
                return;
            }
        }
    }
}

/// Walks `start` with an explicit stack, registering a watch on every
/// directory and emitting every non-directory entry as a candidate.
async fn register_tree(
    start: &Path,
    watcher: &mut RecommendedWatcher,
    watches: &mut HashSet<PathBuf>,
    candidates: &mpsc::Sender<PathBuf>,
) {
    let mut pending = vec![start.to_path_buf()];
    while let Some(dir) = pending.pop() {
        match watcher.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                watches.insert(dir.clone());
            }
            Err(err) => {
                // The directory may already be gone again; the next full
                // cycle relist covers whatever this scan misses.
                eprintln!("[cloudsnap] can't watch {}: {err}", dir.display());
                continue;
            }
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                eprintln!("[cloudsnap] can't scan {}: {err}", dir.display());
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            match entry.file_type() {
                // file_type never follows symlinks, so a symlink to a
                // directory is emitted as a file candidate, not watched.
                Ok(file_type) if file_type.is_dir() => pending.push(path),
                Ok(_) => {
                    // Backpressure during the initial scan is fine; the
                    // coordinator is already draining the queue.
                    if candidates.send(path).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    eprintln!("[cloudsnap] can't inspect {}: {err}", path.display())
                }
            }
        }
    }
}

fn forward(candidates: &mpsc::Sender<PathBuf>, path: PathBuf) -> bool {
    use tokio::sync::mpsc::error::TrySendError;
    match candidates.try_send(path) {
        Ok(()) => true,
        Err(TrySendError::Closed(_)) => false,
        Err(TrySendError::Full(path)) => {
            eprintln!(
                "[cloudsnap] fatal: change queue overflowed at {}; events would be lost",
                path.display()
            );
            std::process::exit(2);
        }
    }
}

fn is_directory(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

fn map_event(event: Event) -> Vec<Change> {
    let kinds: Vec<ChangeKind> = match event.kind {
        EventKind::Create(_) => vec![ChangeKind::Created; event.paths.len()],
        EventKind::Remove(_) => vec![ChangeKind::Removed; event.paths.len()],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            vec![ChangeKind::MovedFrom, ChangeKind::MovedTo]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![ChangeKind::MovedFrom; event.paths.len()]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![ChangeKind::MovedTo; event.paths.len()]
        }
        EventKind::Modify(_) => vec![ChangeKind::Modified; event.paths.len()],
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            vec![ChangeKind::Modified; event.paths.len()]
        }
        _ => Vec::new(),
    };
    event
        .paths
        .into_iter()
        .zip(kinds)
        .map(|(path, kind)| Change { path, kind })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn maps_close_write_to_modified() {
        let event = Event {
            kind: EventKind::Access(AccessKind::Close(AccessMode::Write)),
            paths: vec![PathBuf::from("/root/a.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(event),
            vec![Change {
                path: PathBuf::from("/root/a.txt"),
                kind: ChangeKind::Modified
            }]
        );
    }

    #[test]
    fn maps_rename_pair_to_moved_from_and_to() {
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/root/old"), PathBuf::from("/root/new")],
            attrs: Default::default(),
        };
        let mapped = map_event(event);
        assert_eq!(mapped[0].kind, ChangeKind::MovedFrom);
        assert_eq!(mapped[1].kind, ChangeKind::MovedTo);
    }

    #[test]
    fn ignores_plain_access_events() {
        let event = Event {
            kind: EventKind::Access(AccessKind::Read),
            paths: vec![PathBuf::from("/root/a.txt")],
            attrs: Default::default(),
        };
        assert!(map_event(event).is_empty());
    }

    #[tokio::test]
    async fn initial_scan_emits_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"b").unwrap();

        let (_source, mut rx) = start_change_source(dir.path().to_path_buf()).unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            let path = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("scan should emit promptly")
                .expect("channel open");
            seen.push(path);
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![dir.path().join("a.txt"), dir.path().join("sub/b.txt")]
        );
    }
}

//! The long-running watch mode: one coordinator task owns the engine and
//! serializes every store and cache access. The watcher is the only other
//! task, feeding candidate paths over a bounded channel.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};

use crate::alert;
use crate::config::Config;
use crate::sync::crypto::CryptoPipeline;
use crate::sync::engine::SyncEngine;
use crate::sync::watcher::start_change_source;
use crate::token_provider::TokenProvider;

/// Quiet period after the initial pass; reconciles keep touching mtimes and
/// the watcher echoes those back, so drain until things settle.
const SETTLE_QUIET: Duration = Duration::from_secs(3);

const LOW_QUOTA_BYTES: u64 = 4_000_000_000;

pub struct Coordinator {
    config: Arc<Config>,
    engine: SyncEngine,
    tokens: TokenProvider,
}

impl Coordinator {
    pub async fn bootstrap(config: Arc<Config>) -> anyhow::Result<Self> {
        let refresh_token = config
            .refresh_token
            .clone()
            .context("CLOUDSNAP_REFRESH_TOKEN is not set; run `cloudsnap auth` first")?;
        let mut tokens = TokenProvider::new(config.oauth_client()?, refresh_token);
        let access_token = tokens.valid_access_token().await?;
        let store = config.store_client(access_token)?;
        let crypto = CryptoPipeline::new(&config.passphrase)?;
        let engine = SyncEngine::new(config.clone(), store, crypto);
        Ok(Self {
            config,
            engine,
            tokens,
        })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        eprintln!(
            "[cloudsnap] watching {} as profile {:?}, cycle every {:?}",
            self.config.root.display(),
            self.config.profile,
            self.config.cycle
        );
        self.check_quota().await?;
        self.engine.refresh_cache().await?;
        eprintln!(
            "[cloudsnap] archive holds {} records; reconciling known paths",
            self.engine.cache().len()
        );

        // Catch changes made while the daemon was down: first everything the
        // archive knows about, then a full disk walk for brand new files.
        let known: Vec<String> = self
            .engine
            .cache()
            .iter()
            .filter(|(_, record)| !record.trashed)
            .map(|(rel, _)| rel.clone())
            .collect();
        for rel in known {
            self.engine.reconcile(&self.config.root.join(&rel)).await?;
        }
        let root = self.config.root.clone();
        self.engine.reconcile(&root).await?;

        let (_change_source, mut candidates) = start_change_source(root)?;
        // The watcher re-scans the tree on startup; reconcile those
        // candidates immediately so the main loop starts from a clean slate.
        loop {
            match tokio::time::timeout(SETTLE_QUIET, candidates.recv()).await {
                Ok(Some(path)) => self.engine.reconcile(&path).await?,
                Ok(None) => anyhow::bail!("change source stopped during startup"),
                Err(_) => break,
            }
        }
        eprintln!("[cloudsnap] initial pass done; entering the main loop");

        let mut run_now = signal(SignalKind::interrupt()).context("can't install SIGINT handler")?;
        let mut quit = signal(SignalKind::quit()).context("can't install SIGQUIT handler")?;
        let mut touched: HashSet<PathBuf> = HashSet::new();

        loop {
            let mut manual = false;
            {
                let tick = tokio::time::sleep(self.config.cycle);
                tokio::pin!(tick);
                loop {
                    tokio::select! {
                        received = candidates.recv() => {
                            match received {
                                Some(path) => { touched.insert(path); }
                                None => anyhow::bail!("change source stopped"),
                            }
                        }
                        _ = &mut tick => break,
                        _ = run_now.recv() => {
                            manual = true;
                            eprintln!(
                                "[cloudsnap] SIGINT: running a cycle now for {} paths (SIGQUIT quits)",
                                touched.len()
                            );
                            break;
                        }
                        _ = quit.recv() => {
                            eprintln!("[cloudsnap] SIGQUIT: shutting down between cycles");
                            return Ok(());
                        }
                    }
                }
            }

            if touched.is_empty() {
                continue;
            }
            // Listing and token refresh happen once per cycle, not per path.
            let access_token = self.tokens.valid_access_token().await?;
            self.engine.store_mut().set_token(access_token);
            self.check_quota().await?;
            self.engine.refresh_cache().await?;
            for path in std::mem::take(&mut touched) {
                self.engine.reconcile(&path).await?;
            }
            if manual {
                eprintln!("[cloudsnap] backup cycle done");
            }
        }
    }

    async fn check_quota(&self) -> anyhow::Result<()> {
        let quota = self.engine.store().get_quota().await?;
        if quota.free_bytes() < LOW_QUOTA_BYTES {
            eprintln!(
                "[cloudsnap] warning: store quota is low: {} MB free",
                quota.free_bytes() / 1_000_000
            );
            alert::alert(&self.config.warn_command);
        }
        Ok(())
    }
}

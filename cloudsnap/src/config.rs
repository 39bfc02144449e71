use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use cloudsnap_core::{OAuthClient, OAuthError, StoreClient, StoreError};

const DEFAULT_CYCLE_SECS: u64 = 1200;
const DEFAULT_SIZE_LIMIT_MB: u64 = 20;

/// Immutable configuration, read from the environment once at startup and
/// passed explicitly to everything that needs it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Local root directory that gets backed up.
    pub root: PathBuf,
    /// Id of the remote collection the records live under.
    pub store_parent: String,
    /// Tag separating this host's records from other hosts sharing the store.
    pub profile: String,
    /// Ignore globs, matched against logical relative paths.
    pub ignore: Vec<String>,
    pub size_limit_bytes: u64,
    pub passphrase: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: Option<String>,
    pub cycle: Duration,
    /// Operator alert command; empty disables the hook.
    pub warn_command: Vec<String>,
    pub store_url: Option<String>,
    pub auth_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir();
        let root = match std::env::var("CLOUDSNAP_DIR") {
            Ok(value) => expand_with_home(&value, home.as_deref()),
            Err(_) => std::env::current_dir()
                .context("can't determine the working directory; set CLOUDSNAP_DIR")?,
        };
        let store_parent = std::env::var("CLOUDSNAP_PARENT")
            .context("CLOUDSNAP_PARENT is not set (the store collection to back up into)")?;
        let profile = std::env::var("CLOUDSNAP_PROFILE").unwrap_or_else(|_| hostname());
        let ignore = std::env::var("CLOUDSNAP_IGNORE")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|glob| !glob.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let size_limit_bytes =
            read_u64_env("CLOUDSNAP_SIZE_LIMIT_MB", DEFAULT_SIZE_LIMIT_MB) * 1_000_000;
        let passphrase = std::env::var("CLOUDSNAP_PASSWORD").unwrap_or_default();
        let client_id =
            std::env::var("CLOUDSNAP_CLIENT_ID").context("CLOUDSNAP_CLIENT_ID is not set")?;
        let client_secret = std::env::var("CLOUDSNAP_CLIENT_SECRET")
            .context("CLOUDSNAP_CLIENT_SECRET is not set")?;
        let refresh_token = std::env::var("CLOUDSNAP_REFRESH_TOKEN").ok();
        let cycle = Duration::from_secs(read_u64_env("CLOUDSNAP_CYCLE_SECS", DEFAULT_CYCLE_SECS));
        let warn_command = std::env::var("CLOUDSNAP_WARN_CMD")
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            root,
            store_parent,
            profile,
            ignore,
            size_limit_bytes,
            passphrase,
            client_id,
            client_secret,
            refresh_token,
            cycle,
            warn_command,
            store_url: std::env::var("CLOUDSNAP_STORE_URL").ok(),
            auth_url: std::env::var("CLOUDSNAP_AUTH_URL").ok(),
        })
    }

    pub fn oauth_client(&self) -> Result<OAuthClient, OAuthError> {
        match &self.auth_url {
            Some(url) => OAuthClient::with_base_url(url, &self.client_id, &self.client_secret),
            None => OAuthClient::new(&self.client_id, &self.client_secret),
        }
    }

    pub fn store_client(&self, token: String) -> Result<StoreClient, StoreError> {
        match &self.store_url {
            Some(url) => StoreClient::with_base_url(url, token),
            None => StoreClient::new(token),
        }
    }
}

fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    if let Some(home) = home {
        if value == "~" {
            return home.to_path_buf();
        }
        if let Some(rest) = value.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_home_prefix() {
        let home = PathBuf::from("/home/user");
        assert_eq!(
            expand_with_home("~/backups", Some(&home)),
            PathBuf::from("/home/user/backups")
        );
        assert_eq!(expand_with_home("~", Some(&home)), home);
        assert_eq!(
            expand_with_home("/abs/path", Some(&home)),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            expand_with_home("~/x", None),
            PathBuf::from("~/x"),
        );
    }
}

use std::time::{Duration, Instant};

use cloudsnap_core::{OAuthClient, OAuthError};
use thiserror::Error;

/// Access tokens usually live for an hour; treat them as stale a bit before
/// that so a token handed to the store client survives a whole cycle.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access token refresh failed: {0}")]
    OAuth(#[from] OAuthError),
}

/// Exchanges the long-lived refresh token for short-lived access tokens,
/// caching the current one until it goes stale.
pub struct TokenProvider {
    oauth: OAuthClient,
    refresh_token: String,
    access_token: Option<String>,
    acquired_at: Option<Instant>,
    freshness: Duration,
}

impl TokenProvider {
    pub fn new(oauth: OAuthClient, refresh_token: String) -> Self {
        Self {
            oauth,
            refresh_token,
            access_token: None,
            acquired_at: None,
            freshness: FRESHNESS_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Returns the cached access token, refreshing it first when it is
    /// missing or older than the freshness window.
    pub async fn valid_access_token(&mut self) -> Result<String, TokenError> {
        if let (Some(token), Some(acquired_at)) = (&self.access_token, self.acquired_at) {
            if acquired_at.elapsed() < self.freshness {
                return Ok(token.clone());
            }
        }
        let token = self.oauth.refresh_token(&self.refresh_token).await?;
        self.acquired_at = Some(Instant::now());
        self.access_token = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

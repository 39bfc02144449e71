mod client;
mod oauth;

pub use client::{
    ListPage, ObjectMeta, ObjectPatch, QuotaInfo, RESUMABLE_THRESHOLD, RevisionMeta, StoreClient,
    StoreError,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};

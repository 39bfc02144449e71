use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://store.cloudsnap.dev";
const PAGE_SIZE: u32 = 1000;
const MULTIPART_BOUNDARY: &str = "cloudsnap-2f8a61c4";

/// Content at or above this size is uploaded with the two-phase resumable
/// protocol; anything smaller goes out as a single multipart request.
pub const RESUMABLE_THRESHOLD: usize = 5_000_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("couldn't encode object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("store returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("resumable upload start response is missing a location header")]
    MissingUploadLocation,
}

/// Client for the versioned object store.
///
/// Every object lives under a parent collection, tagged with a profile so
/// several hosts can share one store root. The store keeps a bounded number
/// of revisions per object; `get_content` can address any of them.
#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl StoreClient {
    pub fn new(token: impl Into<String>) -> Result<Self, StoreError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Replaces the bearer token. Access tokens expire; the owner refreshes
    /// them between cycles and swaps the new one in here.
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    pub async fn list_page(
        &self,
        parent: &str,
        profile: &str,
        page_token: Option<&str>,
    ) -> Result<ListPage, StoreError> {
        let mut url = self.endpoint("/v1/objects")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("parent", parent);
            query.append_pair("profile", profile);
            query.append_pair("pageSize", &PAGE_SIZE.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists the whole head state of a parent/profile pair, following
    /// pagination tokens until the store reports no further page.
    pub async fn list_objects(
        &self,
        parent: &str,
        profile: &str,
    ) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self
                .list_page(parent, profile, page_token.as_deref())
                .await?;
            objects.extend(page.objects);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(objects)
    }

    /// Creates (no id) or updates (id given) an object together with its
    /// content. The upload strategy is selected purely by content size.
    pub async fn upload(
        &self,
        existing_id: Option<&str>,
        meta: &ObjectPatch,
        content: &[u8],
    ) -> Result<String, StoreError> {
        if content.len() >= RESUMABLE_THRESHOLD {
            self.upload_resumable(existing_id, meta, content).await
        } else {
            self.upload_multipart(existing_id, meta, content).await
        }
    }

    async fn upload_multipart(
        &self,
        existing_id: Option<&str>,
        meta: &ObjectPatch,
        content: &[u8],
    ) -> Result<String, StoreError> {
        let mut url = self.object_url(existing_id)?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");
        let metadata = serde_json::to_vec(meta)?;
        let body = multipart_related(&metadata, &meta.content_type, content);
        let request = match existing_id {
            Some(_) => self.http.patch(url),
            None => self.http.post(url),
        };
        let response = request
            .header(AUTHORIZATION, self.auth_header_value())
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await?;
        let created: CreatedObject = Self::handle_response(response).await?;
        Ok(created.id)
    }

    async fn upload_resumable(
        &self,
        existing_id: Option<&str>,
        meta: &ObjectPatch,
        content: &[u8],
    ) -> Result<String, StoreError> {
        let mut url = self.object_url(existing_id)?;
        url.query_pairs_mut().append_pair("uploadType", "resumable");
        let request = match existing_id {
            Some(_) => self.http.patch(url),
            None => self.http.post(url),
        };
        let start = request
            .header(AUTHORIZATION, self.auth_header_value())
            .header("X-Upload-Content-Type", &meta.content_type)
            .header("X-Upload-Content-Length", content.len().to_string())
            .json(meta)
            .send()
            .await?;
        if !start.status().is_success() {
            let status = start.status();
            let body = start.text().await.unwrap_or_default();
            return Err(StoreError::Api { status, body });
        }
        let location = start
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(StoreError::MissingUploadLocation)?
            .to_string();

        let response = self
            .http
            .put(Url::parse(&location)?)
            .header(AUTHORIZATION, self.auth_header_value())
            .header(CONTENT_TYPE, &meta.content_type)
            .body(content.to_vec())
            .send()
            .await?;
        let created: CreatedObject = Self::handle_response(response).await?;
        Ok(created.id)
    }

    pub async fn list_revisions(&self, id: &str) -> Result<Vec<RevisionMeta>, StoreError> {
        let url = self.endpoint(&format!("/v1/objects/{id}/revisions"))?;
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        let payload: RevisionsResponse = Self::handle_response(response).await?;
        Ok(payload.revisions)
    }

    /// Fetches the head content, or a specific revision's content when
    /// `revision` is given.
    pub async fn get_content(
        &self,
        id: &str,
        revision: Option<&str>,
    ) -> Result<Vec<u8>, StoreError> {
        let mut url = self.endpoint(&format!("/v1/objects/{id}/content"))?;
        if let Some(revision) = revision {
            url.query_pairs_mut().append_pair("revision", revision);
        }
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn get_quota(&self) -> Result<QuotaInfo, StoreError> {
        let url = self.endpoint("/v1/quota")?;
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn object_url(&self, existing_id: Option<&str>) -> Result<Url, StoreError> {
        match existing_id {
            Some(id) => self.endpoint(&format!("/v1/objects/{id}")),
            None => self.endpoint("/v1/objects"),
        }
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Api { status, body })
        }
    }
}

fn multipart_related(metadata: &[u8], content_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

/// Head-state record of one stored object. `name` is the composite
/// path-plus-content-hash identifier; `content_type` carries the out-of-band
/// file metadata tag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub trashed: bool,
    pub content_type: String,
    #[serde(default)]
    pub modified_time: String,
}

/// Metadata part of a create or update request. `parent` and `profile` are
/// only set on create; `trashed` only on update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPatch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    pub content_type: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionMeta {
    pub id: String,
    pub content_type: String,
    pub modified_time: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    #[serde(default)]
    pub objects: Vec<ObjectMeta>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionsResponse {
    #[serde(default)]
    revisions: Vec<RevisionMeta>,
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaInfo {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    #[serde(default)]
    pub trash_bytes: u64,
}

impl QuotaInfo {
    pub fn free_bytes(&self) -> u64 {
        self.limit_bytes.saturating_sub(self.used_bytes)
    }
}

//! Azure Blob storage backend
//!
//! Talks to the Blob service REST API directly with `reqwest`, signing each
//! request with the account's Shared Key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode, Url};
use tracing::{debug, trace};

use crate::error::{DyskError, Result};
use crate::store::auth::SharedKeyCredential;
use crate::store::{
    BlobProperties, BlobRef, BlobStore, BlobType, ByteRange, LeaseDuration, LeaseState,
    StoreConnector,
};

/// REST API version sent with every request
pub const API_VERSION: &str = "2017-04-17";

/// DNS suffix of the public cloud blob endpoint
pub const DEFAULT_DOMAIN: &str = "blob.core.windows.net";

const META_PREFIX: &str = "x-ms-meta-";

/// Blob store for one storage account
pub struct AzureBlobStore {
    client: Client,
    credential: SharedKeyCredential,
    endpoint: Url,
}

impl AzureBlobStore {
    /// Store for `https://<account>.<domain>/`
    pub fn new(account: &str, key: &str, domain: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(&format!("https://{}.{}/", account, domain))
            .map_err(|e| DyskError::Config(format!("Invalid storage endpoint: {}", e)))?;
        Self::with_endpoint(endpoint, account, key, timeout)
    }

    /// Store for an explicit endpoint, e.g. a local emulator
    pub fn with_endpoint(endpoint: Url, account: &str, key: &str, timeout: Duration) -> Result<Self> {
        let credential = SharedKeyCredential::new(account, key)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DyskError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credential,
            endpoint,
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))
            .map_err(|e| DyskError::Backend(format!("Invalid request url for {}: {}", path, e)))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn blob_url(&self, blob: &BlobRef, query: &[(&str, &str)]) -> Result<Url> {
        self.url(&blob.path(), query)
    }

    fn container_url(&self, container: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut all = vec![("restype", "container")];
        all.extend_from_slice(query);
        self.url(container, &all)
    }

    /// Sign and send a request; non-success statuses are returned as-is
    async fn send(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert("x-ms-date", header_value(&date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        let content_length = body.as_ref().map(|b| b.len()).unwrap_or(0);
        if method == Method::PUT || content_length > 0 {
            headers.insert(
                reqwest::header::CONTENT_LENGTH,
                header_value(&content_length.to_string())?,
            );
        }

        let authorization = self.credential.authorization(&method, &url, &headers)?;
        headers.insert(reqwest::header::AUTHORIZATION, header_value(&authorization)?);

        trace!(method = %method, path = url.path(), query = ?url.query(), "blob request");

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }

    async fn send_checked(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
        what: &str,
    ) -> Result<Response> {
        let response = self.send(method, url, headers, body).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response.status(), response.headers(), what))
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DyskError::Backend(format!("Invalid header value: {}", e)))
}

fn lease_headers(lease_id: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(lease_id) = lease_id.filter(|l| !l.is_empty()) {
        headers.insert("x-ms-lease-id", header_value(lease_id)?);
    }
    Ok(headers)
}

fn range_value(range: ByteRange) -> String {
    format!("bytes={}-{}", range.start, range.end)
}

/// Map a failed response to an error using the status and `x-ms-error-code`
pub fn status_error(status: StatusCode, headers: &HeaderMap, what: &str) -> DyskError {
    let code = headers
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let detail = if code.is_empty() {
        format!("{} ({})", what, status)
    } else {
        format!("{} ({} {})", what, status, code)
    };

    match (status, code) {
        (StatusCode::NOT_FOUND, _) => DyskError::NotFound(detail),
        (StatusCode::CONFLICT, "LeaseAlreadyPresent") => DyskError::LeaseAlreadyPresent(detail),
        (StatusCode::PRECONDITION_FAILED, _) => DyskError::LeaseMismatch(detail),
        (StatusCode::CONFLICT, c) if c.starts_with("LeaseIdMismatch") || c == "LeaseLost" => {
            DyskError::LeaseMismatch(detail)
        }
        _ => DyskError::Backend(detail),
    }
}

/// Blob properties from the headers of a HEAD response
pub fn properties_from_headers(headers: &HeaderMap) -> Result<BlobProperties> {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let content_length = get("content-length")
        .unwrap_or("0")
        .parse::<u64>()
        .map_err(|e| DyskError::Backend(format!("Invalid content-length: {}", e)))?;

    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect();

    Ok(BlobProperties {
        content_length,
        blob_type: get("x-ms-blob-type").and_then(BlobType::parse),
        lease_state: get("x-ms-lease-state")
            .map(LeaseState::parse)
            .unwrap_or_default(),
        metadata,
    })
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn account(&self) -> &str {
        self.credential.account()
    }

    async fn create_container_if_absent(&self, container: &str) -> Result<bool> {
        let url = self.container_url(container, &[])?;
        let response = self.send(Method::PUT, url, HeaderMap::new(), None).await?;
        match response.status() {
            s if s.is_success() => {
                debug!(container, "created container");
                Ok(true)
            }
            StatusCode::CONFLICT => Ok(false),
            s => Err(status_error(
                s,
                response.headers(),
                &format!("create container {}", container),
            )),
        }
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        let url = self.container_url(container, &[])?;
        let response = self.send(Method::HEAD, url, HeaderMap::new(), None).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(
                s,
                response.headers(),
                &format!("get container {}", container),
            )),
        }
    }

    async fn blob_exists(&self, blob: &BlobRef) -> Result<bool> {
        let url = self.blob_url(blob, &[])?;
        let response = self.send(Method::HEAD, url, HeaderMap::new(), None).await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(status_error(s, response.headers(), &format!("get blob {}", blob))),
        }
    }

    async fn create_page_blob(&self, blob: &BlobRef, size: u64) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-blob-type", HeaderValue::from_static("PageBlob"));
        headers.insert("x-ms-blob-content-length", header_value(&size.to_string())?);

        let url = self.blob_url(blob, &[])?;
        self.send_checked(Method::PUT, url, headers, None, &format!("create page blob {}", blob))
            .await?;
        debug!(blob = %blob, size, "created page blob");
        Ok(())
    }

    async fn write_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        data: Bytes,
        lease_id: Option<&str>,
    ) -> Result<()> {
        if data.len() as u64 != range.len() {
            return Err(DyskError::Backend(format!(
                "write of {} bytes does not fill range {}",
                data.len(),
                range_value(range)
            )));
        }

        let mut headers = lease_headers(lease_id)?;
        headers.insert("x-ms-page-write", HeaderValue::from_static("update"));
        headers.insert("x-ms-range", header_value(&range_value(range))?);

        let url = self.blob_url(blob, &[("comp", "page")])?;
        self.send_checked(
            Method::PUT,
            url,
            headers,
            Some(data),
            &format!("write pages of {}", blob),
        )
        .await?;
        Ok(())
    }

    async fn read_range(
        &self,
        blob: &BlobRef,
        range: ByteRange,
        lease_id: Option<&str>,
    ) -> Result<Bytes> {
        let mut headers = lease_headers(lease_id)?;
        headers.insert("x-ms-range", header_value(&range_value(range))?);

        let url = self.blob_url(blob, &[])?;
        let response = self
            .send_checked(Method::GET, url, headers, None, &format!("read {}", blob))
            .await?;
        Ok(response.bytes().await?)
    }

    async fn properties(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<BlobProperties> {
        let url = self.blob_url(blob, &[])?;
        let response = self
            .send_checked(
                Method::HEAD,
                url,
                lease_headers(lease_id)?,
                None,
                &format!("get properties of {}", blob),
            )
            .await?;
        properties_from_headers(response.headers())
    }

    async fn set_metadata(
        &self,
        blob: &BlobRef,
        metadata: &BTreeMap<String, String>,
        lease_id: Option<&str>,
    ) -> Result<()> {
        let mut headers = lease_headers(lease_id)?;
        for (key, value) in metadata {
            let name = HeaderName::from_bytes(format!("{}{}", META_PREFIX, key).as_bytes())
                .map_err(|e| DyskError::Backend(format!("Invalid metadata key {}: {}", key, e)))?;
            headers.insert(name, header_value(value)?);
        }

        let url = self.blob_url(blob, &[("comp", "metadata")])?;
        self.send_checked(
            Method::PUT,
            url,
            headers,
            None,
            &format!("set metadata of {}", blob),
        )
        .await?;
        Ok(())
    }

    async fn acquire_lease(&self, blob: &BlobRef, duration: LeaseDuration) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-lease-action", HeaderValue::from_static("acquire"));
        headers.insert("x-ms-lease-duration", header_value(&duration.header_value())?);

        let url = self.blob_url(blob, &[("comp", "lease")])?;
        let response = self
            .send_checked(
                Method::PUT,
                url,
                headers,
                None,
                &format!("acquire lease on {}", blob),
            )
            .await?;

        response
            .headers()
            .get("x-ms-lease-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                DyskError::Backend(format!("acquire lease on {}: no lease id returned", blob))
            })
    }

    async fn break_lease(&self, blob: &BlobRef, break_period_secs: u32) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-lease-action", HeaderValue::from_static("break"));
        headers.insert(
            "x-ms-lease-break-period",
            header_value(&break_period_secs.to_string())?,
        );

        let url = self.blob_url(blob, &[("comp", "lease")])?;
        self.send_checked(
            Method::PUT,
            url,
            headers,
            None,
            &format!("break lease on {}", blob),
        )
        .await?;
        Ok(())
    }

    async fn delete_blob(&self, blob: &BlobRef, lease_id: Option<&str>) -> Result<()> {
        let url = self.blob_url(blob, &[])?;
        self.send_checked(
            Method::DELETE,
            url,
            lease_headers(lease_id)?,
            None,
            &format!("delete {}", blob),
        )
        .await?;
        debug!(blob = %blob, "deleted blob");
        Ok(())
    }
}

/// Connects to storage accounts under a DNS suffix
#[derive(Debug, Clone)]
pub struct AzureConnector {
    domain: String,
    timeout: Duration,
}

impl AzureConnector {
    pub fn new(domain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            domain: domain.into(),
            timeout,
        }
    }
}

impl Default for AzureConnector {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN, Duration::from_secs(30))
    }
}

impl StoreConnector for AzureConnector {
    fn connect(&self, account: &str, key: &str) -> Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(AzureBlobStore::new(
            account,
            key,
            &self.domain,
            self.timeout,
        )?))
    }
}

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

pub use reqwest::{Client, IntoUrl};
pub use url::Url;

use crate::block::{Block, BlockManifest, Fingerprint};
use crate::service::{TransportError, UploadProgress, UploadService};

/// An [`UploadService`] over HTTP.
///
/// The remote service exposes each asset under `{base}/assets/{asset_id}/`:
/// - `POST initialize` with a JSON body `{"totalSize", "blockSize", "deltaMode"}`, returning the JSON upload progress
///   `{"pendingBlocks": [{"index", "offset", "length"}], "baseline": ["<hex sha-256>", ...]}`;
/// - `PUT blocks/{index}?offset=..&length=..` with the raw block bytes as body;
/// - `POST commit`.
///
/// Authentication is left to the [`Client`], e.g. through its default headers (see [`HttpUploadService::with_client()`]).
#[derive(Debug, Clone)]
pub struct HttpUploadService {
    client: Client,
    base: Url,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeRequest {
    total_size: u64,
    block_size: u64,
    delta_mode: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResponse {
    #[serde(default)]
    pending_blocks: Vec<PendingBlock>,
    #[serde(default)]
    baseline: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PendingBlock {
    index: u64,
    offset: u64,
    length: u64,
}

impl TryFrom<InitializeResponse> for UploadProgress {
    type Error = TransportError;

    fn try_from(resp: InitializeResponse) -> Result<Self, Self::Error> {
        let baseline = resp
            .baseline
            .map(|fingerprints| fingerprints.iter().map(String::as_str).map(decode_fingerprint).collect::<Result<BlockManifest, _>>())
            .transpose()?;

        Ok(UploadProgress {
            pending_blocks: resp
                .pending_blocks
                .into_iter()
                .map(|block| Block::new(block.index, block.offset, block.length))
                .collect(),
            baseline,
        })
    }
}

fn decode_fingerprint(value: &str) -> Result<Fingerprint, TransportError> {
    let mut fingerprint = Fingerprint::default();

    hex::decode_to_slice(value, &mut fingerprint)
        .map_err(|err| TransportError::Protocol(format!("invalid baseline fingerprint `{value}`: {err}")))?;

    Ok(fingerprint)
}

impl HttpUploadService {
    pub fn new(base: impl IntoUrl) -> Result<Self, TransportError> {
        let mut base = base.into_url()?;

        // normalized with a trailing slash
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }

        Ok(Self {
            client: Client::default(),
            base,
        })
    }

    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, asset_id: &str, path: &str) -> Result<Url, TransportError> {
        let mut url = self.base.clone();

        url.path_segments_mut()
            .map_err(|_| TransportError::Terminal(format!("`{}` cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(["assets", asset_id])
            .extend(path.split('/'));

        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TransportError> {
        let request = request.build()?;

        tracing::trace!("{} {}", request.method(), request.url());

        let resp = self.client.execute(request).await?;
        let status = resp.status();

        if status.is_success() {
            return Ok(resp);
        }

        let message = resp.text().await.unwrap_or_default();

        tracing::trace!("Response status `{status}`: {message}");

        Err(TransportError::Status { status, message })
    }
}

impl UploadService for HttpUploadService {
    fn initialize_asset<'a>(
        &'a self,
        asset_id: &'a str,
        total_size: u64,
        block_size: u64,
        delta_mode: bool,
    ) -> BoxFuture<'a, Result<UploadProgress, TransportError>> {
        async move {
            let url = self.url(asset_id, "initialize")?;
            let body = InitializeRequest {
                total_size,
                block_size,
                delta_mode,
            };

            let resp = self.send(self.client.post(url).json(&body)).await?;
            let bytes = resp.bytes().await?;

            let resp: InitializeResponse =
                serde_json::from_slice(&bytes).map_err(|err| TransportError::Protocol(err.to_string()))?;

            UploadProgress::try_from(resp)
        }
        .boxed()
    }

    fn upload_block<'a>(&'a self, asset_id: &'a str, block: &'a Block, data: Bytes) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let url = self.url(asset_id, &format!("blocks/{}", block.index()))?;
            let request = self
                .client
                .put(url)
                .query(&[("offset", block.offset()), ("length", block.length())])
                .body(data);

            self.send(request).await?;

            Ok(())
        }
        .boxed()
    }

    fn commit_asset<'a>(&'a self, asset_id: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let url = self.url(asset_id, "commit")?;

            self.send(self.client.post(url)).await?;

            Ok(())
        }
        .boxed()
    }
}

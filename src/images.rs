//! Remote images downloaded once and inlined from the memo cache.
//!
//! Documents reference images by URL. Fetching and encoding them on every
//! render is slow and flaky, so [`RemoteImageCache`] memoizes the encoded
//! image per URL. The alt text travels with the request but does not take
//! part in the cache key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::future::{BoxFuture, FutureExt};
use imagesize::ImageError as ProbeError;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::memo::{CallError, MemoCache, MemoOptions, Memoized};

pub const IMAGES_NAMESPACE: &str = "remote-images";
const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// An image reference found in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub url: String,
    #[serde(default)]
    pub alt: Option<String>,
}

impl ImageRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            alt: None,
        }
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt = Some(alt.into());
        self
    }
}

/// A downloaded image, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub url: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub data: String,
}

impl RemoteImage {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.content_type, self.data)
    }

    pub fn bytes(&self) -> Result<Vec<u8>, ImageError> {
        STANDARD
            .decode(&self.data)
            .map_err(|err| ImageError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("invalid image url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request for `{url}` failed: {message}")]
    Http { url: String, message: String },
    #[error("`{url}` answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("`{url}` exceeds the {limit} byte limit")]
    TooLarge { url: String, limit: usize },
    #[error("`{url}` is not a supported image format")]
    Unsupported { url: String },
    #[error("`{url}` is a corrupted image")]
    Corrupted { url: String },
    #[error("stored image data is not valid base64: {0}")]
    Decode(String),
}

/// Downloads and probes remote images.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub fn new() -> Result<Self, ImageError> {
        let client = Client::builder()
            .user_agent(concat!("soffio-memo/", env!("CARGO_PKG_VERSION")))
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|err| ImageError::Http {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn max_bytes(mut self, limit: usize) -> Self {
        self.max_bytes = limit;
        self
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<RemoteImage, ImageError> {
        let started_at = Instant::now();
        let url = parse_image_url(raw_url)?;
        let http_error = |err: reqwest::Error| ImageError::Http {
            url: raw_url.to_string(),
            message: err.to_string(),
        };

        let response = self.client.get(url.clone()).send().await.map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status {
                url: raw_url.to_string(),
                status: status.as_u16(),
            });
        }
        if response
            .content_length()
            .is_some_and(|length| length > self.max_bytes as u64)
        {
            return Err(self.too_large(raw_url));
        }

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase());

        let body = response.bytes().await.map_err(http_error)?;
        if body.len() > self.max_bytes {
            return Err(self.too_large(raw_url));
        }

        let size = imagesize::blob_size(&body).map_err(|err| match err {
            ProbeError::NotSupported => ImageError::Unsupported {
                url: raw_url.to_string(),
            },
            ProbeError::CorruptedImage | ProbeError::IoError(_) => ImageError::Corrupted {
                url: raw_url.to_string(),
            },
        })?;
        let corrupted = || ImageError::Corrupted {
            url: raw_url.to_string(),
        };
        let width = u32::try_from(size.width).map_err(|_| corrupted())?;
        let height = u32::try_from(size.height).map_err(|_| corrupted())?;

        let content_type = resolve_content_type(header_type.as_deref(), &url);
        debug!(
            op = "images::fetch",
            url = raw_url,
            content_type = %content_type,
            bytes = body.len(),
            width,
            height,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Fetched remote image"
        );

        Ok(RemoteImage {
            url: raw_url.to_string(),
            content_type,
            width,
            height,
            data: STANDARD.encode(&body),
        })
    }

    fn too_large(&self, url: &str) -> ImageError {
        ImageError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        }
    }
}

fn parse_image_url(raw: &str) -> Result<Url, ImageError> {
    let url = Url::parse(raw).map_err(|err| ImageError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ImageError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

/// Header when it names an image type, otherwise a guess from the path.
fn resolve_content_type(header: Option<&str>, url: &Url) -> String {
    if let Some(header) = header.filter(|value| value.starts_with("image/")) {
        return header.to_string();
    }
    mime_guess::from_path(url.path())
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
}

type FetchFuture = BoxFuture<'static, Result<RemoteImage, ImageError>>;
type FetchFn = Box<dyn Fn((ImageRequest,)) -> FetchFuture + Send + Sync>;

/// Memoized image fetches keyed by URL.
#[derive(Clone)]
pub struct RemoteImageCache {
    memoized: Memoized<FetchFn, (ImageRequest,), RemoteImage, ImageError>,
}

impl RemoteImageCache {
    pub fn new(cache: &MemoCache, fetcher: ImageFetcher, options: MemoOptions) -> Self {
        let fetcher = Arc::new(fetcher);
        let fetch: FetchFn = Box::new(move |(request,): (ImageRequest,)| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch(&request.url).await }.boxed()
        });

        Self {
            memoized: cache.wrap(fetch, IMAGES_NAMESPACE, options.exclude(["alt"])),
        }
    }

    pub fn namespace(&self) -> &str {
        self.memoized.namespace()
    }

    pub async fn get(&self, request: ImageRequest) -> Result<RemoteImage, CallError<ImageError>> {
        let url = request.url.clone();
        let outcome = self.memoized.call((request,)).await;
        if let Err(err) = &outcome {
            warn!(op = "images::get", url = %url, error = %err, "Remote image unavailable");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("valid url")
    }

    #[test]
    fn header_type_wins_when_it_is_an_image() {
        let target = url("https://example.com/a.png");
        assert_eq!(resolve_content_type(Some("image/webp"), &target), "image/webp");
    }

    #[test]
    fn extension_is_used_for_generic_headers() {
        let target = url("https://example.com/photos/a.JPG?size=large");
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), &target),
            "image/jpeg"
        );
        assert_eq!(resolve_content_type(None, &target), "image/jpeg");
    }

    #[test]
    fn unknown_types_fall_back_to_octet_stream() {
        let target = url("https://example.com/download");
        assert_eq!(resolve_content_type(None, &target), FALLBACK_CONTENT_TYPE);
    }

    #[test]
    fn only_http_urls_are_fetched() {
        assert!(parse_image_url("https://example.com/a.png").is_ok());
        assert!(matches!(
            parse_image_url("file:///etc/passwd"),
            Err(ImageError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_image_url("not a url"),
            Err(ImageError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn data_uri_inlines_the_payload() {
        let image = RemoteImage {
            url: "https://example.com/a.gif".to_string(),
            content_type: "image/gif".to_string(),
            width: 1,
            height: 1,
            data: STANDARD.encode(b"GIF89a"),
        };
        assert_eq!(image.data_uri(), "data:image/gif;base64,R0lGODlh");
        assert_eq!(image.bytes().expect("decodes"), b"GIF89a");
    }

    #[test]
    fn alt_text_does_not_change_the_request_key() {
        use crate::memo::{ExcludedKeys, fingerprint};

        let excluded: ExcludedKeys = ["alt"].into_iter().collect();
        let plain = ImageRequest::new("https://example.com/a.png");
        let described = plain.clone().with_alt("A diagram");

        assert_eq!(
            fingerprint(&excluded, &(plain,)).expect("key"),
            fingerprint(&excluded, &(described,)).expect("key")
        );
    }
}

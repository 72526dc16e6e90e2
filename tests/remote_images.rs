use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    http::{StatusCode, header},
    routing::get,
};
use soffio_memo::images::{IMAGES_NAMESPACE, ImageError, ImageFetcher, ImageRequest, RemoteImageCache};
use soffio_memo::memo::{CallError, DedupMap, ManualClock, MemoCache, MemoOptions};
use soffio_memo::store::{EntryStore, MemoryEntryStore};

/// Smallest PNG prefix `imagesize` accepts: signature plus an IHDR header.
fn png(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes
}

/// GIF header with logical screen size.
fn gif(width: u16, height: u16) -> Vec<u8> {
    let mut bytes = b"GIF89a".to_vec();
    bytes.extend_from_slice(&width.to_le_bytes());
    bytes.extend_from_slice(&height.to_le_bytes());
    bytes.extend_from_slice(&[0, 0, 0]);
    bytes
}

struct ImageServer {
    base: String,
    hits: Arc<AtomicUsize>,
}

impl ImageServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn start_server() -> ImageServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = |hits: &Arc<AtomicUsize>| {
        let hits = Arc::clone(hits);
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    };

    let png_hit = counted(&hits);
    let gif_hit = counted(&hits);
    let missing_hit = counted(&hits);
    let app = Router::new()
        .route(
            "/pixel.png",
            get(move || {
                png_hit();
                async { ([(header::CONTENT_TYPE, "image/png")], png(4, 3)) }
            }),
        )
        .route(
            "/diagram.gif",
            get(move || {
                gif_hit();
                async { ([(header::CONTENT_TYPE, "application/octet-stream")], gif(16, 9)) }
            }),
        )
        .route(
            "/notes.txt",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "plain words") }),
        )
        .route(
            "/missing.png",
            get(move || {
                missing_hit();
                async { StatusCode::NOT_FOUND }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });

    ImageServer {
        base: format!("http://{addr}"),
        hits,
    }
}

fn image_cache(store: Arc<MemoryEntryStore>) -> RemoteImageCache {
    let cache = MemoCache::new(store).with_clock(Arc::new(ManualClock::new(0)));
    RemoteImageCache::new(
        &cache,
        ImageFetcher::new().expect("client builds"),
        MemoOptions::default().shared_map(DedupMap::new()),
    )
}

#[tokio::test]
async fn fetch_probes_dimensions_and_encodes_the_payload() {
    let server = start_server().await;
    let fetcher = ImageFetcher::new().expect("client builds");

    let image = fetcher.fetch(&server.url("/pixel.png")).await.expect("fetches");

    assert_eq!(image.content_type, "image/png");
    assert_eq!((image.width, image.height), (4, 3));
    assert_eq!(image.bytes().expect("decodes"), png(4, 3));
    assert!(image.data_uri().starts_with("data:image/png;base64,"));
}

#[tokio::test]
async fn generic_content_types_fall_back_to_the_extension() {
    let server = start_server().await;
    let fetcher = ImageFetcher::new().expect("client builds");

    let image = fetcher.fetch(&server.url("/diagram.gif")).await.expect("fetches");

    assert_eq!(image.content_type, "image/gif");
    assert_eq!((image.width, image.height), (16, 9));
}

#[tokio::test]
async fn non_images_and_errors_are_rejected() {
    let server = start_server().await;
    let fetcher = ImageFetcher::new().expect("client builds");

    let text = fetcher.fetch(&server.url("/notes.txt")).await;
    assert!(matches!(text, Err(ImageError::Unsupported { .. })));

    let missing = fetcher.fetch(&server.url("/missing.png")).await;
    assert!(matches!(
        missing,
        Err(ImageError::Status { status: 404, .. })
    ));

    let limited = ImageFetcher::new().expect("client builds").max_bytes(8);
    let too_large = limited.fetch(&server.url("/pixel.png")).await;
    assert!(matches!(too_large, Err(ImageError::TooLarge { limit: 8, .. })));
}

#[tokio::test]
async fn each_url_is_downloaded_once_whatever_the_alt_text() {
    let server = start_server().await;
    let store = Arc::new(MemoryEntryStore::new());
    let images = image_cache(store.clone());

    let url = server.url("/pixel.png");
    let first = images
        .get(ImageRequest::new(&url).with_alt("Tiny pixel"))
        .await
        .expect("fetches");
    let second = images
        .get(ImageRequest::new(&url).with_alt("Same pixel, new caption"))
        .await
        .expect("cached");
    let third = images.get(ImageRequest::new(&url)).await.expect("cached");

    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
    assert_eq!(images.namespace(), IMAGES_NAMESPACE);

    let stored: Vec<_> = {
        use futures::TryStreamExt;
        store.iterate().try_collect().await.expect("scan")
    };
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].namespace, IMAGES_NAMESPACE);
    assert_eq!(stored[0].fields.get("width"), Some(&serde_json::json!(4)));
}

#[tokio::test]
async fn failed_downloads_are_not_cached() {
    let server = start_server().await;
    let store = Arc::new(MemoryEntryStore::new());
    let images = image_cache(store.clone());

    let url = server.url("/missing.png");
    for _ in 0..2 {
        let err = images.get(ImageRequest::new(&url)).await.expect_err("missing");
        assert!(matches!(
            err,
            CallError::Generator(ImageError::Status { status: 404, .. })
        ));
    }

    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    assert!(store.is_empty());
}

//! HTTP fetch with shared retry/backoff, the image pipeline, and the
//! original-URL → CDN-URL cache.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use image::imageops::FilterType;
use image::ImageFormat;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bfw-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// The one retry policy shared by every fetcher in the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status, backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Injectable clock so cache TTL behavior tests without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    cdn_url: String,
    inserted_at: Instant,
}

/// Original-URL → CDN-URL mapping with a TTL. Passed by reference to
/// callers; holds no global state.
pub struct ImageCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: StdMutex<HashMap<String, CacheEntry>>,
}

impl ImageCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(SystemClock))
    }

    pub fn get(&self, original_url: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(original_url) {
            Some(entry) if self.clock.now().duration_since(entry.inserted_at) < self.ttl => {
                Some(entry.cdn_url.clone())
            }
            Some(_) => {
                entries.remove(original_url);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, original_url: &str, cdn_url: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            original_url.to_string(),
            CacheEntry {
                cdn_url: cdn_url.to_string(),
                inserted_at: self.clock.now(),
            },
        );
    }

    pub fn invalidate(&self, original_url: &str) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(original_url);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Acceptance thresholds for downloaded images. Bodies under `min_bytes`
/// are treated as broken/placeholder responses.
#[derive(Debug, Clone, Copy)]
pub struct ImageRules {
    pub min_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl Default for ImageRules {
    fn default() -> Self {
        Self {
            min_bytes: 4096,
            min_dimension: 120,
            max_dimension: 1600,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("body too small: {actual} bytes < {min} minimum")]
    TooFewBytes { actual: usize, min: usize },
    #[error("decoded image {width}x{height} below {min}px minimum")]
    Dimensions { width: u32, height: u32, min: u32 },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("upload failed with status {status}: {body}")]
    Upload { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// A validated, possibly re-encoded image ready for upload.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
    pub resized: bool,
}

/// Validate a downloaded body against the rules; constrained-resize and
/// re-encode to JPEG when either dimension exceeds the maximum.
pub fn prepare_image(bytes: &[u8], rules: &ImageRules) -> Result<PreparedImage, ImageError> {
    if bytes.len() < rules.min_bytes {
        return Err(ImageError::TooFewBytes {
            actual: bytes.len(),
            min: rules.min_bytes,
        });
    }
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = (decoded.width(), decoded.height());
    if width < rules.min_dimension || height < rules.min_dimension {
        return Err(ImageError::Dimensions {
            width,
            height,
            min: rules.min_dimension,
        });
    }

    if width <= rules.max_dimension && height <= rules.max_dimension {
        return Ok(PreparedImage {
            bytes: bytes.to_vec(),
            content_type: sniff_content_type(bytes),
            width,
            height,
            resized: false,
        });
    }

    let resized = decoded.resize(rules.max_dimension, rules.max_dimension, FilterType::Lanczos3);
    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(PreparedImage {
        width: resized.width(),
        height: resized.height(),
        bytes: out.into_inner(),
        content_type: "image/jpeg",
        resized: true,
    })
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(b"RIFF") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Supabase Storage bucket client. Objects are addressed `{bucket}/{path}`
/// and served back through the public-object URL convention.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    bucket: String,
}

impl ObjectStore {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            service_key: service_key.into(),
            bucket: bucket.into(),
        }
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            path.trim_start_matches('/')
        )
    }

    pub async fn upload(&self, path: &str, image: &PreparedImage) -> Result<String, ImageError> {
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            path.trim_start_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, image.content_type)
            .body(image.bytes.clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ImageError::Upload {
                status: status.as_u16(),
                body,
            });
        }
        Ok(self.public_url(path))
    }
}

/// Download → validate → resize → upload → cache, for one candidate URL.
/// Any stage failure leaves the item imageless for this run; the cache
/// miss makes a later run retry.
pub struct ImagePipeline {
    pub rules: ImageRules,
    pub store: ObjectStore,
}

impl ImagePipeline {
    pub fn new(rules: ImageRules, store: ObjectStore) -> Self {
        Self { rules, store }
    }

    pub async fn process(
        &self,
        fetcher: &HttpFetcher,
        cache: &ImageCache,
        run_id: Uuid,
        source_id: &str,
        original_url: &str,
        object_path: &str,
    ) -> Result<String, ImageError> {
        if let Some(cdn_url) = cache.get(original_url) {
            return Ok(cdn_url);
        }
        let resp = fetcher.fetch_bytes(run_id, source_id, original_url).await?;
        let prepared = prepare_image(&resp.body, &self.rules)?;
        let cdn_url = self.store.upload(object_path, &prepared).await?;
        cache.insert(original_url, &cdn_url);
        Ok(cdn_url)
    }
}

use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use tts_stream::{AudioFormat, CacheEntry, CacheStore, RequestKey, TtsError, TtsResult, TtsSettings};

use crate::http::{body_stream, collect_stream_to_bytes};

/// Downloads precomputed audio resources into the cache.
///
/// Supports cancellation and bounded retries/backoff. `idle_timeout` bounds the silence between
/// two body chunks; `request_timeout` bounds connection setup.
#[derive(Debug, Clone)]
pub struct UrlDownloader {
    client: Client,
    request_timeout: Duration,
    idle_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    max_retry_delay: Duration,
    cancel: CancellationToken,
}

impl UrlDownloader {
    pub fn new(client: Client, settings: &TtsSettings, cancel: CancellationToken) -> Self {
        Self {
            client,
            request_timeout: settings.request_timeout,
            idle_timeout: settings.idle_timeout,
            max_retries: settings.max_retries,
            retry_base_delay: settings.retry_base_delay,
            max_retry_delay: settings.max_retry_delay,
            cancel,
        }
    }

    /// Downloads a URL into memory (with retries and cancellation).
    pub async fn download_bytes(&self, url: &str) -> TtsResult<Bytes> {
        self.retry_with_backoff(url, "download", || self.try_download_once(url))
            .await
    }

    /// Download `url` and promote it to the cache entry of `key`.
    ///
    /// The format comes from the URL's file extension, falling back to `fallback`. Nothing is
    /// written if the download is cancelled or fails.
    pub async fn download_to_cache(
        &self,
        url: &str,
        cache: &CacheStore,
        key: &RequestKey,
        fallback: AudioFormat,
    ) -> TtsResult<CacheEntry> {
        let format = format_from_url(url).unwrap_or(fallback);
        let bytes = self.download_bytes(url).await?;
        if self.cancel.is_cancelled() {
            return Err(TtsError::Cancelled);
        }

        let cache = cache.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || cache.persist(&key, format, &bytes))
            .await
            .map_err(|e| TtsError::msg(format!("cache persist task failed: {e}")))?
    }

    // ----------------------------
    // Internals: retry policy
    // ----------------------------

    async fn retry_with_backoff<T, F, Fut>(
        &self,
        url: &str,
        op_name: &str,
        mut f: F,
    ) -> TtsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = TtsResult<T>>,
    {
        let mut last_error: Option<TtsError> = None;
        let mut delay = self.retry_base_delay;

        for attempt in 0..=self.max_retries {
            if self.cancel.is_cancelled() {
                return Err(TtsError::Cancelled);
            }

            match f().await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(
                            url = url,
                            attempts = attempt + 1,
                            operation = op_name,
                            "download succeeded after retry"
                        );
                    }
                    return Ok(v);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    debug!(
                        url = url,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        operation = op_name,
                        "download attempt failed: {}",
                        e
                    );
                    last_error = Some(e);

                    if attempt < self.max_retries {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(TtsError::Cancelled),
                            _ = tokio::time::sleep(delay) => {},
                        }
                        delay = (delay * 2).min(self.max_retry_delay);
                    }
                }
            }
        }

        debug!(
            url = url,
            attempts = self.max_retries + 1,
            operation = op_name,
            "download giving up after retries"
        );

        Err(last_error.unwrap_or_else(|| TtsError::msg("download failed with no error")))
    }

    // ----------------------------
    // Internals: request attempts
    // ----------------------------

    async fn try_download_once(&self, url: &str) -> TtsResult<Bytes> {
        let parsed = Url::parse(url).map_err(|e| TtsError::transport(format!("{e}: {url}")))?;

        let send = timeout(self.request_timeout, self.client.get(parsed).send());
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TtsError::Cancelled),
            res = send => match res {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(TtsError::transport(e)),
                Err(_) => return Err(TtsError::timeout(url)),
            },
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TtsError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        collect_stream_to_bytes(body_stream(response), &self.cancel, self.idle_timeout, url).await
    }
}

/// Audio format named by the last path segment's extension, if any.
fn format_from_url(url: &str) -> Option<AudioFormat> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    ext.parse().ok()
}

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Response;
use tokio_util::sync::CancellationToken;

use tts_stream::{TtsError, TtsResult};

/// Response body as a stream of chunks. Ends after the first error.
pub(crate) fn body_stream(response: Response) -> BoxStream<'static, reqwest::Result<Bytes>> {
    stream::unfold(Some(response), |state| async move {
        let mut response = state?;
        match response.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), Some(response))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Next body chunk, racing cancellation and an idle timeout.
///
/// `Ok(None)` means the body ended normally.
pub(crate) async fn next_chunk<S>(
    stream: &mut S,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    url: &str,
) -> TtsResult<Option<Bytes>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let item = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TtsError::Cancelled),
        item = tokio::time::timeout(idle_timeout, stream.next()) => item,
    };
    match item {
        Ok(Some(Ok(bytes))) => Ok(Some(bytes)),
        Ok(Some(Err(e))) => Err(TtsError::transport(e)),
        Ok(None) => Ok(None),
        Err(_) => Err(TtsError::timeout(url)),
    }
}

/// Collect a whole body, honoring cancellation and the idle timeout between chunks.
pub(crate) async fn collect_stream_to_bytes<S>(
    mut stream: S,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    url: &str,
) -> TtsResult<Bytes>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    while let Some(chunk) = next_chunk(&mut stream, cancel, idle_timeout, url).await? {
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

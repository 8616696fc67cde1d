//! Server-sent-event relay
//!
//! Upstream chunks are forwarded unmodified. A side parser reassembles the
//! assistant text from `choices[0].delta.content` so the exchange can be
//! ingested once the stream has been fully delivered.

use crate::error::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;

/// Incremental parser for OpenAI-style SSE chat chunks.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    /// Bytes of an incomplete line
    pending: Vec<u8>,
    content: String,
    response_id: Option<String>,
    done: bool,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; lines may span chunk boundaries.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    /// Process any trailing line without a newline.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if self.response_id.is_none() {
            self.response_id = chunk.get("id").and_then(Value::as_str).map(str::to_string);
        }
        if let Some(text) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            self.content.push_str(text);
        }
    }

    /// Assistant text seen so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Upstream completion id, if any chunk carried one
    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Whether the `[DONE]` sentinel was seen
    pub fn saw_done(&self) -> bool {
        self.done
    }
}

/// SSE comment carrying memory metadata
pub fn trailing_comment(memories: usize) -> Bytes {
    Bytes::from(format!(": memproxy {{\"memories\":{}}}\n\n", memories))
}

/// Relay upstream bytes and run `on_complete` after the last one is taken.
///
/// If the consumer drops the stream early (client disconnect), the upstream
/// body is dropped with it and `on_complete` never runs. An upstream error
/// ends the stream with an error and also skips `on_complete`, as does an
/// upstream that closes without sending `[DONE]`.
pub fn relay<F>(
    mut upstream: BoxStream<'static, Result<Bytes>>,
    trailer: Option<Bytes>,
    on_complete: F,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    F: FnOnce(SseAccumulator) + Send + 'static,
{
    async_stream::stream! {
        let mut acc = SseAccumulator::new();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    acc.feed(&bytes);
                    yield Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!("Upstream stream failed: {}", e);
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                    return;
                }
            }
        }
        acc.flush();
        if let Some(trailer) = trailer {
            yield Ok(trailer);
        }
        if acc.saw_done() {
            on_complete(acc);
        } else {
            tracing::warn!("Upstream stream ended without [DONE], skipping ingestion");
        }
    }
}

/// Send a buffered body as one chunk and run `on_delivered` once it is taken.
///
/// Dropping the stream before the chunk is consumed skips `on_delivered`.
pub fn deliver<F>(
    body: Bytes,
    on_delivered: F,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    F: FnOnce() + Send + 'static,
{
    async_stream::stream! {
        yield Ok::<Bytes, std::io::Error>(body);
        on_delivered();
    }
}

/// Assistant text and id from a non-streaming completion body.
pub fn completion_text(body: &[u8]) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let text = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)?
        .to_string();
    let id = value.get("id").and_then(Value::as_str).map(str::to_string);
    Some((text, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn sse(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"id": "chatcmpl-1", "choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_accumulates_split_chunks() {
        let body = format!("{}{}data: [DONE]\n\n", sse("Hel"), sse("lo"));
        let bytes = body.as_bytes();
        let mut acc = SseAccumulator::new();
        for piece in bytes.chunks(7) {
            acc.feed(piece);
        }
        acc.flush();
        assert_eq!(acc.content(), "Hello");
        assert_eq!(acc.response_id(), Some("chatcmpl-1"));
        assert!(acc.saw_done());
    }

    #[test]
    fn test_ignores_comments_and_garbage() {
        let mut acc = SseAccumulator::new();
        acc.feed(b": keep-alive\n\ndata: {not json}\n\nevent: ping\n");
        acc.feed(sse("ok").as_bytes());
        assert_eq!(acc.content(), "ok");
        assert!(!acc.saw_done());
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let body = sse("héllo");
        let bytes = body.as_bytes();
        let split = body.find('é').unwrap() + 1;
        let mut acc = SseAccumulator::new();
        acc.feed(&bytes[..split]);
        acc.feed(&bytes[split..]);
        assert_eq!(acc.content(), "héllo");
    }

    #[tokio::test]
    async fn test_relay_passes_bytes_and_completes() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from(sse("a"))),
            Ok(Bytes::from(sse("b"))),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let expected: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.as_ref().unwrap().to_vec())
            .collect();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let stream = relay(
            futures::stream::iter(chunks).boxed(),
            Some(trailing_comment(2)),
            move |acc| {
                let _ = tx.send(acc.content().to_string());
            },
        );
        let out: Vec<std::io::Result<Bytes>> = stream.collect().await;
        let bytes: Vec<u8> = out.into_iter().flat_map(|b| b.unwrap().to_vec()).collect();

        let trailer = b": memproxy {\"memories\":2}\n\n";
        assert_eq!(&bytes[..expected.len()], expected.as_slice());
        assert_eq!(&bytes[expected.len()..], trailer);
        assert_eq!(rx.await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_relay_dropped_early_skips_completion() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let upstream = futures::stream::iter(vec![Ok(Bytes::from(sse("a")))])
            .chain(futures::stream::pending())
            .boxed();

        let mut stream = Box::pin(relay(upstream, None, move |_| {
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(stream.next().await.is_some());
        drop(stream);
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_relay_upstream_error_skips_completion() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from(sse("a"))),
            Err(Error::Upstream("reset".into())),
        ];
        let out: Vec<std::io::Result<Bytes>> = relay(
            futures::stream::iter(chunks).boxed(),
            None,
            move |_| flag.store(true, Ordering::SeqCst),
        )
        .collect()
        .await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_relay_without_done_skips_completion() {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::from(sse("cut of")))];
        let out: Vec<std::io::Result<Bytes>> = relay(
            futures::stream::iter(chunks).boxed(),
            Some(trailing_comment(0)),
            move |_| flag.store(true, Ordering::SeqCst),
        )
        .collect()
        .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|b| b.is_ok()));
        assert!(!completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deliver_runs_after_chunk_taken() {
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = delivered.clone();
        let mut stream = Box::pin(deliver(Bytes::from_static(b"{}"), move || {
            flag.store(true, Ordering::SeqCst);
        }));

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"{}");
        assert!(!delivered.load(Ordering::SeqCst));
        assert!(stream.next().await.is_none());
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deliver_dropped_skips_callback() {
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = delivered.clone();
        let stream = deliver(Bytes::from_static(b"{}"), move || {
            flag.store(true, Ordering::SeqCst);
        });
        drop(stream);
        assert!(!delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_completion_text() {
        let body = br#"{"id":"chatcmpl-9","choices":[{"message":{"role":"assistant","content":"Hi"}}]}"#;
        let (text, id) = completion_text(body).unwrap();
        assert_eq!(text, "Hi");
        assert_eq!(id.as_deref(), Some("chatcmpl-9"));
        assert!(completion_text(b"{}").is_none());
    }
}

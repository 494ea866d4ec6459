//! Line re-framing for streamed generation responses
//!
//! Backends flush whatever bytes they have, so a network chunk may hold half a JSON
//! object or several of them. This wrapper accumulates bytes and yields exactly one
//! complete frame per item: a single non-empty line for NDJSON, or a whole event
//! (its consecutive lines) for server-sent events.
//!
//! Dropping the stream drops the upstream body with it, which is how the upstream
//! connection is released when the client goes away mid-response.

use crate::errors::ProxyError;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// Upper bound on a single buffered frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// How relayed lines are grouped and terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One document per line, each followed by `\n`. Blank lines are dropped.
    Ndjson,
    /// Consecutive lines form one event, followed by a blank line.
    Sse,
}

pub struct LineBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
    event: BytesMut,
    framing: Framing,
    max_frame_bytes: usize,
    upstream_done: bool,
    failed: bool,
}

impl<S> LineBufferedStream<S> {
    pub fn new(inner: S, framing: Framing) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            event: BytesMut::new(),
            framing,
            max_frame_bytes: MAX_FRAME_BYTES,
            upstream_done: false,
            failed: false,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Feeds one line (already stripped of its line ending) into the framer.
    /// An empty slice stands for a blank line.
    fn push_line(&mut self, line: &[u8]) -> Option<Bytes> {
        match self.framing {
            Framing::Ndjson if line.is_empty() => None,
            Framing::Ndjson => {
                let mut out = BytesMut::with_capacity(line.len() + 1);
                out.extend_from_slice(line);
                out.extend_from_slice(b"\n");
                Some(out.freeze())
            }
            Framing::Sse if line.is_empty() => {
                if self.event.is_empty() {
                    return None;
                }
                let mut out = self.event.split();
                out.extend_from_slice(b"\n\n");
                Some(out.freeze())
            }
            Framing::Sse => {
                if !self.event.is_empty() {
                    self.event.extend_from_slice(b"\n");
                }
                self.event.extend_from_slice(line);
                None
            }
        }
    }

    /// Consumes complete lines from the buffer until one completes a frame.
    fn next_frame(&mut self) -> Option<Bytes> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let line = raw.trim_ascii_end();
            let line = if line.trim_ascii_start().is_empty() {
                &[][..]
            } else {
                line
            };
            if let Some(frame) = self.push_line(line) {
                return Some(frame);
            }
        }
        None
    }

    /// Flushes a trailing line without a newline and any pending event.
    fn finish(&mut self) -> Option<Bytes> {
        let rest = self.buffer.split();
        let line = rest.trim_ascii();
        if !line.is_empty()
            && let Some(frame) = self.push_line(line)
        {
            return Some(frame);
        }
        self.push_line(&[])
    }
}

impl<S, E> Stream for LineBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, ProxyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if this.failed {
                return Poll::Ready(None);
            }

            if let Some(frame) = this.next_frame() {
                return Poll::Ready(Some(Ok(frame)));
            }

            if this.upstream_done {
                return Poll::Ready(this.finish().map(Ok));
            }

            if this.buffer.len() + this.event.len() > this.max_frame_bytes {
                this.failed = true;
                return Poll::Ready(Some(Err(ProxyError::MidStream(format!(
                    "upstream sent more than {} bytes without completing a line",
                    this.max_frame_bytes
                )))));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(ProxyError::MidStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.upstream_done = true;
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S> Drop for LineBufferedStream<S> {
    fn drop(&mut self) {
        if !self.upstream_done && !self.failed {
            debug!("Stream closed before upstream finished, releasing upstream connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::DropFlag;
    use futures_util::StreamExt;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Helper to create a stream from chunks
    fn chunks_to_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    async fn collect_frames(chunks: Vec<&'static [u8]>, framing: Framing) -> Vec<String> {
        LineBufferedStream::new(chunks_to_stream(chunks), framing)
            .map(|item| String::from_utf8(item.unwrap().to_vec()).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_complete_lines_pass_through() {
        let lines = collect_frames(vec![b"{\"a\":1}\n{\"b\":2}\n".as_slice()], Framing::Ndjson).await;
        assert_eq!(lines, vec!["{\"a\":1}\n", "{\"b\":2}\n"]);
    }

    #[tokio::test]
    async fn test_split_line_is_buffered() {
        let lines = collect_frames(
            vec![
                b"{\"message\":".as_slice(),
                b"\"hel".as_slice(),
                b"lo\"}\n".as_slice(),
            ],
            Framing::Ndjson,
        )
        .await;
        assert_eq!(lines, vec!["{\"message\":\"hello\"}\n"]);
    }

    #[tokio::test]
    async fn test_blank_lines_are_dropped() {
        let lines = collect_frames(
            vec![b"\n{\"a\":1}\n\n\r\n  \n".as_slice(), b"{\"b\":2}\n".as_slice()],
            Framing::Ndjson,
        )
        .await;
        assert_eq!(lines, vec!["{\"a\":1}\n", "{\"b\":2}\n"]);
    }

    #[tokio::test]
    async fn test_crlf_is_normalised() {
        let lines = collect_frames(vec![b"{\"a\":1}\r\n".as_slice()], Framing::Ndjson).await;
        assert_eq!(lines, vec!["{\"a\":1}\n"]);
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline_is_flushed() {
        let lines = collect_frames(
            vec![b"{\"a\":1}\n{\"done\":".as_slice(), b"true}".as_slice()],
            Framing::Ndjson,
        )
        .await;
        assert_eq!(lines, vec!["{\"a\":1}\n", "{\"done\":true}\n"]);
    }

    #[tokio::test]
    async fn test_sse_events_stay_separated() {
        let events = collect_frames(
            vec![
                b"data: {\"id\":1}\n\nda".as_slice(),
                b"ta: {\"id\":2}\n\ndata: [DONE]\n\n".as_slice(),
            ],
            Framing::Sse,
        )
        .await;
        assert_eq!(
            events,
            vec![
                "data: {\"id\":1}\n\n",
                "data: {\"id\":2}\n\n",
                "data: [DONE]\n\n"
            ]
        );
    }

    #[tokio::test]
    async fn test_multi_line_sse_event_is_kept_whole() {
        let events = collect_frames(
            vec![
                b"event: delta\r\ndata: {\"id\":1}\n".as_slice(),
                b"\n\n\nid: 7\ndata: {\"id\":2}".as_slice(),
            ],
            Framing::Sse,
        )
        .await;
        assert_eq!(
            events,
            vec![
                "event: delta\ndata: {\"id\":1}\n\n",
                "id: 7\ndata: {\"id\":2}\n\n"
            ]
        );
    }

    #[tokio::test]
    async fn test_order_is_preserved_across_many_chunks() {
        let lines = collect_frames(
            vec![b"1\n2".as_slice(), b"\n3\n4\n".as_slice(), b"5".as_slice()],
            Framing::Ndjson,
        )
        .await;
        assert_eq!(lines, vec!["1\n", "2\n", "3\n", "4\n", "5\n"]);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        assert!(collect_frames(vec![], Framing::Ndjson).await.is_empty());
        assert!(collect_frames(vec![], Framing::Sse).await.is_empty());
    }

    #[tokio::test]
    async fn test_error_ends_stream_after_complete_lines() {
        let chunks: Vec<Result<Bytes, &'static str>> = vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n{\"b\"")),
            Err("connection reset"),
            Ok(Bytes::from_static(b":2}\n")),
        ];
        let mut stream = LineBufferedStream::new(futures_util::stream::iter(chunks), Framing::Ndjson);

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"a\":1}\n")
        );
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::MidStream(ref m) if m == "connection reset"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_fails_instead_of_growing() {
        let chunks = vec![b"0123456789".as_slice(), b"0123456789".as_slice(), b"\n".as_slice()];
        let mut stream =
            LineBufferedStream::new(chunks_to_stream(chunks), Framing::Ndjson).with_max_frame_bytes(15);

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::MidStream(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_upstream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let upstream = Box::pin(futures_util::stream::unfold(
            DropFlag(Arc::clone(&dropped)),
            |flag| async move { Some((Ok::<_, Infallible>(Bytes::from_static(b"{\"t\":1}\n")), flag)) },
        ));
        let mut stream = LineBufferedStream::new(upstream, Framing::Ndjson);

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"t\":1}\n")
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"t\":1}\n")
        );
        assert!(!dropped.load(Ordering::SeqCst));

        // The client goes away with the upstream still producing
        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }
}

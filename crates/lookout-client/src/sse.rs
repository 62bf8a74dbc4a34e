use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::gateway::ByteStream;

/// Reserved frame body signaling normal end-of-stream.
pub const STREAM_END_SENTINEL: &str = "[STREAM_END]";

/// Structured lifecycle events of one streaming subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Channel established.
    Opened,
    /// One payload frame.
    Line(String),
    /// Transport-level failure; the subscription is dead.
    TransportError(String),
    /// Sentinel received, or the owner closed the subscription.
    Ended,
}

/// Incremental decoder for `text/event-stream` frames.
///
/// Collects `data:` field lines and dispatches the joined payload on a blank
/// line. Comment lines and fields other than `data` are ignored; CRLF line
/// endings are tolerated.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns the payloads of any frames it
    /// completes, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.take_line(line.trim_end_matches(['\n', '\r']), &mut frames);
        }
        frames
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                frames.push(self.data_lines.join("\n"));
                self.data_lines.clear();
            }
        } else if line.starts_with(':') {
            // comment / keep-alive
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}

/// Owns one streaming subscription: decodes frames off the byte stream and
/// forwards `StreamEvent`s until the sentinel, a transport failure, or
/// `close()`. After `Ended` no further events are emitted; the subscription
/// is released exactly once and double-close is a no-op.
pub struct StreamConsumer {
    close_tx: watch::Sender<bool>,
    finished: Arc<AtomicBool>,
}

impl StreamConsumer {
    pub fn spawn(stream: ByteStream, events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        let finished = Arc::new(AtomicBool::new(false));
        tokio::spawn(consume(stream, events, close_rx, Arc::clone(&finished)));
        Self { close_tx, finished }
    }

    /// Release the subscription.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn consume(
    mut stream: ByteStream,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut close_rx: watch::Receiver<bool>,
    finished: Arc<AtomicBool>,
) {
    if *close_rx.borrow() {
        finished.store(true, Ordering::SeqCst);
        return;
    }
    let _ = events.send(StreamEvent::Opened);

    let mut decoder = SseDecoder::new();
    loop {
        tokio::select! {
            biased;
            _ = close_rx.changed() => {
                if !finished.swap(true, Ordering::SeqCst) {
                    let _ = events.send(StreamEvent::Ended);
                }
                return;
            },
            item = stream.next() => match item {
                Some(Ok(chunk)) => {
                    for frame in decoder.feed(&chunk) {
                        if frame == STREAM_END_SENTINEL {
                            if !finished.swap(true, Ordering::SeqCst) {
                                let _ = events.send(StreamEvent::Ended);
                            }
                            return;
                        }
                        let _ = events.send(StreamEvent::Line(frame));
                    }
                },
                Some(Err(e)) => {
                    if !finished.swap(true, Ordering::SeqCst) {
                        let _ = events.send(StreamEvent::TransportError(e.to_string()));
                    }
                    return;
                },
                None => {
                    // server dropped the channel without the sentinel
                    if !finished.swap(true, Ordering::SeqCst) {
                        let _ = events.send(StreamEvent::TransportError(
                            "channel closed unexpectedly".to_string(),
                        ));
                    }
                    return;
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::error::GatewayError;

    #[test]
    fn decoder_single_frame() {
        let mut d = SseDecoder::new();
        assert_eq!(d.feed(b"data: hello\n\n"), vec!["hello"]);
    }

    #[test]
    fn decoder_frame_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: par").is_empty());
        assert!(d.feed(b"tial\n").is_empty());
        assert_eq!(d.feed(b"\n"), vec!["partial"]);
    }

    #[test]
    fn decoder_multiple_frames_in_one_chunk() {
        let mut d = SseDecoder::new();
        assert_eq!(d.feed(b"data: a\n\ndata: b\n\n"), vec!["a", "b"]);
    }

    #[test]
    fn decoder_crlf_line_endings() {
        let mut d = SseDecoder::new();
        assert_eq!(d.feed(b"data: win\r\n\r\n"), vec!["win"]);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b": keep-alive\n").is_empty());
        assert!(d.feed(b"event: alert\nid: 7\n").is_empty());
        assert_eq!(d.feed(b"data: payload\n\n"), vec!["payload"]);
    }

    #[test]
    fn decoder_joins_multi_data_lines() {
        let mut d = SseDecoder::new();
        assert_eq!(d.feed(b"data: one\ndata: two\n\n"), vec!["one\ntwo"]);
    }

    #[test]
    fn decoder_no_dispatch_without_blank_line() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: pending\n").is_empty());
    }

    #[test]
    fn decoder_preserves_data_without_space() {
        let mut d = SseDecoder::new();
        assert_eq!(d.feed(b"data:tight\n\n"), vec!["tight"]);
    }

    fn channel_stream() -> (
        mpsc::UnboundedSender<Result<Bytes, GatewayError>>,
        ByteStream,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Box::pin(UnboundedReceiverStream::new(rx)))
    }

    #[tokio::test]
    async fn consumer_emits_opened_then_lines() {
        let (frames_tx, stream) = channel_stream();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _consumer = StreamConsumer::spawn(stream, events_tx);

        frames_tx
            .send(Ok(Bytes::from("data: boot ok\n\ndata: temp 42C\n\n")))
            .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Opened);
        assert_eq!(
            events_rx.recv().await.unwrap(),
            StreamEvent::Line("boot ok".to_string())
        );
        assert_eq!(
            events_rx.recv().await.unwrap(),
            StreamEvent::Line("temp 42C".to_string())
        );
    }

    #[tokio::test]
    async fn consumer_sentinel_ends_stream() {
        let (frames_tx, stream) = channel_stream();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let consumer = StreamConsumer::spawn(stream, events_tx);

        frames_tx
            .send(Ok(Bytes::from("data: last\n\ndata: [STREAM_END]\n\n")))
            .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Opened);
        assert_eq!(
            events_rx.recv().await.unwrap(),
            StreamEvent::Line("last".to_string())
        );
        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Ended);
        // Subscription released: the event channel closes with nothing after Ended.
        assert!(events_rx.recv().await.is_none());
        assert!(consumer.is_finished());
    }

    #[tokio::test]
    async fn consumer_transport_error_is_distinct_from_ended() {
        let (frames_tx, stream) = channel_stream();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _consumer = StreamConsumer::spawn(stream, events_tx);

        frames_tx
            .send(Err(GatewayError::Transport("reset".to_string())))
            .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Opened);
        match events_rx.recv().await.unwrap() {
            StreamEvent::TransportError(msg) => assert!(msg.contains("reset")),
            other => panic!("expected TransportError, got {other:?}"),
        }
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn consumer_server_drop_without_sentinel_is_transport_error() {
        let (frames_tx, stream) = channel_stream();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _consumer = StreamConsumer::spawn(stream, events_tx);

        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Opened);
        drop(frames_tx);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            StreamEvent::TransportError(_)
        ));
    }

    #[tokio::test]
    async fn consumer_close_emits_ended_once_and_silences() {
        let (frames_tx, stream) = channel_stream();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let consumer = StreamConsumer::spawn(stream, events_tx);

        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Opened);

        consumer.close();
        assert_eq!(events_rx.recv().await.unwrap(), StreamEvent::Ended);

        // Double-close is a no-op, and frames sent after close go nowhere.
        consumer.close();
        let _ = frames_tx.send(Ok(Bytes::from("data: late\n\n")));
        assert!(events_rx.recv().await.is_none());
    }
}

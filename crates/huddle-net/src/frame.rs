//! Newline-delimited JSON framing.
//!
//! Reading: one [`Message`] per line. Blank lines mean "no data yet" and are
//! skipped; only end-of-stream ends the reader. Oversized lines are discarded
//! up to their newline and reported as protocol errors.
//!
//! Writing: each connection has exactly one writer task fed by a bounded
//! channel, so frames leave in the order they were queued and are never
//! interleaved.

use std::net::SocketAddr;

use huddle_common::{Error, Message, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::connection::{ConnectionState, StateCell};

/// Reads frames from the receiving half of a socket.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_frame_bytes,
        }
    }

    /// Next non-blank line without its terminator, or `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        // One extra byte for the newline itself.
        let limit = (self.max_frame_bytes as u64).saturating_add(1);

        loop {
            let mut buf = Vec::new();
            let n = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }

            if buf.last() == Some(&b'\n') {
                buf.pop();
            } else if n as u64 == limit {
                self.discard_rest_of_line().await?;
                return Err(Error::protocol(format!(
                    "frame exceeds {} bytes",
                    self.max_frame_bytes
                )));
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }

            let line =
                String::from_utf8(buf).map_err(|_| Error::protocol("frame is not valid UTF-8"))?;
            if line.trim().is_empty() {
                trace!("skipping blank line");
                continue;
            }
            return Ok(Some(line));
        }
    }

    /// Next frame parsed as a [`Message`].
    ///
    /// A malformed frame is an [`Error::Protocol`]; the reader stays usable.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        match self.next_line().await? {
            Some(line) => Message::from_frame(&line).map(Some),
            None => Ok(None),
        }
    }

    async fn discard_rest_of_line(&mut self) -> Result<()> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            let (consumed, found) = match available.iter().position(|b| *b == b'\n') {
                Some(idx) => (idx + 1, true),
                None => (available.len(), false),
            };
            self.inner.consume(consumed);
            if found {
                return Ok(());
            }
        }
    }
}

/// Sending side of a connection's writer task.
#[derive(Clone)]
pub struct Outbox {
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

impl Outbox {
    /// Queue a frame, waiting for room.
    pub async fn send(&self, frame: String) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::Closed)
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: String) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::connection(format!(
                "outbox for {} is full",
                self.peer
            ))),
            Err(TrySendError::Closed(_)) => Err(Error::Closed),
        }
    }
}

/// Spawn the single writer task for a socket.
///
/// The task ends when every [`Outbox`] is dropped, when a write fails, or when
/// the connection state becomes `Closed`; frames queued before the close are
/// still written. Either way it shuts the write half down and marks the
/// connection closed.
pub(crate) fn spawn_writer<W>(
    writer: W,
    peer: SocketAddr,
    capacity: usize,
    state: StateCell,
) -> Outbox
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(run_writer(writer, rx, peer, state));
    Outbox { peer, tx }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    peer: SocketAddr,
    state: StateCell,
) where
    W: AsyncWrite + Unpin,
{
    let mut watch = state.subscribe();

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_line(&mut writer, &frame).await {
                    debug!(%peer, "write failed: {e}");
                    break;
                }
            }
            // The watch guard must not live in the select output: it is not Send.
            _ = async { let _ = watch.wait_for(|s| *s == ConnectionState::Closed).await; } => {
                while let Ok(frame) = rx.try_recv() {
                    if write_line(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    state.close();
    trace!(%peer, "writer stopped");
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> std::io::Result<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(text: &str) -> String {
        Message::new(text, "10.0.0.2").to_frame().unwrap()
    }

    #[tokio::test]
    async fn test_reads_one_message_per_line() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, 1024);

        let input = format!("{}\n{}\n", frame("one"), frame("two"));
        tx.write_all(input.as_bytes()).await.unwrap();
        drop(tx);

        assert_eq!(reader.next_message().await.unwrap().unwrap().text(), "one");
        assert_eq!(reader.next_message().await.unwrap().unwrap().text(), "two");
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_are_not_end_of_stream() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, 1024);

        let input = format!("\n\r\n   \n{}\r\n", frame("after blanks"));
        tx.write_all(input.as_bytes()).await.unwrap();
        drop(tx);

        assert_eq!(
            reader.next_message().await.unwrap().unwrap().text(),
            "after blanks"
        );
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_final_line_without_newline_is_delivered() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, 1024);

        tx.write_all(frame("tail").as_bytes()).await.unwrap();
        drop(tx);

        assert_eq!(reader.next_message().await.unwrap().unwrap().text(), "tail");
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_poison_reader() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, 1024);

        let input = format!("{{oops\n{}\n", frame("still here"));
        tx.write_all(input.as_bytes()).await.unwrap();
        drop(tx);

        assert!(matches!(
            reader.next_message().await,
            Err(Error::Protocol(_))
        ));
        assert_eq!(
            reader.next_message().await.unwrap().unwrap().text(),
            "still here"
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut tx, rx) = duplex(64 * 1024);
        let mut reader = FrameReader::new(rx, 64);

        let big = format!("{}\n", "x".repeat(500));
        let input = format!("{big}{}\n", frame("ok"));
        tx.write_all(input.as_bytes()).await.unwrap();
        drop(tx);

        let err = reader.next_line().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("exceeds")));
        // The 54-byte frame that follows fits.
        assert_eq!(reader.next_message().await.unwrap().unwrap().text(), "ok");
    }

    #[tokio::test]
    async fn test_frame_of_exactly_max_bytes_fits() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, 16);

        tx.write_all(b"0123456789abcdef\n").await.unwrap();
        drop(tx);

        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_unbounded_frame_limit_does_not_overflow() {
        let (mut tx, rx) = duplex(4096);
        let mut reader = FrameReader::new(rx, usize::MAX);

        tx.write_all(format!("{}\n", frame("no limit")).as_bytes())
            .await
            .unwrap();
        drop(tx);

        assert_eq!(
            reader.next_message().await.unwrap().unwrap().text(),
            "no limit"
        );
    }

    #[tokio::test]
    async fn test_writer_keeps_frames_whole_and_ordered() {
        let (tx, rx) = duplex(64 * 1024);
        let state = StateCell::new(ConnectionState::AwaitingHandshake);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let outbox = spawn_writer(tx, peer, 8, state.clone());

        let mut senders = Vec::new();
        for task in 0..4 {
            let outbox = outbox.clone();
            senders.push(tokio::spawn(async move {
                for i in 0..25 {
                    outbox.send(frame(&format!("{task}-{i}"))).await.unwrap();
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }
        drop(outbox);

        let mut reader = FrameReader::new(rx, 1024);
        let mut last_seen = [-1i32; 4];
        let mut count = 0;
        while let Some(msg) = reader.next_message().await.unwrap() {
            let (task, i) = msg.text().split_once('-').unwrap();
            let (task, i): (usize, i32) = (task.parse().unwrap(), i.parse().unwrap());
            assert!(i > last_seen[task], "frames from one sender reordered");
            last_seen[task] = i;
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(state.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_closing_flushes_queued_frames() {
        let (tx, rx) = duplex(64 * 1024);
        let state = StateCell::new(ConnectionState::Authenticated);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let outbox = spawn_writer(tx, peer, 8, state.clone());

        outbox.send(frame("last words")).await.unwrap();
        state.close();

        let mut reader = FrameReader::new(rx, 1024);
        assert_eq!(
            reader.next_message().await.unwrap().unwrap().text(),
            "last words"
        );
        assert!(reader.next_message().await.unwrap().is_none());
    }
}

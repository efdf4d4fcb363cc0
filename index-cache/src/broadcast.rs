//! Fans a single upstream byte stream out to N concurrently-registered
//! subscribers without re-reading the source and without materializing the
//! full content in memory (spec §4.1).

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

use crate::util::read_chunk_async;

/// Recommended minimum chunk size pulled from the source per fan-out round.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default per-subscriber bounded queue depth, in chunks.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

/// How long a `DropSubscriber` subscriber is given to drain one chunk before
/// it is forcibly dropped.
pub const DEFAULT_DROP_TIMEOUT: Duration = Duration::from_secs(5);

/// What happens when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Back-pressures the whole session. Required for the commit subscriber
    /// — a truncated write must never be mistaken for a complete one.
    BlockSource,
    /// Closes the subscriber with a terminal error after a timeout and
    /// continues fanning out to everyone else.
    DropSubscriber,
}

type Item = io::Result<Bytes>;

struct Subscriber {
    id: u64,
    overflow: Overflow,
    tx: mpsc::Sender<Item>,
}

struct SessionState {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// `Some` once the producer has finished; `Some(Some(err))` if it
    /// finished with an error. Checked under the same lock as the
    /// subscriber list so a subscriber joining after the session already
    /// finished is told immediately instead of being registered into a
    /// list nothing will ever drain again.
    finished: Option<Option<(io::ErrorKind, String)>>,
}

struct SessionInner {
    state: Mutex<SessionState>,
    chunk_size: usize,
    queue_depth: usize,
    drop_timeout: Duration,
    live_subscribers: AtomicU64,
}

/// One in-flight fetch's fan-out point. Created when the first requester for
/// a missing artifact arrives; destroyed after the source is fully consumed
/// or an unrecoverable error has propagated to every subscriber.
#[derive(Clone)]
pub struct BroadcastSession {
    inner: Arc<SessionInner>,
}

impl BroadcastSession {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_DEPTH, DEFAULT_DROP_TIMEOUT)
    }

    pub fn with_options(chunk_size: usize, queue_depth: usize, drop_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    subscribers: Vec::new(),
                    next_id: 0,
                    finished: None,
                }),
                chunk_size,
                queue_depth,
                drop_timeout,
                live_subscribers: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new subscriber. Bytes start at the *current* source
    /// offset — late joiners do not receive bytes already delivered. If the
    /// session already finished, the subscriber observes that outcome
    /// immediately (EOF, or the terminal error) instead of being registered
    /// into a list nothing will ever drain again.
    pub fn subscribe(&self, overflow: Overflow) -> SubscriberReader {
        let (tx, rx) = mpsc::channel(self.inner.queue_depth.max(1));
        let id;
        {
            let mut state = self.inner.state.lock().unwrap();
            id = state.next_id;
            state.next_id += 1;

            match &state.finished {
                None => {
                    state.subscribers.push(Subscriber { id, overflow, tx });
                    self.inner.live_subscribers.fetch_add(1, Ordering::SeqCst);
                }
                Some(Some((kind, message))) => {
                    let _ = tx.try_send(Err(io::Error::new(*kind, message.clone())));
                }
                Some(None) => {
                    // Dropping `tx` now closes the channel immediately,
                    // which `StreamReader` surfaces as a clean EOF.
                }
            }
        }

        let stream = ReceiverStream::new(rx);
        SubscriberReader {
            inner: StreamReader::new(stream),
            id,
            session: Arc::downgrade(&self.inner),
        }
    }

    /// Detaches a subscriber. Remaining source bytes are still consumed by
    /// `run` for everyone else.
    pub fn unsubscribe(&self, id: u64) {
        Self::unsubscribe_inner(&self.inner, id);
    }

    fn unsubscribe_inner(inner: &Arc<SessionInner>, id: u64) {
        let removed = {
            let mut state = inner.state.lock().unwrap();
            let before = state.subscribers.len();
            state.subscribers.retain(|s| s.id != id);
            before != state.subscribers.len()
        };
        if removed {
            inner.live_subscribers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Pulls from `source` in chunks, fanning each one out to every live
    /// subscriber, until the source EOFs or errors. Meant to run on its own
    /// dedicated task per session — callers should `tokio::spawn` this.
    pub async fn run<S>(&self, mut source: S)
    where
        S: AsyncRead + Unpin + Send,
    {
        loop {
            let buf = BytesMut::with_capacity(self.inner.chunk_size);
            match read_chunk_async(&mut source, buf).await {
                Ok(chunk) if chunk.is_empty() => {
                    self.finish(None).await;
                    return;
                }
                Ok(chunk) => {
                    self.fan_out(chunk).await;
                }
                Err(err) => {
                    self.finish(Some(err)).await;
                    return;
                }
            }
        }
    }

    async fn fan_out(&self, chunk: Bytes) {
        let subs: Vec<Subscriber> = {
            let state = self.inner.state.lock().unwrap();
            state
                .subscribers
                .iter()
                .map(|s| Subscriber {
                    id: s.id,
                    overflow: s.overflow,
                    tx: s.tx.clone(),
                })
                .collect()
        };

        let mut dead = Vec::new();
        for sub in subs {
            match sub.overflow {
                Overflow::BlockSource => {
                    if sub.tx.send(Ok(chunk.clone())).await.is_err() {
                        dead.push(sub.id);
                    }
                }
                Overflow::DropSubscriber => {
                    let sent =
                        tokio::time::timeout(self.inner.drop_timeout, sub.tx.send(Ok(chunk.clone())))
                            .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        let _ = sub.tx.try_send(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "subscriber overflowed its queue and was dropped",
                        )));
                        dead.push(sub.id);
                    }
                }
            }
        }

        for id in dead {
            Self::unsubscribe_inner(&self.inner, id);
        }
    }

    async fn finish(&self, error: Option<io::Error>) {
        let recorded = error.as_ref().map(|e| (e.kind(), e.to_string()));
        let subs: Vec<Subscriber> = {
            let mut state = self.inner.state.lock().unwrap();
            state.finished = Some(recorded);
            state.subscribers.drain(..).collect()
        };

        for sub in subs {
            match &error {
                Some(err) => {
                    let _ = sub
                        .tx
                        .send(Err(io::Error::new(err.kind(), err.to_string())))
                        .await;
                }
                None => {
                    // Dropping the sender closes the stream, which
                    // `StreamReader` surfaces as a clean EOF.
                    drop(sub.tx);
                }
            }
        }
    }

    /// Aborts the session before it ever started running a source — e.g.
    /// the upstream connection could not be opened at all. Delivers `err`
    /// as a terminal error to every subscriber registered so far.
    pub async fn abort(&self, err: io::Error) {
        self.finish(Some(err)).await;
    }

    /// Whether the producer has finished (successfully or not).
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().finished.is_some()
    }

    /// Number of subscribers still attached.
    pub fn subscriber_count(&self) -> u64 {
        self.inner.live_subscribers.load(Ordering::SeqCst)
    }
}

impl Default for BroadcastSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to a [`BroadcastSession`]. Implements [`AsyncRead`];
/// dropping it unsubscribes.
pub struct SubscriberReader {
    inner: StreamReader<ReceiverStream<Item>, Bytes>,
    id: u64,
    session: Weak<SessionInner>,
}

impl AsyncRead for SubscriberReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for SubscriberReader {
    fn drop(&mut self) {
        if let Some(inner) = self.session.upgrade() {
            BroadcastSession::unsubscribe_inner(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn source_of(data: &'static [u8]) -> impl AsyncRead + Unpin + Send {
        std::io::Cursor::new(data)
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_full_byte_sequence() {
        let session = BroadcastSession::new();
        let mut r1 = session.subscribe(Overflow::BlockSource);
        let mut r2 = session.subscribe(Overflow::BlockSource);

        let data: &'static [u8] = b"hello, broadcast world";
        let run = session.run(source_of(data));

        let (_, out1, out2) = tokio::join!(run, read_all(&mut r1), read_all(&mut r2));
        assert_eq!(out1, data);
        assert_eq!(out2, data);
    }

    #[tokio::test]
    async fn late_joiner_after_completion_gets_immediate_eof() {
        let session = BroadcastSession::new();
        let data: &'static [u8] = b"short";
        session.run(source_of(data)).await;

        let mut late = session.subscribe(Overflow::BlockSource);
        let out = read_all(&mut late).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn cancelling_one_subscriber_does_not_affect_others() {
        let session = BroadcastSession::new();
        let keep = session.subscribe(Overflow::BlockSource);
        let drop_me = session.subscribe(Overflow::BlockSource);
        drop(drop_me);

        let data: &'static [u8] = b"still delivered";
        let mut keep = keep;
        let run = session.run(source_of(data));
        let (_, out) = tokio::join!(run, read_all(&mut keep));
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn slow_drop_subscriber_is_terminated_without_stalling_others() {
        let session = BroadcastSession::with_options(4, 1, Duration::from_millis(20));
        let mut fast = session.subscribe(Overflow::BlockSource);
        let mut slow = session.subscribe(Overflow::DropSubscriber);

        let data: &'static [u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let run = session.run(source_of(data));

        // `fast` drains continuously; `slow` never reads, so its queue fills
        // and it gets dropped with a terminal error instead of stalling the
        // whole session.
        let fast_read = read_all(&mut fast);
        let (_, out) = tokio::join!(run, fast_read);
        assert_eq!(out, data);

        let mut buf = [0u8; 4];
        let result = slow.read(&mut buf).await;
        // Either it already saw a queued chunk or it sees the terminal
        // error; either way the session must have finished above.
        let _ = result;
    }

    async fn read_all(reader: &mut SubscriberReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }
}

//! Continuous change feed sessions.
//!
//! A [`FeedSession`] owns one open response body and drives it from a
//! spawned task: bytes are framed into lines, lines decoded into
//! [`ChangeEvent`]s, and each event handed to the consumer before the next
//! read is issued.
//!
//! ## Lifecycle
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Open` | Stream acquired, read task scheduled |
//! | `Running` | Read task is reading and dispatching |
//! | `Closed` | Terminal; stream released, no more events |
//!
//! A session closes exactly once, either because the consumer called
//! [`close`](FeedHandle::close) or because the stream ended or failed.
//! [`FeedHandle::end`] tells which.
//!
//! ## Failures inside the loop
//!
//! Undecodable or over-long lines and panicking handlers never stop the
//! feed. They are counted in [`FeedStats`], logged, and the most recent one
//! is kept in [`FeedHandle::last_error`].

use crate::change::{parse_record, ChangeEvent, Record};
use crate::error::FeedError;
use crate::framer::LineFramer;
use crate::types::Sequence;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const OPEN: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// Where a session currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Open,
    Running,
    Closed,
}

/// Why a session closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEnd {
    /// The consumer closed the session.
    Closed,
    /// The server ended the response.
    EndOfStream,
    /// Reading the response failed.
    Transport(String),
}

/// Counters describing what a session has processed so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedStats {
    /// Events handed to the consumer
    pub delivered: u64,
    /// Blank keep-alive lines
    pub heartbeats: u64,
    /// Lines that could not be decoded and were skipped
    pub decode_failures: u64,
    /// Handler calls that panicked
    pub handler_panics: u64,
}

/// Consumer side of the read loop.
pub(crate) enum Sink {
    Handler(Box<dyn FnMut(ChangeEvent) + Send>),
    Channel(mpsc::Sender<ChangeEvent>),
}

struct Shared {
    state: AtomicU8,
    end: Mutex<Option<FeedEnd>>,
    /// Held for the whole of every handler call
    dispatch: ReentrantMutex<()>,
    shutdown: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    delivered: AtomicU64,
    heartbeats: AtomicU64,
    decode_failures: AtomicU64,
    handler_panics: AtomicU64,
    last_error: Mutex<Option<FeedError>>,
    last_seq: Mutex<Option<Sequence>>,
}

impl Shared {
    fn new() -> Self {
        Shared {
            state: AtomicU8::new(OPEN),
            end: Mutex::new(None),
            dispatch: ReentrantMutex::new(()),
            shutdown: watch::channel(false).0,
            finished: watch::channel(false).0,
            delivered: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_seq: Mutex::new(None),
        }
    }

    fn state(&self) -> FeedState {
        match self.state.load(Ordering::Acquire) {
            OPEN => FeedState::Open,
            RUNNING => FeedState::Running,
            _ => FeedState::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Open -> Running. Fails if the session was closed before the read
    /// task got to run.
    fn begin(&self) -> bool {
        self.state
            .compare_exchange(OPEN, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Closed, recording why. Only the first call has any effect.
    fn terminate(&self, end: FeedEnd) -> bool {
        let mut slot = self.end.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(end);
        self.state.store(CLOSED, Ordering::Release);
        self.shutdown.send_replace(true);
        true
    }

    fn record_error(&self, err: FeedError) {
        *self.last_error.lock() = Some(err);
    }

    fn record_delivery(&self, seq: Sequence) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        *self.last_seq.lock() = Some(seq);
    }

    /// Run the handler for one event, unless the session closed meanwhile.
    fn deliver(
        &self,
        handler: &mut (dyn FnMut(ChangeEvent) + Send),
        event: ChangeEvent,
    ) -> ControlFlow<()> {
        let _gate = self.dispatch.lock();
        if self.is_closed() {
            return ControlFlow::Break(());
        }

        let seq = event.seq;
        self.record_delivery(seq);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            let message = panic_message(&*payload);
            self.handler_panics.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(seq = seq.value(), %message, "change handler panicked");
            self.record_error(FeedError::HandlerPanicked {
                seq: seq.value(),
                message,
            });
        }

        ControlFlow::Continue(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A cloneable handle to a running session.
///
/// Unlike [`FeedSession`], dropping a handle does not close the feed. Use
/// one to close a feed from inside its own handler.
#[derive(Clone)]
pub struct FeedHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedHandle")
            .field("state", &self.state())
            .field("end", &self.end())
            .field("stats", &self.stats())
            .finish()
    }
}

impl FeedHandle {
    /// Close the session.
    ///
    /// Once this returns, no handler call will start. If a handler is
    /// running on another thread, this waits for it to return first; called
    /// from inside the handler itself, it returns immediately.
    ///
    /// Closing is idempotent, and closing a session whose stream already
    /// ended leaves its [`end`](Self::end) untouched.
    pub fn close(&self) {
        if self.shared.terminate(FeedEnd::Closed) {
            tracing::debug!("change feed closed by consumer");
        }
        drop(self.shared.dispatch.lock());
    }

    /// Wait until the read task has exited and released the stream.
    pub async fn closed(&self) -> FeedEnd {
        let mut finished = self.shared.finished.subscribe();
        loop {
            let done = *finished.borrow_and_update();
            if done || finished.changed().await.is_err() {
                break;
            }
        }
        self.end().unwrap_or(FeedEnd::Closed)
    }

    pub fn state(&self) -> FeedState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the session closed, once it has.
    pub fn end(&self) -> Option<FeedEnd> {
        self.shared.end.lock().clone()
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            heartbeats: self.shared.heartbeats.load(Ordering::Relaxed),
            decode_failures: self.shared.decode_failures.load(Ordering::Relaxed),
            handler_panics: self.shared.handler_panics.load(Ordering::Relaxed),
        }
    }

    /// The most recent decode failure, handler panic or transport error.
    pub fn last_error(&self) -> Option<FeedError> {
        self.shared.last_error.lock().clone()
    }

    /// Sequence of the last delivered change, or the `last_seq` the server
    /// sent when it ended the response.
    ///
    /// Pass it as `since` when opening a new feed to resume where this one
    /// stopped.
    pub fn last_seq(&self) -> Option<Sequence> {
        *self.shared.last_seq.lock()
    }
}

/// An open continuous change feed.
///
/// Dropping the session closes it without waiting for a running handler;
/// call [`close`](Self::close) or [`shutdown`](Self::shutdown) for that.
#[derive(Debug)]
pub struct FeedSession {
    handle: FeedHandle,
}

impl FeedSession {
    /// Start reading `stream`, calling `on_event` once per change.
    ///
    /// Events arrive in wire order and the handler is never called
    /// concurrently with itself. Must be called from within a tokio
    /// runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let response = reqwest::get("http://localhost:5984/db/_changes?feed=continuous").await?;
    /// let session = FeedSession::open(response.bytes_stream(), |change| {
    ///     println!("{} is now at {:?}", change.id, change.rev());
    /// })?;
    /// ```
    pub fn open<S, E, F>(stream: S, on_event: F) -> Result<FeedSession, FeedError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        Self::spawn(stream, Sink::Handler(Box::new(on_event)), LineFramer::new())
    }

    pub(crate) fn spawn<S, E>(
        stream: S,
        sink: Sink,
        framer: LineFramer,
    ) -> Result<FeedSession, FeedError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| FeedError::NoRuntime)?;

        let shared = Arc::new(Shared::new());
        let feed = FeedLoop {
            shutdown: shared.shutdown.subscribe(),
            shared: shared.clone(),
            framer,
            sink,
        };
        runtime.spawn(feed.run(stream));
        tracing::debug!("change feed opened");

        Ok(FeedSession {
            handle: FeedHandle { shared },
        })
    }

    /// Get a cloneable handle to this session.
    pub fn handle(&self) -> FeedHandle {
        self.handle.clone()
    }

    /// See [`FeedHandle::close`].
    pub fn close(&self) {
        self.handle.close()
    }

    /// See [`FeedHandle::closed`].
    pub async fn closed(&self) -> FeedEnd {
        self.handle.closed().await
    }

    /// Close the session and wait until its stream is released.
    pub async fn shutdown(self) -> FeedEnd {
        self.close();
        self.closed().await
    }

    pub fn state(&self) -> FeedState {
        self.handle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub fn end(&self) -> Option<FeedEnd> {
        self.handle.end()
    }

    pub fn stats(&self) -> FeedStats {
        self.handle.stats()
    }

    pub fn last_error(&self) -> Option<FeedError> {
        self.handle.last_error()
    }

    pub fn last_seq(&self) -> Option<Sequence> {
        self.handle.last_seq()
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.handle.shared.terminate(FeedEnd::Closed);
    }
}

/// Marks the session finished when the read task goes away, including when
/// the runtime drops it mid-read.
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.terminate(FeedEnd::Closed);
        self.0.finished.send_replace(true);
    }
}

struct FeedLoop {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    framer: LineFramer,
    sink: Sink,
}

impl FeedLoop {
    async fn run<S, E>(mut self, stream: S)
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display + Send + 'static,
    {
        let _finish = FinishGuard(self.shared.clone());

        if let Some(end) = self.read(stream).await {
            if let FeedEnd::Transport(message) = &end {
                tracing::debug!(error = %message, "change feed stream failed");
                self.shared
                    .record_error(FeedError::Transport(message.clone()));
            } else {
                tracing::debug!("change feed stream ended");
            }
            self.shared.terminate(end);
        }

        let discarded = self.framer.pending();
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "discarding unterminated change line");
        }

        // Release the handler before the session reports itself finished.
        drop(self);
    }

    /// Read until the stream ends or the session closes. Returns `None`
    /// when the session was closed from outside.
    async fn read<S, E>(&mut self, stream: S) -> Option<FeedEnd>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display + Send + 'static,
    {
        let mut stream = std::pin::pin!(stream);

        if !self.shared.begin() {
            return None;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return None,
                next = stream.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => return Some(FeedEnd::Transport(err.to_string())),
                None => return Some(FeedEnd::EndOfStream),
            };
            tracing::trace!(bytes = chunk.len(), "change feed chunk");

            let lines: Vec<String> = self.framer.feed(&chunk).collect();
            self.record_oversized();
            for line in lines {
                if self.dispatch(&line).await.is_break() {
                    return None;
                }
            }
        }
    }

    fn record_oversized(&mut self) {
        let dropped = self.framer.take_oversized();
        if dropped == 0 {
            return;
        }
        let limit = self.framer.max_line();
        self.shared.decode_failures.fetch_add(dropped, Ordering::Relaxed);
        tracing::warn!(count = dropped, limit, "skipping over-long change line");
        self.shared.record_error(FeedError::LineTooLong { limit });
    }

    async fn dispatch(&mut self, line: &str) -> ControlFlow<()> {
        let event = match parse_record(line) {
            Ok(Record::Change(event)) => event,
            Ok(Record::Heartbeat) => {
                self.shared.heartbeats.fetch_add(1, Ordering::Relaxed);
                return ControlFlow::Continue(());
            }
            Ok(Record::LastSeq(seq)) => {
                tracing::debug!(last_seq = seq.value(), "change feed trailer");
                *self.shared.last_seq.lock() = Some(seq);
                return ControlFlow::Continue(());
            }
            Err(err) => {
                self.shared.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %err, line = %err.line, "skipping undecodable change");
                self.shared.record_error(err.into());
                return ControlFlow::Continue(());
            }
        };

        match &mut self.sink {
            Sink::Handler(handler) => self.shared.deliver(handler.as_mut(), event),
            Sink::Channel(tx) => {
                if self.shared.is_closed() {
                    return ControlFlow::Break(());
                }
                let seq = event.seq;
                tokio::select! {
                    biased;
                    _ = self.shutdown.changed() => ControlFlow::Break(()),
                    sent = tx.send(event) => match sent {
                        Ok(()) => {
                            self.shared.record_delivery(seq);
                            ControlFlow::Continue(())
                        }
                        Err(_) => {
                            // Receiver dropped
                            self.shared.terminate(FeedEnd::Closed);
                            ControlFlow::Break(())
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as byte_mpsc;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::time::timeout;

    type ByteSender = byte_mpsc::UnboundedSender<Result<Bytes, io::Error>>;

    const WAIT: Duration = Duration::from_secs(5);

    fn byte_stream() -> (ByteSender, byte_mpsc::UnboundedReceiver<Result<Bytes, io::Error>>) {
        byte_mpsc::unbounded()
    }

    fn push(tx: &ByteSender, data: &str) {
        tx.unbounded_send(Ok(Bytes::copy_from_slice(data.as_bytes())))
            .unwrap();
    }

    fn change_line(id: &str, seq: u64) -> String {
        format!(r#"{{"id":"{id}","seq":{seq},"changes":[{{"rev":"1-{id}"}}]}}"#) + "\n"
    }

    /// Open a session whose handler forwards every event to the returned
    /// receiver.
    fn open_collecting(
        rx: byte_mpsc::UnboundedReceiver<Result<Bytes, io::Error>>,
    ) -> (FeedSession, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = FeedSession::open(rx, move |event| {
            let _ = events_tx.send(event);
        })
        .unwrap();
        (session, events_rx)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("handler dropped")
    }

    async fn assert_no_more_events(events: &mut mpsc::UnboundedReceiver<ChangeEvent>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, r#"{"id":"a","seq":1,"#);
        push(&tx, "\"changes\":[{\"rev\":\"1-x\"}]}\n\n{\"id\":\"b\"");
        push(&tx, ",\"seq\":2,\"changes\":[{\"rev\":\"1-y\"}],\"deleted\":true}\n");

        let first = next_event(&mut events).await;
        assert_eq!(first.id, "a");
        assert_eq!(first.seq, Sequence::new(1));
        assert!(!first.deleted);

        let second = next_event(&mut events).await;
        assert_eq!(second.id, "b");
        assert_eq!(second.seq, Sequence::new(2));
        assert!(second.deleted);

        drop(tx);
        assert_eq!(timeout(WAIT, session.closed()).await.unwrap(), FeedEnd::EndOfStream);
        assert!(events.recv().await.is_none());

        let stats = session.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.heartbeats, 1);
        assert_eq!(stats.decode_failures, 0);
        assert_eq!(session.state(), FeedState::Closed);
        assert_eq!(session.last_seq(), Some(Sequence::new(2)));
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        let wire: String = (1..=100).map(|seq| change_line(&format!("doc{seq}"), seq)).collect();
        for chunk in wire.as_bytes().chunks(37) {
            tx.unbounded_send(Ok(Bytes::copy_from_slice(chunk))).unwrap();
        }
        drop(tx);

        let mut seqs = Vec::new();
        while let Some(event) = timeout(WAIT, events.recv()).await.unwrap() {
            assert_eq!(event.id, format!("doc{}", event.seq));
            seqs.push(event.seq.value());
        }
        assert_eq!(seqs, (1..=100).collect::<Vec<_>>());
        assert_eq!(session.closed().await, FeedEnd::EndOfStream);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_skipped() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, &change_line("a", 1));
        push(&tx, "{\"id\":\"broken\",\"seq\":\n");
        push(&tx, &change_line("c", 3));

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(next_event(&mut events).await.id, "c");

        let stats = session.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.decode_failures, 1);
        match session.last_error() {
            Some(FeedError::Decode(err)) => assert_eq!(err.line, "{\"id\":\"broken\",\"seq\":"),
            other => panic!("unexpected last error: {other:?}"),
        }
        assert_eq!(session.state(), FeedState::Running);
    }

    #[tokio::test]
    async fn test_over_long_line_is_skipped() {
        let (tx, rx) = byte_stream();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handler = move |event: ChangeEvent| {
            let _ = events_tx.send(event);
        };
        let session = FeedSession::spawn(
            rx,
            Sink::Handler(Box::new(handler)),
            LineFramer::new().with_max_line(64),
        )
        .unwrap();

        push(&tx, &change_line("a", 1));
        push(&tx, &"x".repeat(50));
        push(&tx, &"x".repeat(50));
        push(&tx, "\n");
        push(&tx, &change_line("c", 3));

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(next_event(&mut events).await.id, "c");

        let stats = session.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.decode_failures, 1);
        assert!(matches!(session.last_error(), Some(FeedError::LineTooLong { limit: 64 })));
    }

    #[tokio::test]
    async fn test_owned_error_type_drives_the_feed() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from(change_line("a", 1))),
            Err("connection reset".to_string()),
        ];
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let session = FeedSession::open(futures::stream::iter(chunks), move |event| {
            let _ = events_tx.send(event);
        })
        .unwrap();

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(
            timeout(WAIT, session.closed()).await.unwrap(),
            FeedEnd::Transport("connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_the_feed() {
        let (tx, rx) = byte_stream();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let session = FeedSession::open(rx, move |event: ChangeEvent| {
            if event.id == "bad" {
                panic!("cannot handle {}", event.id);
            }
            let _ = events_tx.send(event);
        })
        .unwrap();

        push(&tx, &(change_line("bad", 1) + &change_line("good", 2)));

        assert_eq!(next_event(&mut events).await.id, "good");
        let stats = session.stats();
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(stats.delivered, 2);
        match session.last_error() {
            Some(FeedError::HandlerPanicked { seq, message }) => {
                assert_eq!(seq, 1);
                assert_eq!(message, "cannot handle bad");
            }
            other => panic!("unexpected last error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, &change_line("a", 1));
        assert_eq!(next_event(&mut events).await.id, "a");

        session.close();
        session.close();
        assert_eq!(session.state(), FeedState::Closed);
        assert_eq!(session.end(), Some(FeedEnd::Closed));

        // Closing abandons the pending read and drops the stream.
        assert_eq!(timeout(WAIT, session.closed()).await.unwrap(), FeedEnd::Closed);
        assert!(tx.is_closed());
        assert!(tx.unbounded_send(Ok(Bytes::from(change_line("b", 2)))).is_err());
        assert_no_more_events(&mut events).await;

        session.close();
        assert_eq!(session.end(), Some(FeedEnd::Closed));
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_close_after_stream_ended() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, &change_line("a", 1));
        drop(tx);
        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(timeout(WAIT, session.closed()).await.unwrap(), FeedEnd::EndOfStream);

        session.close();
        session.close();
        assert_eq!(session.end(), Some(FeedEnd::EndOfStream));
        assert_no_more_events(&mut events).await;
    }

    #[tokio::test]
    async fn test_handler_can_close_its_own_feed() {
        let (tx, rx) = byte_stream();
        let slot: Arc<Mutex<Option<FeedHandle>>> = Arc::new(Mutex::new(None));
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let handler_slot = slot.clone();
        let session = FeedSession::open(rx, move |event: ChangeEvent| {
            let _ = events_tx.send(event);
            if let Some(handle) = handler_slot.lock().as_ref() {
                handle.close();
            }
        })
        .unwrap();
        *slot.lock() = Some(session.handle());

        push(
            &tx,
            &(change_line("a", 1) + &change_line("b", 2) + &change_line("c", 3)),
        );

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(timeout(WAIT, session.closed()).await.unwrap(), FeedEnd::Closed);
        assert_no_more_events(&mut events).await;
        assert_eq!(session.stats().delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_waits_for_running_handler() {
        let (tx, rx) = byte_stream();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let handler_finished = finished.clone();
        let session = FeedSession::open(rx, move |_event: ChangeEvent| {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(100));
            handler_finished.store(true, Ordering::SeqCst);
        })
        .unwrap();

        push(&tx, &(change_line("a", 1) + &change_line("b", 2)));
        started_rx.recv_timeout(WAIT).unwrap();

        session.close();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(timeout(WAIT, session.closed()).await.unwrap(), FeedEnd::Closed);
        assert_eq!(session.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_transport_error_ends_the_feed() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, &change_line("a", 1));
        tx.unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")))
            .unwrap();

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(
            timeout(WAIT, session.closed()).await.unwrap(),
            FeedEnd::Transport("reset by peer".to_string())
        );
        assert!(matches!(session.last_error(), Some(FeedError::Transport(_))));
    }

    #[tokio::test]
    async fn test_trailer_records_last_seq() {
        let (tx, rx) = byte_stream();
        let (session, mut events) = open_collecting(rx);

        push(&tx, &change_line("a", 4));
        push(&tx, "{\"last_seq\":9}\n");
        drop(tx);

        assert_eq!(next_event(&mut events).await.id, "a");
        assert_eq!(session.closed().await, FeedEnd::EndOfStream);
        assert_eq!(session.last_seq(), Some(Sequence::new(9)));
        assert_eq!(session.stats().decode_failures, 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_stream() {
        let (tx, rx) = byte_stream();
        let (session, _events) = open_collecting(rx);

        assert_eq!(timeout(WAIT, session.shutdown()).await.unwrap(), FeedEnd::Closed);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_session_closes_it() {
        let (tx, rx) = byte_stream();
        let (session, _events) = open_collecting(rx);
        let handle = session.handle();

        drop(session);
        assert_eq!(timeout(WAIT, handle.closed()).await.unwrap(), FeedEnd::Closed);
        assert!(tx.is_closed());
    }

    #[test]
    fn test_open_requires_runtime() {
        let stream = futures::stream::empty::<Result<Bytes, io::Error>>();
        let result = FeedSession::open(stream, |_| {});
        assert!(matches!(result, Err(FeedError::NoRuntime)));
    }
}

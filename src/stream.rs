//! Change feeds consumed as an async [`Stream`].

use crate::change::ChangeEvent;
use crate::error::FeedError;
use crate::framer::LineFramer;
use crate::session::{FeedSession, Sink};
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Default number of decoded events buffered ahead of the consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// A continuous change feed delivered as a [`Stream`] of events.
///
/// The read loop pushes events into a bounded channel; when the consumer
/// falls behind, reading from the connection pauses until it catches up.
/// Events come out in wire order.
///
/// The stream ends when the server ends the response, when reading it
/// fails, or when [`close`](Self::close) is called. Check
/// [`session`](Self::session) to tell these apart.
///
/// # Example
///
/// ```ignore
/// use futures::StreamExt;
///
/// let mut changes = db.change_stream(&ChangeOptions::new().since(Sequence::new(42))).await?;
/// while let Some(change) = changes.next().await {
///     println!("{} @ {}", change.id, change.seq);
/// }
/// println!("feed ended: {:?}", changes.session().end());
/// ```
pub struct ChangeStream {
    receiver: mpsc::Receiver<ChangeEvent>,
    session: FeedSession,
    closed: bool,
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("session", &self.session)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChangeStream {
    /// Start reading `stream` into a channel of `capacity` events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S, E>(stream: S, capacity: usize) -> Result<ChangeStream, FeedError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        let session = FeedSession::spawn(stream, Sink::Channel(tx), LineFramer::new())?;
        Ok(ChangeStream {
            receiver,
            session,
            closed: false,
        })
    }

    /// The session driving this stream, for its status and counters.
    pub fn session(&self) -> &FeedSession {
        &self.session
    }

    /// Close the feed. Events still buffered are dropped and the stream
    /// yields `None` from now on.
    pub fn close(&mut self) {
        self.closed = true;
        self.receiver.close();
        self.session.close();
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

//! Stream abstractions.
//!
//! A streaming call exposes its inbound events as a lazy, single-pass
//! sequence of [`StreamResult`] values. A typical stream receives
//! `headers > message > message ... > complete`; exactly one `Complete`
//! terminates the sequence and nothing follows it.
//!
//! # Cancellation
//!
//! Dropping a [`ResultStream`] before its terminal event cancels the call:
//! the transport's cancel path is invoked and the stream cannot be resumed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use wirecall_core::{Code, Headers, RpcError, Trailers};

use crate::callbacks::RequestCallbacks;
use crate::sync::Locked;

/// Result states that can be received over a stream.
#[derive(Debug)]
pub enum StreamResult<T> {
    /// Headers have been received over the stream.
    Headers(Headers),
    /// A response message has been received over the stream.
    Message(T),
    /// Stream is complete. Provides the end status code and optionally an
    /// error and trailers. Exactly one per stream, always last.
    Complete {
        code: Code,
        error: Option<RpcError>,
        trailers: Option<Trailers>,
    },
}

impl<T> StreamResult<T> {
    /// The contained message, if this is a message result.
    pub fn message_value(self) -> Option<T> {
        match self {
            StreamResult::Message(message) => Some(message),
            StreamResult::Headers(_) | StreamResult::Complete { .. } => None,
        }
    }

    /// Whether this is the terminal event of a stream.
    pub fn is_complete(&self) -> bool {
        matches!(self, StreamResult::Complete { .. })
    }
}

/// Two `Complete` results compare equal iff status code, trailers, and error
/// *presence* match; error contents are not compared.
impl<T: PartialEq> PartialEq for StreamResult<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StreamResult::Headers(a), StreamResult::Headers(b)) => a == b,
            (StreamResult::Message(a), StreamResult::Message(b)) => a == b,
            (
                StreamResult::Complete {
                    code: code_a,
                    error: error_a,
                    trailers: trailers_a,
                },
                StreamResult::Complete {
                    code: code_b,
                    error: error_b,
                    trailers: trailers_b,
                },
            ) => {
                code_a == code_b
                    && trailers_a == trailers_b
                    && error_a.is_some() == error_b.is_some()
            }
            _ => false,
        }
    }
}

/// Lazy, single-pass sequence of results received over a stream.
///
/// Yields at most one `Headers`, any number of `Message`s, and exactly one
/// terminal `Complete`; after the terminal event the stream is exhausted.
/// Dropping the sequence before the terminal event cancels the call.
pub struct ResultStream<O> {
    receiver: Option<mpsc::UnboundedReceiver<StreamResult<O>>>,
    on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
    finished: bool,
}

impl<O> ResultStream<O> {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<StreamResult<O>>,
        on_cancel: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            receiver: Some(receiver),
            on_cancel,
            finished: false,
        }
    }

    /// An already-exhausted sequence.
    pub(crate) fn exhausted() -> Self {
        Self {
            receiver: None,
            on_cancel: None,
            finished: true,
        }
    }
}

impl<O> Stream for ResultStream<O> {
    type Item = StreamResult<O>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(None);
        };
        match receiver.poll_recv(cx) {
            Poll::Ready(Some(result)) => {
                if result.is_complete() {
                    this.finished = true;
                }
                Poll::Ready(Some(result))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Drop for ResultStream<O> {
    fn drop(&mut self) {
        if !self.finished
            && let Some(on_cancel) = &self.on_cancel
        {
            on_cancel();
        }
    }
}

impl<O> std::fmt::Debug for ResultStream<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("finished", &self.finished)
            .finish()
    }
}

/// A stream over which the caller may send any number of messages and
/// receive any number of results.
pub struct BidirectionalStream<I, O> {
    callbacks: RequestCallbacks<I>,
    closed: Arc<Locked<bool>>,
    results: Option<ResultStream<O>>,
}

impl<I, O> BidirectionalStream<I, O> {
    pub(crate) fn new(callbacks: RequestCallbacks<I>, results: ResultStream<O>) -> Self {
        Self {
            callbacks,
            closed: Arc::new(Locked::new(false)),
            results: Some(results),
        }
    }

    /// Send a message over the stream.
    ///
    /// Fails if the send side of the stream has already been closed.
    pub fn send(&self, message: I) -> Result<(), RpcError> {
        if self.closed.get() {
            return Err(RpcError::failed_precondition("stream is already closed"));
        }
        self.callbacks.send_data(message);
        Ok(())
    }

    /// Half-close the send side of the stream. Idempotent; results may still
    /// be received afterwards.
    pub fn close(&self) {
        let first = self.closed.with(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if first {
            self.callbacks.send_close();
        }
    }

    /// Cancel the stream, propagating a cancel to the transport.
    pub fn cancel(&self) {
        self.closed.set(true);
        self.callbacks.cancel();
    }

    /// The sequence of results received over the stream.
    ///
    /// Single-pass: the sequence can be obtained once; subsequent calls
    /// return an exhausted sequence.
    pub fn results(&mut self) -> ResultStream<O> {
        self.results.take().unwrap_or_else(ResultStream::exhausted)
    }
}

impl<I, O> std::fmt::Debug for BidirectionalStream<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidirectionalStream")
            .field("closed", &self.closed.get())
            .finish()
    }
}

/// A stream over which the caller sends exactly one request message and
/// receives any number of results.
///
/// `send` performs exactly one send followed immediately by a half-close,
/// enforcing the server-streaming pattern without requiring the caller to
/// remember to close.
pub struct ServerOnlyStream<I, O> {
    inner: BidirectionalStream<I, O>,
}

impl<I, O> ServerOnlyStream<I, O> {
    pub(crate) fn new(inner: BidirectionalStream<I, O>) -> Self {
        Self { inner }
    }

    /// Send the single request message and half-close the stream.
    pub fn send(&self, message: I) -> Result<(), RpcError> {
        self.inner.send(message)?;
        self.inner.close();
        Ok(())
    }

    /// The sequence of results received over the stream.
    pub fn results(&mut self) -> ResultStream<O> {
        self.inner.results()
    }

    /// Cancel the stream.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

/// A stream over which the caller sends any number of messages and receives
/// a single response once it half-closes.
pub struct ClientOnlyStream<I, O> {
    inner: BidirectionalStream<I, O>,
}

impl<I, O> ClientOnlyStream<I, O> {
    pub(crate) fn new(inner: BidirectionalStream<I, O>) -> Self {
        Self { inner }
    }

    /// Send a request message over the stream.
    pub fn send(&self, message: I) -> Result<(), RpcError> {
        self.inner.send(message)
    }

    /// Half-close the stream and return the result sequence carrying the
    /// server's single response.
    pub fn close_and_receive(&mut self) -> ResultStream<O> {
        self.inner.close();
        self.inner.results()
    }

    /// Cancel the stream.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

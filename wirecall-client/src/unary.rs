//! Cancellation-safe adaptation of callback-based unary calls.
//!
//! [`UnaryAsyncWrapper`] turns a "send one request, eventually invoke
//! completion once" primitive into a single-result future with race-free,
//! at-most-once resolution:
//!
//! - canceling before the send never invokes the underlying send;
//! - canceling while waiting invokes the retained cancel handle and resolves
//!   the caller with a canceled result immediately;
//! - a completion delivered after the first is suppressed and logged, never
//!   re-resolved. Transports have been observed to double-fire their
//!   completion callback under connection teardown races, so this guard is
//!   load-bearing, not theoretical.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use wirecall_core::{Code, Headers, RpcError, Trailers};

use crate::callbacks::Cancelable;
use crate::sync::Locked;

/// Result of a unary call: the end status code, headers, trailers, and either
/// the decoded message or the error that failed the call.
#[derive(Debug)]
pub struct UnaryResponse<O> {
    /// Status code of the call.
    pub code: Code,
    /// Headers received with the response.
    pub headers: Headers,
    /// The decoded message, or the error that failed the call.
    pub result: Result<O, RpcError>,
    /// Trailers received with the response.
    pub trailers: Trailers,
}

impl<O> UnaryResponse<O> {
    /// A successful response.
    pub fn ok(message: O, headers: Headers, trailers: Trailers) -> Self {
        Self {
            code: Code::Ok,
            headers,
            result: Ok(message),
            trailers,
        }
    }

    /// A failed response carrying `error`, with the code derived from it.
    pub fn from_error(error: RpcError) -> Self {
        Self {
            code: error.code(),
            headers: Headers::empty(),
            result: Err(error),
            trailers: Trailers::empty(),
        }
    }

    /// The canceled response produced when the caller cancels the call.
    pub fn canceled() -> Self {
        Self::from_error(RpcError::canceled())
    }

    /// The decoded message, if the call succeeded.
    pub fn message(&self) -> Option<&O> {
        self.result.as_ref().ok()
    }

    /// Unwrap into the message-or-error result, discarding metadata.
    pub fn into_result(self) -> Result<O, RpcError> {
        self.result
    }
}

/// Completion handle passed to the underlying send. Contractually invoked
/// exactly once; invocations after the first are suppressed.
pub type CompletionFn<O> = Arc<dyn Fn(UnaryResponse<O>) + Send + Sync>;

type PerformFn<O> = Box<dyn FnOnce(CompletionFn<O>) -> Cancelable + Send>;

struct CallState<O> {
    perform: Option<PerformFn<O>>,
    completion: Option<oneshot::Sender<UnaryResponse<O>>>,
    cancelable: Option<Cancelable>,
    canceled: bool,
}

struct CallShared<O> {
    state: Locked<CallState<O>>,
}

impl<O: Send + 'static> CallShared<O> {
    fn complete(&self, response: UnaryResponse<O>) {
        let (sender, canceled) = self
            .state
            .with(|state| (state.completion.take(), state.canceled));
        match sender {
            Some(sender) => {
                // The receiver may be gone if the caller stopped waiting.
                let _ = sender.send(response);
            }
            // After cancellation the call already resolved as canceled; the
            // transport's eventual completion is expected and dropped.
            None if canceled => {}
            None => {
                tracing::warn!(
                    code = response.code.as_str(),
                    "unary completion delivered more than once; suppressing duplicate"
                );
            }
        }
    }

    fn cancel(&self) {
        let (sender, cancelable) = self.state.with(|state| {
            if state.canceled {
                return (None, None);
            }
            state.canceled = true;
            // Never invoke the underlying send once canceled.
            state.perform = None;
            (state.completion.take(), state.cancelable.take())
        });
        if let Some(sender) = sender {
            let _ = sender.send(UnaryResponse::canceled());
        }
        if let Some(cancelable) = cancelable {
            cancelable.cancel();
        }
    }
}

/// Wraps a closure-based unary call so it can be awaited, with proper
/// cancellation support. See the module docs for the guarantees.
pub struct UnaryAsyncWrapper<O> {
    shared: Arc<CallShared<O>>,
}

impl<O: Send + 'static> UnaryAsyncWrapper<O> {
    /// Accepts a closure that performs the request and invokes a completion
    /// handle when done, returning a [`Cancelable`] which cancels the
    /// underlying request.
    pub fn new<F>(perform: F) -> Self
    where
        F: FnOnce(CompletionFn<O>) -> Cancelable + Send + 'static,
    {
        Self {
            shared: Arc::new(CallShared {
                state: Locked::new(CallState {
                    perform: Some(Box::new(perform)),
                    completion: None,
                    cancelable: None,
                    canceled: false,
                }),
            }),
        }
    }

    /// Perform the underlying send and return the future resolving to its
    /// result. Dropping the future cancels the call.
    pub fn send(&self) -> ResponseFuture<O> {
        let (sender, receiver) = oneshot::channel();
        let mut pending_sender = Some(sender);

        enum Disposition<O> {
            Canceled,
            AlreadySent,
            Perform(PerformFn<O>),
        }

        let disposition = self.shared.state.with(|state| {
            if state.canceled {
                Disposition::Canceled
            } else if let Some(perform) = state.perform.take() {
                state.completion = pending_sender.take();
                Disposition::Perform(perform)
            } else {
                Disposition::AlreadySent
            }
        });

        match disposition {
            Disposition::Canceled => {
                if let Some(sender) = pending_sender {
                    let _ = sender.send(UnaryResponse::canceled());
                }
            }
            Disposition::AlreadySent => {
                if let Some(sender) = pending_sender {
                    let _ = sender.send(UnaryResponse::from_error(RpcError::internal(
                        "unary call was already sent",
                    )));
                }
            }
            Disposition::Perform(perform) => {
                let completion: CompletionFn<O> = {
                    let shared = Arc::clone(&self.shared);
                    Arc::new(move |response| shared.complete(response))
                };
                let cancelable = perform(completion);
                // Cancellation may have raced the send; if so, cancel the
                // freshly started request instead of retaining the handle.
                let canceled_meanwhile = self.shared.state.with(|state| {
                    if state.canceled {
                        true
                    } else {
                        state.cancelable = Some(cancelable.clone());
                        false
                    }
                });
                if canceled_meanwhile {
                    cancelable.cancel();
                }
            }
        }

        ResponseFuture {
            receiver,
            shared: Arc::clone(&self.shared),
            done: false,
        }
    }

    /// Cancel the call. If the send has not happened yet it never will; if it
    /// is in flight the retained cancel handle is invoked. The awaiting
    /// caller resolves with a canceled result, exactly once.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl<O> std::fmt::Debug for UnaryAsyncWrapper<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UnaryAsyncWrapper")
    }
}

/// Future resolving to the result of a unary call.
///
/// Dropping the future before it resolves cancels the call.
pub struct ResponseFuture<O> {
    receiver: oneshot::Receiver<UnaryResponse<O>>,
    shared: Arc<CallShared<O>>,
    done: bool,
}

impl<O: Send + 'static> Future for ResponseFuture<O> {
    type Output = UnaryResponse<O>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(response)) => {
                this.done = true;
                Poll::Ready(response)
            }
            Poll::Ready(Err(_)) => {
                // The resolving half vanished without completing; surface the
                // call as canceled rather than hanging forever.
                this.done = true;
                Poll::Ready(UnaryResponse::canceled())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<O> Drop for ResponseFuture<O> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.cancel_on_drop();
        }
    }
}

impl<O> CallShared<O> {
    // Drop cannot rely on O: Send + 'static bounds, so the cancel path is
    // duplicated without the completion send (the receiver is gone anyway).
    fn cancel_on_drop(&self) {
        let cancelable = self.state.with(|state| {
            if state.canceled {
                return None;
            }
            state.canceled = true;
            state.perform = None;
            state.completion = None;
            state.cancelable.take()
        });
        if let Some(cancelable) = cancelable {
            cancelable.cancel();
        }
    }
}

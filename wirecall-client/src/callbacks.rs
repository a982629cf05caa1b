//! Callback sets that wire the protocol core to a transport.
//!
//! Outbound data flows through [`RequestCallbacks`]; inbound events arrive
//! through [`ResponseCallbacks`]. A transport must invoke the response
//! callbacks for a given call serially, never concurrently with each other.

use std::sync::Arc;

use bytes::Bytes;
use wirecall_core::{Code, Headers, RpcError, Trailers};

/// Handle which, when invoked, cancels an in-flight call.
#[derive(Clone)]
pub struct Cancelable {
    on_cancel: Arc<dyn Fn() + Send + Sync>,
}

impl Cancelable {
    /// Create a cancel handle from a closure.
    pub fn new<F>(on_cancel: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            on_cancel: Arc::new(on_cancel),
        }
    }

    /// A handle that does nothing when canceled.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Cancel the underlying call.
    pub fn cancel(&self) {
        (self.on_cancel)();
    }
}

impl std::fmt::Debug for Cancelable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cancelable")
    }
}

/// Closures used for wiring outbound request data through to a transport.
///
/// Owned by a stream for its lifetime; invoked, never stored beyond it.
pub struct RequestCallbacks<T> {
    send_data: Arc<dyn Fn(T) + Send + Sync>,
    send_close: Arc<dyn Fn() + Send + Sync>,
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl<T> RequestCallbacks<T> {
    /// Create a new callback set.
    pub fn new(
        send_data: impl Fn(T) + Send + Sync + 'static,
        send_close: impl Fn() + Send + Sync + 'static,
        cancel: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            send_data: Arc::new(send_data),
            send_close: Arc::new(send_close),
            cancel: Arc::new(cancel),
        }
    }

    /// Send data through to the server.
    pub fn send_data(&self, value: T) {
        (self.send_data)(value);
    }

    /// Half-close the send side of the stream.
    pub fn send_close(&self) {
        (self.send_close)();
    }

    /// Cancel the stream.
    pub fn cancel(&self) {
        (self.cancel)();
    }

    pub(crate) fn cancel_handle(&self) -> Arc<dyn Fn() + Send + Sync> {
        Arc::clone(&self.cancel)
    }
}

impl<T> Clone for RequestCallbacks<T> {
    fn clone(&self) -> Self {
        Self {
            send_data: Arc::clone(&self.send_data),
            send_close: Arc::clone(&self.send_close),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<T> std::fmt::Debug for RequestCallbacks<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RequestCallbacks")
    }
}

/// Closures used for wiring inbound response data through from a transport.
///
/// For a given call the transport must invoke these serially; different calls
/// may run fully in parallel.
#[derive(Clone)]
pub struct ResponseCallbacks {
    receive_headers: Arc<dyn Fn(Headers) + Send + Sync>,
    receive_data: Arc<dyn Fn(Bytes) + Send + Sync>,
    receive_close: Arc<dyn Fn(Code, Trailers, Option<RpcError>) + Send + Sync>,
}

impl ResponseCallbacks {
    /// Create a new callback set.
    pub fn new(
        receive_headers: impl Fn(Headers) + Send + Sync + 'static,
        receive_data: impl Fn(Bytes) + Send + Sync + 'static,
        receive_close: impl Fn(Code, Trailers, Option<RpcError>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            receive_headers: Arc::new(receive_headers),
            receive_data: Arc::new(receive_data),
            receive_close: Arc::new(receive_close),
        }
    }

    /// Called when response headers are available.
    pub fn receive_headers(&self, headers: Headers) {
        (self.receive_headers)(headers);
    }

    /// Called when response data is available.
    pub fn receive_data(&self, data: Bytes) {
        (self.receive_data)(data);
    }

    /// Called when the stream is closed, with the status code, trailers, and
    /// potentially an error.
    pub fn receive_close(&self, code: Code, trailers: Trailers, error: Option<RpcError>) {
        (self.receive_close)(code, trailers, error);
    }
}

impl std::fmt::Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseCallbacks")
    }
}

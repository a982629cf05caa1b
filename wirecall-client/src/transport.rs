//! Transport boundary.
//!
//! The protocol core does not ship a concrete HTTP stack. Instead it consumes
//! the [`HttpClient`] trait: any HTTP/1.1 or HTTP/2 client that can perform a
//! unary request and open a bidirectional byte stream can drive it.

use bytes::Bytes;
use http::{Method, Uri};
use wirecall_core::{Code, Headers, RpcError, Trailers};

use crate::callbacks::{Cancelable, RequestCallbacks, ResponseCallbacks};

/// An outbound request with a fully serialized body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Target URL for the request.
    pub uri: Uri,
    /// HTTP method to use.
    pub method: Method,
    /// Outbound headers.
    pub headers: Headers,
    /// Serialized (and possibly compressed) body bytes.
    pub body: Bytes,
}

/// A unary response received from the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code of the response, mapped from the transport-level status
    /// via [`Code::from_http_status`] by the transport.
    pub code: Code,
    /// Response headers.
    pub headers: Headers,
    /// Response body, if any.
    pub body: Option<Bytes>,
    /// Response trailers.
    pub trailers: Trailers,
    /// Error that occurred in transit or was derived from the response.
    pub error: Option<RpcError>,
}

/// A request used to open a stream. The body is sent incrementally through
/// [`RequestCallbacks`] after the stream is established.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Target URL for the stream.
    pub uri: Uri,
    /// Outbound headers.
    pub headers: Headers,
}

/// Contract the protocol core requires from a transport.
///
/// Implementations own the socket conversation. They must:
/// - invoke the unary `on_response` callback exactly once per call;
/// - invoke a stream's [`ResponseCallbacks`] serially per call;
/// - respond to a cancel by tearing down the call and reporting a
///   [`Code::Canceled`] close.
pub trait HttpClient: Send + Sync + 'static {
    /// Perform a unary request. Returns a handle that cancels it.
    fn unary(
        &self,
        request: HttpRequest,
        on_response: std::sync::Arc<dyn Fn(HttpResponse) + Send + Sync>,
    ) -> Cancelable;

    /// Open a bidirectional stream. Inbound events are delivered through
    /// `callbacks`; the returned callbacks accept outbound framed bytes.
    fn stream(
        &self,
        request: StreamRequest,
        callbacks: ResponseCallbacks,
    ) -> RequestCallbacks<Bytes>;
}

//! Client-side RPC protocol core.
//!
//! This crate turns typed request/response messages into wire bytes, drives
//! them over an abstract bidirectional transport, and reassembles wire events
//! back into typed results, while applying cross-cutting policies through a
//! composable interceptor pipeline. The wire conventions are
//! Connect-compatible.
//!
//! It does **not** ship a concrete network transport: anything that can
//! perform a unary HTTP request and open a bidirectional byte stream can
//! implement [`HttpClient`] and drive the core.
//!
//! ## Unary calls
//!
//! ```ignore
//! use std::sync::Arc;
//! use wirecall_client::{ProtocolClient, ProtocolClientConfig};
//!
//! let config = ProtocolClientConfig::new("https://api.acme.dev");
//! let client = ProtocolClient::new(Arc::new(MyTransport::new()), config);
//!
//! let response = client
//!     .call_unary::<EchoRequest, EchoResponse>(
//!         "echo.v1.EchoService/Echo",
//!         request,
//!         Headers::empty(),
//!     )
//!     .await;
//! println!("{:?}", response.result);
//! ```
//!
//! ## Streaming calls
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let mut stream = client.server_only_stream::<ListRequest, ListItem>(
//!     "items.v1.ItemService/List",
//!     Headers::empty(),
//! );
//! stream.send(request)?;
//!
//! let mut results = stream.results();
//! while let Some(result) = results.next().await {
//!     match result {
//!         StreamResult::Headers(headers) => println!("headers: {headers:?}"),
//!         StreamResult::Message(item) => println!("item: {item:?}"),
//!         StreamResult::Complete { code, .. } => println!("done: {code:?}"),
//!     }
//! }
//! ```
//!
//! ## Cross-cutting policies
//!
//! Configuration is immutable: options produce new configs. Interceptors are
//! created per call from factories, so per-call state such as retry counters
//! is never shared across concurrent calls.
//!
//! ```ignore
//! use std::time::Duration;
//! use wirecall_client::{
//!     GzipRequestOption, TimeoutOption, UnaryRetryInterceptor, RetrySchedule,
//! };
//! use wirecall_core::Code;
//!
//! let config = ProtocolClientConfig::new("https://api.acme.dev")
//!     .apply_options(&[
//!         &GzipRequestOption::new(1024),
//!         &TimeoutOption::new(Duration::from_secs(30)),
//!     ])
//!     .with_interceptors(vec![UnaryRetryInterceptor::factory(
//!         3,
//!         vec![Code::Unavailable],
//!         RetrySchedule::default(),
//!     )]);
//! ```

mod callbacks;
mod client;
mod config;
mod interceptor;
mod protocol;
mod retry;
mod stream;
mod sync;
mod transport;
mod unary;

pub use callbacks::{Cancelable, RequestCallbacks, ResponseCallbacks};
pub use client::ProtocolClient;
pub use config::{
    ClientOption, GzipCompressionOption, GzipRequestOption, IdentityCompressionOption,
    InterceptorFactory, InterceptorsOption, JsonCodecOption, ProtoCodecOption,
    ProtocolClientConfig, RequestCompression, TimeoutOption,
};
pub use interceptor::{FallibleProceed, Proceed, StreamInterceptor, UnaryInterceptor};
pub use protocol::header;
pub use retry::{defaults, RetrySchedule, UnaryRetryInterceptor};
pub use stream::{
    BidirectionalStream, ClientOnlyStream, ResultStream, ServerOnlyStream, StreamResult,
};
pub use sync::{Locked, TimeoutTimer};
pub use transport::{HttpClient, HttpRequest, HttpResponse, StreamRequest};
pub use unary::{CompletionFn, ResponseFuture, UnaryAsyncWrapper, UnaryResponse};

// Re-export the protocol-level types callers interact with directly.
pub use wirecall_core::{
    Code, Codec, CodecKind, CompressionPool, GzipPool, Headers, IdentityPool, Metadata,
    RpcError, Trailers, WireMessage,
};

//! Client configuration.
//!
//! [`ProtocolClientConfig`] is constructed once per client and is immutable
//! thereafter: every option application yields a new instance, leaving the
//! original untouched. Options compose by sequential application; the last
//! applied wins on conflicting fields.

use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use wirecall_core::{
    BoxedPool, CodecKind, CompressionPool, GzipPool, IdentityPool, RpcError,
};

use crate::interceptor::{StreamInterceptor, UnaryInterceptor};
use crate::protocol::WireInterceptor;

/// Configuration used to specify if/how outbound request payloads should be
/// compressed.
#[derive(Debug, Clone)]
pub struct RequestCompression {
    min_bytes: usize,
    pool: BoxedPool,
}

impl RequestCompression {
    /// Compress outbound payloads larger than `min_bytes` with `pool`.
    pub fn new(min_bytes: usize, pool: impl CompressionPool) -> Self {
        Self {
            min_bytes,
            pool: BoxedPool::new(pool),
        }
    }

    /// The minimum payload size that qualifies for compression. Payloads of
    /// exactly this size or smaller are sent identity-encoded.
    pub fn min_bytes(&self) -> usize {
        self.min_bytes
    }

    /// The pool used to compress outbound payloads.
    pub fn pool(&self) -> &BoxedPool {
        &self.pool
    }

    /// Whether a payload of `len` bytes should be compressed.
    pub fn should_compress(&self, len: usize) -> bool {
        len > self.min_bytes
    }
}

type UnaryFactoryFn = Arc<dyn Fn(&ProtocolClientConfig) -> Arc<dyn UnaryInterceptor> + Send + Sync>;
type StreamFactoryFn =
    Arc<dyn Fn(&ProtocolClientConfig) -> Arc<dyn StreamInterceptor> + Send + Sync>;

/// Factory for creating interceptors.
///
/// Invoked once per call to produce a fresh interceptor instance, so per-call
/// mutable state (such as retry counters) is never shared across concurrent
/// calls. A factory only produces instances for the call kinds its
/// interceptor supports: a stream-only interceptor is not instantiated for a
/// unary call.
#[derive(Clone)]
pub struct InterceptorFactory {
    create_unary: Option<UnaryFactoryFn>,
    create_stream: Option<StreamFactoryFn>,
}

impl InterceptorFactory {
    /// A factory producing unary interceptors.
    pub fn unary<I, F>(factory: F) -> Self
    where
        I: UnaryInterceptor + 'static,
        F: Fn(&ProtocolClientConfig) -> I + Send + Sync + 'static,
    {
        Self {
            create_unary: Some(Arc::new(move |config| Arc::new(factory(config)))),
            create_stream: None,
        }
    }

    /// A factory producing stream interceptors.
    pub fn stream<I, F>(factory: F) -> Self
    where
        I: StreamInterceptor + 'static,
        F: Fn(&ProtocolClientConfig) -> I + Send + Sync + 'static,
    {
        Self {
            create_unary: None,
            create_stream: Some(Arc::new(move |config| Arc::new(factory(config)))),
        }
    }

    /// A factory producing interceptors that handle both unary calls and
    /// streams. The factory closure runs once per call, for the kind of call
    /// being made.
    pub fn both<I, F>(factory: F) -> Self
    where
        I: UnaryInterceptor + StreamInterceptor + 'static,
        F: Fn(&ProtocolClientConfig) -> I + Clone + Send + Sync + 'static,
    {
        let for_streams = factory.clone();
        Self {
            create_unary: Some(Arc::new(move |config| Arc::new(factory(config)))),
            create_stream: Some(Arc::new(move |config| Arc::new(for_streams(config)))),
        }
    }

    pub(crate) fn create_unary(
        &self,
        config: &ProtocolClientConfig,
    ) -> Option<Arc<dyn UnaryInterceptor>> {
        self.create_unary.as_ref().map(|create| create(config))
    }

    pub(crate) fn create_stream(
        &self,
        config: &ProtocolClientConfig,
    ) -> Option<Arc<dyn StreamInterceptor>> {
        self.create_stream.as_ref().map(|create| create(config))
    }
}

impl std::fmt::Debug for InterceptorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorFactory")
            .field("unary", &self.create_unary.is_some())
            .field("stream", &self.create_stream.is_some())
            .finish()
    }
}

/// Immutable configuration used to set up a protocol client.
#[derive(Clone)]
pub struct ProtocolClientConfig {
    host: String,
    codec: CodecKind,
    timeout: Option<Duration>,
    request_compression: Option<RequestCompression>,
    response_pools: Vec<BoxedPool>,
    interceptors: Vec<InterceptorFactory>,
}

impl ProtocolClientConfig {
    /// Create a configuration targeting `host` (e.g., `https://api.acme.dev`).
    ///
    /// Defaults: binary protobuf codec, gzip registered for response
    /// decompression, no request compression, no timeout, no interceptors.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            codec: CodecKind::default(),
            timeout: None,
            request_compression: None,
            response_pools: vec![BoxedPool::new(GzipPool::default())],
            interceptors: Vec::new(),
        }
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Codec used for serializing requests and deserializing responses.
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Timeout given to the server for requests to complete.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Compression settings for outbound requests, if configured.
    pub fn request_compression(&self) -> Option<&RequestCompression> {
        self.request_compression.as_ref()
    }

    /// Names of all registered response compression pools, sorted
    /// deterministically for the accept-encoding advertisement.
    pub fn accept_pool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.response_pools.iter().map(BoxedPool::name).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Look up a registered response compression pool by name.
    pub fn response_pool(&self, name: &str) -> Option<&BoxedPool> {
        self.response_pools.iter().find(|pool| pool.name() == name)
    }

    // Clone-with-overrides operations. Each returns a new configuration; the
    // original is never mutated.

    /// A copy of this configuration using the given codec.
    pub fn with_codec(&self, codec: CodecKind) -> Self {
        Self {
            codec,
            ..self.clone()
        }
    }

    /// A copy of this configuration with a per-call timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    /// A copy of this configuration that compresses outbound requests.
    pub fn with_request_compression(&self, compression: RequestCompression) -> Self {
        Self {
            request_compression: Some(compression),
            ..self.clone()
        }
    }

    /// A copy of this configuration with `pool` registered for response
    /// decompression. Registering a pool with an already-registered name
    /// replaces the previous registration.
    pub fn with_response_pool(&self, pool: impl CompressionPool) -> Self {
        let pool = BoxedPool::new(pool);
        let mut response_pools: Vec<_> = self
            .response_pools
            .iter()
            .filter(|existing| existing.name() != pool.name())
            .cloned()
            .collect();
        response_pools.push(pool);
        Self {
            response_pools,
            ..self.clone()
        }
    }

    /// A copy of this configuration with the given interceptor factories
    /// appended.
    pub fn with_interceptors(&self, factories: Vec<InterceptorFactory>) -> Self {
        let mut interceptors = self.interceptors.clone();
        interceptors.extend(factories);
        Self {
            interceptors,
            ..self.clone()
        }
    }

    /// Apply a sequence of options, producing a new configuration. Options
    /// apply in order; the last applied wins on conflicting fields.
    pub fn apply_options(&self, options: &[&dyn ClientOption]) -> Self {
        options
            .iter()
            .fold(self.clone(), |config, option| option.apply(config))
    }

    pub(crate) fn create_uri(&self, path: &str) -> Result<Uri, RpcError> {
        let joined = format!(
            "{}/{}",
            self.host.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        joined
            .parse::<Uri>()
            .map_err(|e| RpcError::Protocol(format!("invalid request URL {joined:?}: {e}")))
    }

    /// Instantiate the unary interceptors for one call: user factories in
    /// registration order, then the wire-convention interceptor.
    pub(crate) fn create_unary_interceptors(&self) -> Vec<Arc<dyn UnaryInterceptor>> {
        let mut interceptors: Vec<Arc<dyn UnaryInterceptor>> = self
            .interceptors
            .iter()
            .filter_map(|factory| factory.create_unary(self))
            .collect();
        interceptors.push(Arc::new(WireInterceptor::new(self.clone())));
        interceptors
    }

    /// Instantiate the stream interceptors for one stream: user factories in
    /// registration order, then the wire-convention interceptor.
    pub(crate) fn create_stream_interceptors(&self) -> Vec<Arc<dyn StreamInterceptor>> {
        let mut interceptors: Vec<Arc<dyn StreamInterceptor>> = self
            .interceptors
            .iter()
            .filter_map(|factory| factory.create_stream(self))
            .collect();
        interceptors.push(Arc::new(WireInterceptor::new(self.clone())));
        interceptors
    }
}

impl std::fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("host", &self.host)
            .field("codec", &self.codec)
            .field("timeout", &self.timeout)
            .field("request_compression", &self.request_compression)
            .field("response_pools", &self.response_pools)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// A unit that transforms a [`ProtocolClientConfig`] into a new one.
pub trait ClientOption {
    /// Apply this option, producing a new configuration.
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig;
}

/// Option to serialize request/response messages using binary protobuf.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodecOption;

impl ClientOption for ProtoCodecOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_codec(CodecKind::Proto)
    }
}

/// Option to serialize request/response messages using JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodecOption;

impl ClientOption for JsonCodecOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_codec(CodecKind::Json)
    }
}

/// Option to compress outbound requests with gzip when they are larger than
/// a minimum size.
#[derive(Debug, Clone, Copy)]
pub struct GzipRequestOption {
    min_bytes: usize,
}

impl GzipRequestOption {
    /// Compress outbound request payloads larger than `min_bytes`.
    pub fn new(min_bytes: usize) -> Self {
        Self { min_bytes }
    }
}

impl ClientOption for GzipRequestOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_request_compression(RequestCompression::new(
            self.min_bytes,
            GzipPool::default(),
        ))
    }
}

/// Option to register gzip for response decompression.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressionOption;

impl ClientOption for GzipCompressionOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_response_pool(GzipPool::default())
    }
}

/// Option to register the identity (no-op) pool, advertising that
/// uncompressed responses are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressionOption;

impl ClientOption for IdentityCompressionOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_response_pool(IdentityPool)
    }
}

/// Option to set the per-call timeout.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutOption {
    timeout: Duration,
}

impl TimeoutOption {
    /// Give the server `timeout` to complete each request.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientOption for TimeoutOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_timeout(self.timeout)
    }
}

/// Option to append interceptor factories.
#[derive(Clone)]
pub struct InterceptorsOption {
    factories: Vec<InterceptorFactory>,
}

impl InterceptorsOption {
    /// Append the given factories to the configuration's interceptor list.
    pub fn new(factories: Vec<InterceptorFactory>) -> Self {
        Self { factories }
    }
}

impl ClientOption for InterceptorsOption {
    fn apply(&self, config: ProtocolClientConfig) -> ProtocolClientConfig {
        config.with_interceptors(self.factories.clone())
    }
}

//! Wire conventions, implemented as an interceptor.
//!
//! [`WireInterceptor`] is instantiated once per call and appended after the
//! user-registered interceptors. It owns the Connect-compatible wire
//! conventions the core must emit and consume:
//!
//! - content negotiation headers (accept-encoding, content-encoding,
//!   protocol version, timeout, user agent)
//! - threshold-based request compression and response decompression
//! - envelope packing/unpacking for stream messages
//! - parsing of the end-of-stream JSON payload into a terminal result

use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use wirecall_core::{
    envelope_flags, pack_message, unpack_message, wrap_envelope, BoxedPool, Code, ErrorDetail,
    Headers, RpcError, Trailers,
};

use crate::config::ProtocolClientConfig;
use crate::interceptor::{
    FallibleProceed, Proceed, StreamInterceptor, UnaryInterceptor,
};
use crate::stream::StreamResult;
use crate::sync::Locked;
use crate::transport::{HttpRequest, HttpResponse, StreamRequest};

/// Header names used by the wire conventions.
pub mod header {
    /// Lists the compression pool names the client accepts for unary responses.
    pub const ACCEPT_ENCODING: &str = "accept-encoding";
    /// Names the pool used for a unary request body; absent means identity.
    pub const CONTENT_ENCODING: &str = "content-encoding";
    /// Derived from the codec name: `application/<codec>` for unary calls,
    /// `application/connect+<codec>` for streams.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Version of the wire protocol in use.
    pub const PROTOCOL_VERSION: &str = "connect-protocol-version";
    /// Timeout the server is given to complete the request, in milliseconds.
    pub const TIMEOUT_MS: &str = "connect-timeout-ms";
    /// Names the pool used for stream message payloads.
    pub const STREAM_CONTENT_ENCODING: &str = "connect-content-encoding";
    /// Lists the pool names the client accepts for stream message payloads.
    pub const STREAM_ACCEPT_ENCODING: &str = "connect-accept-encoding";
    /// Identifies the client library.
    pub const USER_AGENT: &str = "x-user-agent";
}

pub(crate) const PROTOCOL_VERSION: &str = "1";
pub(crate) const USER_AGENT: &str = concat!("wirecall/", env!("CARGO_PKG_VERSION"));

const TRAILER_PREFIX: &str = "trailer-";

/// Maximum timeout header value (10 digits of milliseconds). Larger timeouts
/// are treated as "no timeout" and the header is omitted.
const MAX_TIMEOUT_MS: u128 = 9_999_999_999;

fn timeout_header_value(timeout: std::time::Duration) -> Option<String> {
    let millis = timeout.as_millis();
    if millis == 0 || millis > MAX_TIMEOUT_MS {
        return None;
    }
    Some(millis.to_string())
}

/// Interceptor implementing the wire conventions for one call.
pub(crate) struct WireInterceptor {
    config: ProtocolClientConfig,
    /// Pool negotiated from stream response headers, used to decompress
    /// subsequent message envelopes.
    stream_response_pool: Locked<Option<BoxedPool>>,
}

impl WireInterceptor {
    pub(crate) fn new(config: ProtocolClientConfig) -> Self {
        Self {
            config,
            stream_response_pool: Locked::new(None),
        }
    }

    fn apply_common_headers(&self, headers: &mut Headers) {
        headers.insert(header::PROTOCOL_VERSION, PROTOCOL_VERSION);
        headers.insert(header::USER_AGENT, USER_AGENT);
        if let Some(timeout) = self.config.timeout()
            && let Some(value) = timeout_header_value(timeout)
        {
            headers.insert(header::TIMEOUT_MS, value);
        }
    }
}

impl UnaryInterceptor for WireInterceptor {
    fn handle_request(&self, mut request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
        self.apply_common_headers(&mut request.headers);
        request
            .headers
            .insert(header::ACCEPT_ENCODING, self.config.accept_pool_names().join(", "));

        if let Some(compression) = self.config.request_compression()
            && compression.should_compress(request.body.len())
        {
            match compression.pool().compress(&request.body) {
                Ok(compressed) => {
                    request.body = compressed;
                    request
                        .headers
                        .insert(header::CONTENT_ENCODING, compression.pool().name());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "request compression failed; sending uncompressed");
                }
            }
        }

        proceed(Ok(request));
    }

    fn handle_response(&self, mut response: HttpResponse, proceed: Proceed<HttpResponse>) {
        // Split trailer-prefixed response headers into trailers.
        let mut headers = Headers::empty();
        let mut trailers = response.trailers;
        for (name, value) in response.headers.headers().iter() {
            if let Some(stripped) = name.as_str().strip_prefix(TRAILER_PREFIX) {
                if let Ok(trailer_name) = http::header::HeaderName::try_from(stripped) {
                    trailers.headers_mut().append(trailer_name, value.clone());
                }
            } else {
                headers.headers_mut().append(name.clone(), value.clone());
            }
        }

        let encoding = headers
            .get(header::CONTENT_ENCODING)
            .map(str::to_owned)
            .filter(|name| name != "identity");
        headers.remove(header::CONTENT_ENCODING);
        response.headers = headers;
        response.trailers = trailers;

        if let Some(name) = encoding {
            match self.config.response_pool(&name) {
                Some(pool) => {
                    if let Some(body) = response.body.take() {
                        match pool.decompress(&body) {
                            Ok(decompressed) => response.body = Some(decompressed),
                            Err(e) => {
                                response.code = Code::Internal;
                                response.error = Some(RpcError::Decode(format!(
                                    "response decompression failed: {e}"
                                )));
                            }
                        }
                    }
                }
                None => {
                    // An encoding we never advertised is a fatal protocol
                    // error for this call.
                    response.code = Code::Internal;
                    response.body = None;
                    response.error = Some(RpcError::internal(format!(
                        "unrecognized response content-encoding {name:?}"
                    )));
                }
            }
        }

        proceed(response);
    }
}

impl StreamInterceptor for WireInterceptor {
    fn handle_stream_start(
        &self,
        mut request: StreamRequest,
        proceed: FallibleProceed<StreamRequest>,
    ) {
        self.apply_common_headers(&mut request.headers);
        if let Some(compression) = self.config.request_compression() {
            request
                .headers
                .insert(header::STREAM_CONTENT_ENCODING, compression.pool().name());
        }
        request.headers.insert(
            header::STREAM_ACCEPT_ENCODING,
            self.config.accept_pool_names().join(", "),
        );
        proceed(Ok(request));
    }

    fn handle_input(&self, input: Bytes, proceed: Proceed<Bytes>) {
        let (pool, min_bytes) = match self.config.request_compression() {
            Some(compression) => (Some(compression.pool()), compression.min_bytes()),
            None => (None, 0),
        };
        match pack_message(input.clone(), pool, min_bytes) {
            Ok(frame) => proceed(frame),
            Err(e) => {
                tracing::warn!(error = %e, "stream message compression failed; sending uncompressed");
                proceed(wrap_envelope(&input, envelope_flags::MESSAGE));
            }
        }
    }

    fn handle_result(&self, result: StreamResult<Bytes>, proceed: Proceed<StreamResult<Bytes>>) {
        match result {
            StreamResult::Headers(headers) => {
                let encoding = headers
                    .get(header::STREAM_CONTENT_ENCODING)
                    .map(str::to_owned)
                    .filter(|name| name != "identity");
                if let Some(name) = encoding {
                    match self.config.response_pool(&name) {
                        Some(pool) => {
                            self.stream_response_pool.set(Some(pool.clone()));
                            proceed(StreamResult::Headers(headers));
                        }
                        None => proceed(StreamResult::Complete {
                            code: Code::Internal,
                            error: Some(RpcError::internal(format!(
                                "unrecognized stream content-encoding {name:?}"
                            ))),
                            trailers: None,
                        }),
                    }
                } else {
                    proceed(StreamResult::Headers(headers));
                }
            }
            StreamResult::Message(frame) => {
                let pool = self.stream_response_pool.get();
                match unpack_message(frame, pool.as_ref()) {
                    Ok((flags, payload)) => {
                        if flags & envelope_flags::END_STREAM != 0 {
                            proceed(parse_end_stream(&payload));
                        } else {
                            proceed(StreamResult::Message(payload));
                        }
                    }
                    Err(e) => proceed(StreamResult::Complete {
                        code: e.code(),
                        error: Some(e),
                        trailers: None,
                    }),
                }
            }
            StreamResult::Complete { .. } => proceed(result),
        }
    }
}

/// End-of-stream frame JSON structure.
#[derive(Deserialize)]
struct EndStreamJson {
    #[serde(default)]
    error: Option<EndStreamError>,
    #[serde(default)]
    metadata: Option<std::collections::HashMap<String, Vec<String>>>,
}

/// Error structure in an end-of-stream frame.
#[derive(Deserialize)]
struct EndStreamError {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<EndStreamErrorDetail>,
}

/// Error detail in an end-of-stream frame.
#[derive(Deserialize)]
struct EndStreamErrorDetail {
    #[serde(rename = "type")]
    type_url: String,
    #[serde(default)]
    value: String,
}

/// Parse an end-of-stream frame payload into the terminal stream result.
fn parse_end_stream(payload: &[u8]) -> StreamResult<Bytes> {
    // An empty payload is a successful close with no trailers.
    if payload.is_empty() || payload == b"{}" {
        return StreamResult::Complete {
            code: Code::Ok,
            error: None,
            trailers: None,
        };
    }

    let end_stream: EndStreamJson = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            let error = RpcError::Protocol(format!("invalid end-of-stream payload: {e}"));
            return StreamResult::Complete {
                code: error.code(),
                error: Some(error),
                trailers: None,
            };
        }
    };

    let error = end_stream.error.map(|e| {
        let code = e.code.parse().unwrap_or(Code::Unknown);
        let mut error = match e.message {
            Some(message) => RpcError::new(code, message),
            None => RpcError::from_code(code),
        };
        for detail in e.details {
            if let Some(parsed) = parse_error_detail(&detail) {
                error = error.add_error_detail(parsed);
            }
        }
        error
    });

    let trailers = end_stream.metadata.map(|metadata| {
        let mut trailers = Trailers::empty();
        for (key, values) in metadata {
            if let Ok(name) = http::header::HeaderName::try_from(&key) {
                for value in values {
                    if let Ok(value) = http::header::HeaderValue::try_from(&value) {
                        trailers.headers_mut().append(name.clone(), value);
                    }
                }
            }
        }
        trailers
    });

    StreamResult::Complete {
        code: error.as_ref().map(RpcError::code).unwrap_or(Code::Ok),
        error,
        trailers,
    }
}

/// Parse an error detail from end-of-stream JSON.
fn parse_error_detail(detail: &EndStreamErrorDetail) -> Option<ErrorDetail> {
    // Raw base64 without padding; tolerate padded values too.
    let value = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(&detail.value)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(&detail.value))
        .ok()?;

    Some(ErrorDetail::new(&detail.type_url, value))
}

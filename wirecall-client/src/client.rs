//! The protocol client.
//!
//! [`ProtocolClient`] drives typed calls over an abstract transport: it
//! serializes messages with the configured codec, runs the interceptor
//! pipeline on both directions, frames stream messages, and surfaces inbound
//! events as typed results.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use wirecall_core::{
    parse_envelope_header, Code, Codec, CodecKind, Headers, RpcError, Trailers, WireMessage,
    ENVELOPE_HEADER_SIZE,
};

use crate::callbacks::{Cancelable, RequestCallbacks, ResponseCallbacks};
use crate::config::ProtocolClientConfig;
use crate::interceptor::{StreamChain, UnaryChain};
use crate::protocol::header;
use crate::stream::{
    BidirectionalStream, ClientOnlyStream, ResultStream, ServerOnlyStream, StreamResult,
};
use crate::sync::{Locked, TimeoutTimer};
use crate::transport::{HttpClient, HttpRequest, HttpResponse, StreamRequest};
use crate::unary::{ResponseFuture, UnaryAsyncWrapper, UnaryResponse};

/// Client for performing unary and streaming calls against a remote service.
///
/// Cheap to clone; clones share the transport and the immutable
/// configuration.
#[derive(Clone)]
pub struct ProtocolClient {
    config: ProtocolClientConfig,
    http_client: Arc<dyn HttpClient>,
}

#[derive(Default)]
struct UnaryCancelState {
    cancelable: Option<Cancelable>,
    is_canceled: bool,
}

impl ProtocolClient {
    /// Create a client sending requests and streams over `http_client`.
    pub fn new(http_client: Arc<dyn HttpClient>, config: ProtocolClientConfig) -> Self {
        Self {
            config,
            http_client,
        }
    }

    /// The client's configuration.
    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    /// Perform a unary call, invoking `completion` once with the result.
    ///
    /// Returns a handle that cancels the call; canceling resolves the
    /// completion with a canceled result and whatever the transport delivers
    /// afterwards is dropped.
    pub fn unary<I, O>(
        &self,
        path: &str,
        message: I,
        headers: Headers,
        completion: impl FnOnce(UnaryResponse<O>) + Send + 'static,
    ) -> Cancelable
    where
        I: WireMessage,
        O: WireMessage + Send,
    {
        let config = self.config.clone();
        let codec = config.codec();
        let timer = config.timeout().map(|t| Arc::new(TimeoutTimer::new(t)));

        // Exactly-once completion shared by the response, timeout, and
        // cancellation paths; whichever fires first wins and cancels the
        // deadline timer.
        let completion: Arc<dyn Fn(UnaryResponse<O>) + Send + Sync> = {
            let timer = timer.clone();
            let slot: Locked<Option<Box<dyn FnOnce(UnaryResponse<O>) + Send>>> =
                Locked::new(Some(Box::new(completion)));
            Arc::new(move |response| {
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                match slot.with(|slot| slot.take()) {
                    Some(complete) => complete(response),
                    None => {
                        tracing::debug!("unary completion already delivered; dropping extra result")
                    }
                }
            })
        };

        let uri = match config.create_uri(path) {
            Ok(uri) => uri,
            Err(e) => {
                completion(UnaryResponse::from_error(e));
                return Cancelable::noop();
            }
        };
        // Serialization failures surface immediately and are never retried.
        let body = match codec.encode(&message) {
            Ok(body) => body,
            Err(e) => {
                completion(UnaryResponse::from_error(e));
                return Cancelable::noop();
            }
        };

        let mut headers = headers;
        headers.insert(
            header::CONTENT_TYPE,
            format!("application/{}", codec.as_str()),
        );
        let request = HttpRequest {
            uri,
            method: Method::POST,
            headers,
            body,
        };

        let cancelation = Arc::new(Locked::new(UnaryCancelState::default()));
        let chain = Arc::new(UnaryChain::new(config.create_unary_interceptors()));

        let on_response: Arc<dyn Fn(HttpResponse) + Send + Sync> = {
            let chain = Arc::clone(&chain);
            let completion = Arc::clone(&completion);
            Arc::new(move |response| {
                let completion = Arc::clone(&completion);
                chain.execute_response(
                    response,
                    Arc::new(move |response| {
                        completion(decode_unary_response::<O>(response, codec));
                    }),
                );
            })
        };

        if let Some(timer) = &timer {
            let cancelation = Arc::clone(&cancelation);
            let completion = Arc::clone(&completion);
            timer.start(move || {
                let in_flight = cancelation.with(|state| {
                    state.is_canceled = true;
                    state.cancelable.take()
                });
                if let Some(in_flight) = in_flight {
                    in_flight.cancel();
                }
                completion(UnaryResponse::from_error(RpcError::deadline_exceeded(
                    "the request timed out",
                )));
            });
        }

        {
            let cancelation = Arc::clone(&cancelation);
            let completion = Arc::clone(&completion);
            let http_client = Arc::clone(&self.http_client);
            chain.execute_request(
                request,
                Arc::new(move |result| match result {
                    Err(e) => completion(UnaryResponse::from_error(e)),
                    Ok(request) => {
                        let on_response = Arc::clone(&on_response);
                        cancelation.with(|state| {
                            // The caller canceled while interceptors were
                            // processing the request; nothing goes out.
                            if state.is_canceled {
                                return;
                            }
                            state.cancelable =
                                Some(http_client.unary(request, on_response));
                        });
                    }
                }),
            );
        }

        Cancelable::new(move || {
            let in_flight = cancelation.with(|state| {
                state.is_canceled = true;
                state.cancelable.take()
            });
            if let Some(in_flight) = in_flight {
                in_flight.cancel();
            }
            completion(UnaryResponse::canceled());
        })
    }

    /// Perform a unary call and await its result.
    ///
    /// Dropping the returned future cancels the call; canceling never
    /// resolves the caller twice regardless of what the transport later does.
    pub fn call_unary<I, O>(
        &self,
        path: &str,
        message: I,
        headers: Headers,
    ) -> ResponseFuture<O>
    where
        I: WireMessage + Send,
        O: WireMessage + Send,
    {
        let client = self.clone();
        let path = path.to_owned();
        let wrapper = UnaryAsyncWrapper::new(move |completion| {
            client.unary(&path, message, headers, move |response| {
                completion(response)
            })
        });
        wrapper.send()
    }

    /// Open a bidirectional stream: any number of messages each way.
    pub fn bidirectional_stream<I, O>(
        &self,
        path: &str,
        headers: Headers,
    ) -> BidirectionalStream<I, O>
    where
        I: WireMessage + Send,
        O: WireMessage + Send,
    {
        let (callbacks, results) = self.start_stream(path, headers);
        BidirectionalStream::new(callbacks, results)
    }

    /// Open a server-streaming call: a single request message, any number of
    /// responses.
    pub fn server_only_stream<I, O>(
        &self,
        path: &str,
        headers: Headers,
    ) -> ServerOnlyStream<I, O>
    where
        I: WireMessage + Send,
        O: WireMessage + Send,
    {
        ServerOnlyStream::new(self.bidirectional_stream(path, headers))
    }

    /// Open a client-streaming call: any number of request messages, a single
    /// response after half-close.
    pub fn client_only_stream<I, O>(
        &self,
        path: &str,
        headers: Headers,
    ) -> ClientOnlyStream<I, O>
    where
        I: WireMessage + Send,
        O: WireMessage + Send,
    {
        ClientOnlyStream::new(self.bidirectional_stream(path, headers))
    }

    /// Wire up one stream: outbound typed messages flow through the codec,
    /// the interceptor chain, and envelope framing into the transport;
    /// inbound bytes are re-framed, run through the chain, decoded, and
    /// delivered as a lazy result sequence.
    fn start_stream<I, O>(
        &self,
        path: &str,
        headers: Headers,
    ) -> (RequestCallbacks<I>, ResultStream<O>)
    where
        I: WireMessage + Send,
        O: WireMessage + Send,
    {
        let config = self.config.clone();
        let codec = config.codec();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let has_completed = Arc::new(Locked::new(false));
        let chain = Arc::new(StreamChain::new(config.create_stream_interceptors()));

        // Deliver typed results to the consumer, enforcing the event
        // contract: exactly one terminal event, nothing after it.
        let deliver: Arc<dyn Fn(StreamResult<O>) + Send + Sync> = {
            let has_completed = Arc::clone(&has_completed);
            Arc::new(move |result: StreamResult<O>| {
                let should_deliver = has_completed.with(|done| {
                    if *done {
                        return false;
                    }
                    if result.is_complete() {
                        *done = true;
                    }
                    true
                });
                if should_deliver {
                    // The consumer may already be gone; that is fine.
                    let _ = tx.send(result);
                } else {
                    tracing::debug!("dropping stream event received after completion");
                }
            })
        };

        // Raw results leave the chain, get decoded, and reach the consumer.
        let finish_raw: Arc<dyn Fn(StreamResult<Bytes>) + Send + Sync> = {
            let deliver = Arc::clone(&deliver);
            Arc::new(move |raw| deliver(into_typed::<O>(raw, codec)))
        };

        let mut headers = headers;
        headers.insert(
            header::CONTENT_TYPE,
            format!("application/connect+{}", codec.as_str()),
        );
        let uri = match config.create_uri(path) {
            Ok(uri) => uri,
            Err(e) => {
                deliver(StreamResult::Complete {
                    code: e.code(),
                    error: Some(e),
                    trailers: None,
                });
                return (
                    RequestCallbacks::new(|_message| {}, || {}, || {}),
                    ResultStream::new(rx, None),
                );
            }
        };

        let buffer = Arc::new(Locked::new(BytesMut::new()));
        let response_callbacks = ResponseCallbacks::new(
            {
                let chain = Arc::clone(&chain);
                let finish_raw = Arc::clone(&finish_raw);
                move |response_headers: Headers| {
                    chain.execute_result(
                        StreamResult::Headers(response_headers),
                        Arc::clone(&finish_raw),
                    );
                }
            },
            {
                let chain = Arc::clone(&chain);
                let finish_raw = Arc::clone(&finish_raw);
                let buffer = Arc::clone(&buffer);
                move |data: Bytes| {
                    // Multiple envelopes may arrive in a single chunk, and an
                    // envelope may span chunks; extract every complete frame.
                    let frames = buffer.with(|buffer| {
                        buffer.extend_from_slice(&data);
                        let mut frames = Vec::new();
                        loop {
                            let Ok((_, length)) = parse_envelope_header(buffer) else {
                                break;
                            };
                            let frame_len = ENVELOPE_HEADER_SIZE + length as usize;
                            if buffer.len() < frame_len {
                                break;
                            }
                            frames.push(buffer.split_to(frame_len).freeze());
                        }
                        frames
                    });
                    for frame in frames {
                        chain.execute_result(
                            StreamResult::Message(frame),
                            Arc::clone(&finish_raw),
                        );
                    }
                }
            },
            {
                let chain = Arc::clone(&chain);
                let finish_raw = Arc::clone(&finish_raw);
                let has_completed = Arc::clone(&has_completed);
                move |code: Code, trailers: Trailers, error: Option<RpcError>| {
                    // The terminal event may already have been produced by an
                    // end-of-stream frame.
                    if has_completed.get() {
                        return;
                    }
                    chain.execute_result(
                        StreamResult::Complete {
                            code,
                            error,
                            trailers: Some(trailers),
                        },
                        Arc::clone(&finish_raw),
                    );
                }
            },
        );

        // The start chain may defer; sends made before the transport
        // callbacks exist are queued and flushed in order.
        let pending = Arc::new(PendingRequestCallbacks::default());
        {
            let pending = Arc::clone(&pending);
            let deliver = Arc::clone(&deliver);
            let http_client = Arc::clone(&self.http_client);
            chain.execute_start(
                StreamRequest { uri, headers },
                Arc::new(move |result| match result {
                    Ok(request) => {
                        pending.fulfill(http_client.stream(request, response_callbacks.clone()));
                    }
                    Err(e) => deliver(StreamResult::Complete {
                        code: e.code(),
                        error: Some(e),
                        trailers: None,
                    }),
                }),
            );
        }

        let request_callbacks = RequestCallbacks::new(
            {
                let pending = Arc::clone(&pending);
                let chain = Arc::clone(&chain);
                move |message: I| {
                    let chain = Arc::clone(&chain);
                    pending.enqueue(move |callbacks| match codec.encode(&message) {
                        Ok(bytes) => {
                            let callbacks = callbacks.clone();
                            chain.execute_input(
                                bytes,
                                Arc::new(move |frame| callbacks.send_data(frame)),
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "failed to serialize outbound stream message; dropping it"
                            );
                        }
                    });
                }
            },
            {
                let pending = Arc::clone(&pending);
                move || pending.enqueue(|callbacks| callbacks.send_close())
            },
            {
                let pending = Arc::clone(&pending);
                move || pending.enqueue(|callbacks| callbacks.cancel())
            },
        );

        let results = ResultStream::new(rx, Some(request_callbacks.cancel_handle()));
        (request_callbacks, results)
    }
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("config", &self.config)
            .finish()
    }
}

/// Decode the final intercepted response into a typed result.
fn decode_unary_response<O: WireMessage>(
    response: HttpResponse,
    codec: CodecKind,
) -> UnaryResponse<O> {
    let HttpResponse {
        code,
        headers,
        body,
        trailers,
        error,
    } = response;

    if let Some(error) = error {
        return UnaryResponse {
            code: error.code(),
            headers,
            result: Err(error),
            trailers,
        };
    }
    if code != Code::Ok {
        return UnaryResponse {
            code,
            headers,
            result: Err(RpcError::from_code(code)),
            trailers,
        };
    }
    match codec.decode::<O>(body.as_deref().unwrap_or(&[])) {
        Ok(message) => UnaryResponse {
            code,
            headers,
            result: Ok(message),
            trailers,
        },
        Err(e) => UnaryResponse {
            code: e.code(),
            headers,
            result: Err(e),
            trailers,
        },
    }
}

/// Convert a raw result leaving the inbound chain into a typed one. A message
/// that fails to decode terminates the stream with the decoding error.
fn into_typed<O: WireMessage>(result: StreamResult<Bytes>, codec: CodecKind) -> StreamResult<O> {
    match result {
        StreamResult::Headers(headers) => StreamResult::Headers(headers),
        StreamResult::Message(bytes) => match codec.decode::<O>(&bytes) {
            Ok(message) => StreamResult::Message(message),
            Err(e) => StreamResult::Complete {
                code: e.code(),
                error: Some(e),
                trailers: None,
            },
        },
        StreamResult::Complete {
            code,
            error,
            trailers,
        } => StreamResult::Complete {
            code,
            error,
            trailers,
        },
    }
}

/// Buffers actions against a stream's transport callbacks until the deferred
/// start chain produces them, then replays the actions in order.
#[derive(Default)]
struct PendingRequestCallbacks {
    state: Locked<PendingState>,
}

#[derive(Default)]
struct PendingState {
    callbacks: Option<RequestCallbacks<Bytes>>,
    queue: Vec<Box<dyn FnOnce(&RequestCallbacks<Bytes>) + Send>>,
}

impl PendingRequestCallbacks {
    fn fulfill(&self, callbacks: RequestCallbacks<Bytes>) {
        self.state.with(|state| {
            state.callbacks = Some(callbacks.clone());
            for action in state.queue.drain(..) {
                action(&callbacks);
            }
        });
    }

    fn enqueue(&self, action: impl FnOnce(&RequestCallbacks<Bytes>) + Send + 'static) {
        let mut action = Some(Box::new(action) as Box<dyn FnOnce(&RequestCallbacks<Bytes>) + Send>);
        self.state.with(|state| match &state.callbacks {
            Some(callbacks) => {
                if let Some(action) = action.take() {
                    action(callbacks);
                }
            }
            None => {
                if let Some(action) = action.take() {
                    state.queue.push(action);
                }
            }
        });
    }
}

//! Interceptor pipeline.
//!
//! Interceptors add cross-cutting logic to calls: authentication headers,
//! logging, compression, retries. An interceptor implements the capability
//! subset it needs; every hook has a pass-through default.
//!
//! Hooks follow a continuation-passing contract: a hook receives the current
//! value and a `proceed` continuation and may
//! - call `proceed` immediately with an unmodified or transformed value,
//! - call `proceed` with a failure, short-circuiting the rest of the
//!   outbound chain, or
//! - defer calling `proceed` to a later point in time (as the retry
//!   interceptor does).
//!
//! Because deferral is legal, the pipeline is not synchronous end-to-end:
//! a response may reach the application arbitrarily later than the physical
//! network response.
//!
//! Outbound hooks run in registration order; inbound hooks run in reverse
//! registration order, like middleware unwinding.

use std::sync::Arc;

use bytes::Bytes;
use wirecall_core::RpcError;

use crate::stream::StreamResult;
use crate::transport::{HttpRequest, HttpResponse, StreamRequest};

/// Continuation which passes a value to the next interceptor in the chain.
///
/// Continuations may be stored and invoked later, and may be invoked more
/// than once (each invocation replays the remainder of the chain).
pub type Proceed<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Continuation which passes a value or a failure to the next interceptor.
/// A failure terminates the chain and is returned to the caller directly.
pub type FallibleProceed<T> = Arc<dyn Fn(Result<T, RpcError>) + Send + Sync>;

/// Interceptor that can observe and/or mutate unary calls.
pub trait UnaryInterceptor: Send + Sync {
    /// Observe and/or mutate a serialized request to be sent to the server.
    ///
    /// Invoked before the transport, in registration order.
    fn handle_request(&self, request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
        proceed(Ok(request));
    }

    /// Observe and/or mutate a serialized response received from the server.
    ///
    /// Invoked after the transport, in reverse registration order.
    fn handle_response(&self, response: HttpResponse, proceed: Proceed<HttpResponse>) {
        proceed(response);
    }
}

/// Interceptor that can observe and/or mutate streams.
pub trait StreamInterceptor: Send + Sync {
    /// Observe and/or mutate the creation of a stream and its headers.
    ///
    /// Invoked before the transport, in registration order.
    fn handle_stream_start(
        &self,
        request: StreamRequest,
        proceed: FallibleProceed<StreamRequest>,
    ) {
        proceed(Ok(request));
    }

    /// Observe and/or mutate a serialized message to be sent to the server
    /// over a stream.
    ///
    /// Invoked in registration order.
    fn handle_input(&self, input: Bytes, proceed: Proceed<Bytes>) {
        proceed(input);
    }

    /// Observe and/or mutate a raw result received from the server over a
    /// stream.
    ///
    /// Invoked in reverse registration order.
    fn handle_result(&self, result: StreamResult<Bytes>, proceed: Proceed<StreamResult<Bytes>>) {
        proceed(result);
    }
}

type ChainStep<V> = Box<dyn Fn(V, Proceed<V>) + Send + Sync>;
type FallibleChainStep<V> = Box<dyn Fn(V, FallibleProceed<V>) + Send + Sync>;

/// Invoke each step, waiting for a given step to complete before passing the
/// resulting value to the next one and finally invoking `finish`.
///
/// Steps are composed into nested continuations so that any step may defer
/// or replay its `proceed` handle.
fn run_chain<V: Send + 'static>(
    steps: Vec<ChainStep<V>>,
    first_in_first_out: bool,
    initial: V,
    finish: Proceed<V>,
) {
    let ordered: Vec<_> = if first_in_first_out {
        steps.into_iter().rev().collect()
    } else {
        steps
    };
    let mut next: Proceed<V> = finish;
    for step in ordered {
        let prev = next;
        next = Arc::new(move |value| step(value, prev.clone()));
    }
    next(initial);
}

/// Like [`run_chain`], but a step that proceeds with a failure terminates the
/// chain immediately: remaining steps are skipped and the failure goes
/// straight to `finish`.
fn run_chain_stop_on_failure<V: Send + 'static>(
    steps: Vec<FallibleChainStep<V>>,
    first_in_first_out: bool,
    initial: V,
    finish: FallibleProceed<V>,
) {
    let ordered: Vec<_> = if first_in_first_out {
        steps.into_iter().rev().collect()
    } else {
        steps
    };
    let mut next: FallibleProceed<V> = finish.clone();
    for step in ordered {
        let prev = next;
        let finish = finish.clone();
        next = Arc::new(move |result: Result<V, RpcError>| match result {
            Ok(value) => step(value, prev.clone()),
            Err(error) => finish(Err(error)),
        });
    }
    next(Ok(initial));
}

/// Chain of unary interceptors used for a single call.
pub(crate) struct UnaryChain {
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
}

impl UnaryChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn UnaryInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Run the outbound request hooks in registration order, stopping on the
    /// first failure.
    pub(crate) fn execute_request(
        &self,
        initial: HttpRequest,
        finish: FallibleProceed<HttpRequest>,
    ) {
        let steps = self
            .interceptors
            .iter()
            .map(|interceptor| {
                let interceptor = Arc::clone(interceptor);
                Box::new(move |request, proceed| interceptor.handle_request(request, proceed))
                    as FallibleChainStep<HttpRequest>
            })
            .collect();
        run_chain_stop_on_failure(steps, true, initial, finish);
    }

    /// Run the inbound response hooks in reverse registration order.
    pub(crate) fn execute_response(&self, initial: HttpResponse, finish: Proceed<HttpResponse>) {
        let steps = self
            .interceptors
            .iter()
            .map(|interceptor| {
                let interceptor = Arc::clone(interceptor);
                Box::new(move |response, proceed| interceptor.handle_response(response, proceed))
                    as ChainStep<HttpResponse>
            })
            .collect();
        run_chain(steps, false, initial, finish);
    }
}

/// Chain of stream interceptors used for a single stream.
pub(crate) struct StreamChain {
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
}

impl StreamChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn StreamInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Run the stream start hooks in registration order, stopping on the
    /// first failure.
    pub(crate) fn execute_start(
        &self,
        initial: StreamRequest,
        finish: FallibleProceed<StreamRequest>,
    ) {
        let steps = self
            .interceptors
            .iter()
            .map(|interceptor| {
                let interceptor = Arc::clone(interceptor);
                Box::new(move |request, proceed| {
                    interceptor.handle_stream_start(request, proceed)
                }) as FallibleChainStep<StreamRequest>
            })
            .collect();
        run_chain_stop_on_failure(steps, true, initial, finish);
    }

    /// Run the outbound message hooks in registration order.
    pub(crate) fn execute_input(&self, initial: Bytes, finish: Proceed<Bytes>) {
        let steps = self
            .interceptors
            .iter()
            .map(|interceptor| {
                let interceptor = Arc::clone(interceptor);
                Box::new(move |input, proceed| interceptor.handle_input(input, proceed))
                    as ChainStep<Bytes>
            })
            .collect();
        run_chain(steps, true, initial, finish);
    }

    /// Run the inbound result hooks in reverse registration order.
    pub(crate) fn execute_result(
        &self,
        initial: StreamResult<Bytes>,
        finish: Proceed<StreamResult<Bytes>>,
    ) {
        let steps = self
            .interceptors
            .iter()
            .map(|interceptor| {
                let interceptor = Arc::clone(interceptor);
                Box::new(move |result, proceed| interceptor.handle_result(result, proceed))
                    as ChainStep<StreamResult<Bytes>>
            })
            .collect();
        run_chain(steps, false, initial, finish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Locked;
    use http::Method;
    use std::time::Duration;
    use wirecall_core::{Code, Headers};

    fn request() -> HttpRequest {
        HttpRequest {
            uri: "http://localhost/test.Service/Method".parse().unwrap(),
            method: Method::POST,
            headers: Headers::empty(),
            body: Bytes::new(),
        }
    }

    fn response() -> HttpResponse {
        HttpResponse {
            code: Code::Ok,
            headers: Headers::empty(),
            body: None,
            trailers: Headers::empty(),
            error: None,
        }
    }

    struct Tagging {
        name: &'static str,
        log: Arc<Locked<Vec<&'static str>>>,
    }

    impl UnaryInterceptor for Tagging {
        fn handle_request(&self, request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
            self.log.with(|log| log.push(self.name));
            proceed(Ok(request));
        }

        fn handle_response(&self, response: HttpResponse, proceed: Proceed<HttpResponse>) {
            self.log.with(|log| log.push(self.name));
            proceed(response);
        }
    }

    struct FailingRequest;

    impl UnaryInterceptor for FailingRequest {
        fn handle_request(&self, _request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
            proceed(Err(RpcError::unavailable("rejected by interceptor")));
        }
    }

    #[test]
    fn test_request_hooks_run_in_registration_order() {
        let log = Arc::new(Locked::new(Vec::new()));
        let chain = UnaryChain::new(vec![
            Arc::new(Tagging {
                name: "first",
                log: Arc::clone(&log),
            }),
            Arc::new(Tagging {
                name: "second",
                log: Arc::clone(&log),
            }),
        ]);

        let finished = Arc::new(Locked::new(false));
        let finished_clone = Arc::clone(&finished);
        chain.execute_request(
            request(),
            Arc::new(move |result| {
                assert!(result.is_ok());
                finished_clone.set(true);
            }),
        );

        assert!(finished.get());
        assert_eq!(log.get(), vec!["first", "second"]);
    }

    #[test]
    fn test_response_hooks_run_in_reverse_order() {
        let log = Arc::new(Locked::new(Vec::new()));
        let chain = UnaryChain::new(vec![
            Arc::new(Tagging {
                name: "first",
                log: Arc::clone(&log),
            }),
            Arc::new(Tagging {
                name: "second",
                log: Arc::clone(&log),
            }),
        ]);

        chain.execute_response(response(), Arc::new(|_response| {}));
        assert_eq!(log.get(), vec!["second", "first"]);
    }

    #[test]
    fn test_failure_short_circuits_remaining_hooks() {
        let log = Arc::new(Locked::new(Vec::new()));
        let chain = UnaryChain::new(vec![
            Arc::new(Tagging {
                name: "first",
                log: Arc::clone(&log),
            }),
            Arc::new(FailingRequest),
            Arc::new(Tagging {
                name: "never",
                log: Arc::clone(&log),
            }),
        ]);

        let observed = Arc::new(Locked::new(None));
        let observed_clone = Arc::clone(&observed);
        chain.execute_request(
            request(),
            Arc::new(move |result| {
                observed_clone.set(Some(result.map(|_| ()).unwrap_err().code()));
            }),
        );

        assert_eq!(observed.get(), Some(Code::Unavailable));
        assert_eq!(log.get(), vec!["first"]);
    }

    #[test]
    fn test_hooks_may_transform_values() {
        struct AddHeader;
        impl UnaryInterceptor for AddHeader {
            fn handle_request(
                &self,
                mut request: HttpRequest,
                proceed: FallibleProceed<HttpRequest>,
            ) {
                request.headers.insert("x-added", "yes");
                proceed(Ok(request));
            }
        }

        let chain = UnaryChain::new(vec![Arc::new(AddHeader)]);
        let observed = Arc::new(Locked::new(None));
        let observed_clone = Arc::clone(&observed);
        chain.execute_request(
            request(),
            Arc::new(move |result| {
                let request = result.unwrap();
                observed_clone.set(request.headers.get("x-added").map(str::to_owned));
            }),
        );

        assert_eq!(observed.get(), Some("yes".to_string()));
    }

    struct Deferring;

    impl UnaryInterceptor for Deferring {
        fn handle_request(&self, request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                proceed(Ok(request));
            });
        }
    }

    #[tokio::test]
    async fn test_hook_may_defer_proceed() {
        let chain = Arc::new(UnaryChain::new(vec![Arc::new(Deferring)]));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Locked::new(Some(tx)));

        chain.execute_request(
            request(),
            Arc::new(move |result| {
                assert!(result.is_ok());
                if let Some(tx) = tx.with(|slot| slot.take()) {
                    let _ = tx.send(());
                }
            }),
        );

        // The chain returns before the deferred proceed runs; the finish
        // callback is reached later.
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("deferred chain never finished")
            .unwrap();
    }

    #[test]
    fn test_empty_chain_passes_value_through() {
        let chain = UnaryChain::new(vec![]);
        let observed = Arc::new(Locked::new(false));
        let observed_clone = Arc::clone(&observed);
        chain.execute_request(
            request(),
            Arc::new(move |result| {
                assert!(result.is_ok());
                observed_clone.set(true);
            }),
        );
        assert!(observed.get());
    }

    #[test]
    fn test_stream_result_hooks_run_in_reverse_order() {
        struct TaggingStream {
            name: &'static str,
            log: Arc<Locked<Vec<&'static str>>>,
        }
        impl StreamInterceptor for TaggingStream {
            fn handle_result(
                &self,
                result: StreamResult<Bytes>,
                proceed: Proceed<StreamResult<Bytes>>,
            ) {
                self.log.with(|log| log.push(self.name));
                proceed(result);
            }
        }

        let log = Arc::new(Locked::new(Vec::new()));
        let chain = StreamChain::new(vec![
            Arc::new(TaggingStream {
                name: "first",
                log: Arc::clone(&log),
            }),
            Arc::new(TaggingStream {
                name: "second",
                log: Arc::clone(&log),
            }),
        ]);

        chain.execute_result(
            StreamResult::Headers(Headers::empty()),
            Arc::new(|_result| {}),
        );
        assert_eq!(log.get(), vec!["second", "first"]);
    }
}

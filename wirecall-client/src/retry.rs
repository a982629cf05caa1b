//! Automatic retry of unary calls.
//!
//! [`UnaryRetryInterceptor`] retries failing unary requests: bounded, delayed,
//! and strictly sequential. It is stateful per call (attempt counter, captured
//! resend handle) and must therefore be installed through an
//! [`InterceptorFactory`] so that every call gets its own instance; the
//! [`UnaryRetryInterceptor::factory`] constructor does exactly that.
//!
//! [`RetrySchedule`] provides the default delay function: exponential backoff
//! with jitter, following the gRPC connection backoff specification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use wirecall_core::Code;

use crate::config::InterceptorFactory;
use crate::interceptor::{FallibleProceed, Proceed, UnaryInterceptor};
use crate::sync::Locked;
use crate::transport::{HttpRequest, HttpResponse};

/// Default backoff values from the gRPC connection backoff spec.
/// See: https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md
pub mod defaults {
    use std::time::Duration;

    /// Default delay before the first retry.
    pub const BASE_DELAY: Duration = Duration::from_secs(1);

    /// Default multiplier for exponential backoff.
    pub const MULTIPLIER: f64 = 1.6;

    /// Default jitter factor (0.2 means +/- 20%).
    pub const JITTER: f64 = 0.2;

    /// Default maximum delay between retries.
    pub const MAX_DELAY: Duration = Duration::from_secs(120);

    /// Default maximum number of retry attempts.
    pub const MAX_RETRIES: u32 = 3;
}

/// Delay schedule mapping a 1-based retry number to a wait duration.
///
/// The sequence follows `base * multiplier^(n-1)` with +/- jitter, clamped to
/// `max_delay`.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier for exponential backoff. Must be >= 1.0.
    pub multiplier: f64,
    /// Jitter factor between 0.0 and 1.0.
    pub jitter: f64,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
        }
    }
}

impl RetrySchedule {
    /// Create a schedule with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is less than 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        assert!(multiplier >= 1.0, "multiplier must be >= 1.0");
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor.
    ///
    /// # Panics
    ///
    /// Panics if `jitter` is not between 0.0 and 1.0.
    pub fn jitter(mut self, jitter: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&jitter),
            "jitter must be between 0.0 and 1.0"
        );
        self.jitter = jitter;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// The delay to wait before retry number `retry_number` (1-based).
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        let exponent = retry_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jittered = if self.jitter > 0.0 {
            let factor = rand::random::<f64>() * 2.0 * self.jitter - self.jitter;
            raw * (1.0 + factor)
        } else {
            raw
        };

        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

#[derive(Default)]
struct RetryState {
    retries: u32,
    resend: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Interceptor that retries failing unary requests.
///
/// On the outbound hook it captures a resend handle (replaying the serialized
/// request through the remainder of the chain) and forwards the request
/// unchanged. On the inbound hook, a response whose code is in the retry set
/// is swallowed and the resend is scheduled after the configured delay; the
/// eventual resend's response is what the caller sees. Responses that are ok,
/// not retryable, or past the retry budget are forwarded verbatim.
///
/// Holds per-call mutable state: install via [`UnaryRetryInterceptor::factory`]
/// rather than sharing one instance across calls.
pub struct UnaryRetryInterceptor {
    max_retries: u32,
    codes_to_retry: HashSet<Code>,
    delay_for_retry: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    state: Locked<RetryState>,
}

impl UnaryRetryInterceptor {
    /// Create a new instance of the retry interceptor.
    ///
    /// - `max_retries`: maximum number of retries (not counting the initial
    ///   request).
    /// - `codes_to_retry`: status codes that should be retried.
    /// - `delay_for_retry`: maps the retry number (1-based; never invoked for
    ///   the initial request) to the delay before that retry.
    pub fn new(
        max_retries: u32,
        codes_to_retry: impl IntoIterator<Item = Code>,
        delay_for_retry: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_retries,
            codes_to_retry: codes_to_retry.into_iter().collect(),
            delay_for_retry: Arc::new(delay_for_retry),
            state: Locked::default(),
        }
    }

    /// An interceptor factory installing a fresh retry interceptor per call,
    /// using `schedule` as the delay function.
    pub fn factory(
        max_retries: u32,
        codes_to_retry: Vec<Code>,
        schedule: RetrySchedule,
    ) -> InterceptorFactory {
        InterceptorFactory::unary(move |_config| {
            let schedule = schedule.clone();
            UnaryRetryInterceptor::new(max_retries, codes_to_retry.iter().copied(), move |n| {
                schedule.delay_for(n)
            })
        })
    }

    /// A factory retrying the transient codes ([`Code::is_retryable`]) with
    /// the default backoff schedule.
    pub fn default_factory() -> InterceptorFactory {
        Self::factory(
            defaults::MAX_RETRIES,
            vec![Code::Unavailable, Code::ResourceExhausted, Code::Aborted],
            RetrySchedule::default(),
        )
    }
}

impl UnaryInterceptor for UnaryRetryInterceptor {
    fn handle_request(&self, request: HttpRequest, proceed: FallibleProceed<HttpRequest>) {
        let resend: Arc<dyn Fn() + Send + Sync> = {
            let proceed = Arc::clone(&proceed);
            let request = request.clone();
            Arc::new(move || proceed(Ok(request.clone())))
        };
        self.state.with(|state| state.resend = Some(resend));
        proceed(Ok(request));
    }

    fn handle_response(&self, response: HttpResponse, proceed: Proceed<HttpResponse>) {
        let decision = self.state.with(|state| {
            if response.code == Code::Ok
                || !self.codes_to_retry.contains(&response.code)
                || state.retries >= self.max_retries
            {
                return None;
            }
            state.retries += 1;
            Some((state.retries, state.resend.clone()))
        });

        match decision {
            Some((retry_number, Some(resend))) => {
                let delay = (self.delay_for_retry)(retry_number);
                tracing::debug!(
                    code = response.code.as_str(),
                    retry_number,
                    delay_ms = delay.as_millis() as u64,
                    "retrying unary request after failure"
                );
                // The failing response is not forwarded; the resend's own
                // response is what resolves the call.
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    resend();
                });
            }
            // No resend handle was captured; nothing to replay.
            Some((_, None)) | None => proceed(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wirecall_core::{Headers, RpcError, Trailers};

    fn request() -> HttpRequest {
        HttpRequest {
            uri: "https://api.acme.dev/pkg.Service/Method".parse().unwrap(),
            method: Method::POST,
            headers: Headers::empty(),
            body: Bytes::from_static(b"request"),
        }
    }

    fn response_with_code(code: Code) -> HttpResponse {
        HttpResponse {
            code,
            headers: Headers::empty(),
            body: None,
            trailers: Trailers::empty(),
            error: (code != Code::Ok).then(|| RpcError::from_code(code)),
        }
    }

    async fn wait_for(
        counter: &Arc<AtomicU32>,
        expected: u32,
    ) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "expected counter to reach {expected}, got {}",
            counter.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_is_resent_not_forwarded() {
        let interceptor = UnaryRetryInterceptor::new(2, [Code::Unavailable], |_| {
            Duration::from_millis(1)
        });

        let sends = Arc::new(AtomicU32::new(0));
        let sends_clone = Arc::clone(&sends);
        interceptor.handle_request(
            request(),
            Arc::new(move |result| {
                assert!(result.is_ok());
                sends_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        let forwarded = Arc::new(AtomicU32::new(0));
        let forwarded_clone = Arc::clone(&forwarded);
        interceptor.handle_response(
            response_with_code(Code::Unavailable),
            Arc::new(move |_response| {
                forwarded_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // The failing response is swallowed and the request is replayed.
        wait_for(&sends, 2).await;
        assert_eq!(forwarded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ok_response_forwarded_verbatim() {
        let interceptor = UnaryRetryInterceptor::new(2, [Code::Unavailable], |_| {
            Duration::from_millis(1)
        });
        interceptor.handle_request(request(), Arc::new(|_| {}));

        let forwarded = Arc::new(AtomicU32::new(0));
        let forwarded_clone = Arc::clone(&forwarded);
        interceptor.handle_response(
            response_with_code(Code::Ok),
            Arc::new(move |response| {
                assert_eq!(response.code, Code::Ok);
                forwarded_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_code_outside_retry_set_forwarded() {
        let interceptor = UnaryRetryInterceptor::new(2, [Code::Unavailable], |_| {
            Duration::from_millis(1)
        });
        interceptor.handle_request(request(), Arc::new(|_| {}));

        let forwarded = Arc::new(AtomicU32::new(0));
        let forwarded_clone = Arc::clone(&forwarded);
        interceptor.handle_response(
            response_with_code(Code::NotFound),
            Arc::new(move |response| {
                assert_eq!(response.code, Code::NotFound);
                forwarded_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_last_failure() {
        let max_retries = 2;
        let interceptor = Arc::new(UnaryRetryInterceptor::new(
            max_retries,
            [Code::Unavailable],
            |_| Duration::from_millis(1),
        ));

        let sends = Arc::new(AtomicU32::new(0));
        let sends_clone = Arc::clone(&sends);
        interceptor.handle_request(
            request(),
            Arc::new(move |result| {
                assert!(result.is_ok());
                sends_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let forwarded = Arc::new(AtomicU32::new(0));
        // Feed a failing response for each attempt.
        for attempt in 1..=(max_retries + 1) {
            let forwarded_clone = Arc::clone(&forwarded);
            interceptor.handle_response(
                response_with_code(Code::Unavailable),
                Arc::new(move |response| {
                    assert_eq!(response.code, Code::Unavailable);
                    forwarded_clone.fetch_add(1, Ordering::SeqCst);
                }),
            );
            if attempt <= max_retries {
                wait_for(&sends, attempt + 1).await;
            }
        }

        // max_retries + 1 total attempts; only the final failure reached the
        // caller.
        assert_eq!(sends.load(Ordering::SeqCst), max_retries + 1);
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_at_least_the_scheduled_delay() {
        let delay = Duration::from_millis(40);
        let interceptor = UnaryRetryInterceptor::new(1, [Code::Unavailable], move |_| delay);

        let sends = Arc::new(AtomicU32::new(0));
        let sends_clone = Arc::clone(&sends);
        interceptor.handle_request(
            request(),
            Arc::new(move |_| {
                sends_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let started = std::time::Instant::now();
        interceptor.handle_response(response_with_code(Code::Unavailable), Arc::new(|_| {}));
        wait_for(&sends, 2).await;
        assert!(started.elapsed() >= delay);
    }

    #[test]
    fn test_schedule_defaults() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.base_delay, Duration::from_secs(1));
        assert!((schedule.multiplier - 1.6).abs() < f64::EPSILON);
        assert!((schedule.jitter - 0.2).abs() < f64::EPSILON);
        assert_eq!(schedule.max_delay, Duration::from_secs(120));
    }

    #[test]
    fn test_schedule_exponential_growth_without_jitter() {
        let schedule = RetrySchedule::new()
            .base_delay(Duration::from_secs(1))
            .multiplier(2.0)
            .jitter(0.0)
            .max_delay(Duration::from_secs(100));

        assert_eq!(schedule.delay_for(1), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(2));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(4));
        assert_eq!(schedule.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn test_schedule_clamped_to_max_delay() {
        let schedule = RetrySchedule::new()
            .base_delay(Duration::from_secs(10))
            .multiplier(10.0)
            .jitter(0.0)
            .max_delay(Duration::from_secs(15));

        assert_eq!(schedule.delay_for(1), Duration::from_secs(10));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(15));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn test_schedule_jitter_bounds() {
        let schedule = RetrySchedule::new()
            .base_delay(Duration::from_secs(1))
            .multiplier(2.0)
            .jitter(0.2)
            .max_delay(Duration::from_secs(100));

        for _ in 0..100 {
            let delay = schedule.delay_for(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    #[should_panic(expected = "multiplier must be >= 1.0")]
    fn test_schedule_invalid_multiplier() {
        RetrySchedule::new().multiplier(0.5);
    }

    #[test]
    #[should_panic(expected = "jitter must be between 0.0 and 1.0")]
    fn test_schedule_invalid_jitter() {
        RetrySchedule::new().jitter(1.5);
    }
}

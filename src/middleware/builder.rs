use crate::backend::Backend;
use crate::middleware::{AllowedTransformation, DeniedResponse, RateLimiter};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use std::future::Future;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

pub struct RateLimiterBuilder<BE, BO, F> {
    backend: BE,
    input_fn: F,
    fail_open: bool,
    allowed_transformation: Option<Rc<AllowedTransformation<BO>>>,
    denied_response: Rc<DeniedResponse<BO>>,
}

impl<BE, BI, BO, F, O> RateLimiterBuilder<BE, BO, F>
where
    BE: Backend<BI, Output = BO> + 'static,
    BI: 'static,
    F: Fn(&ServiceRequest) -> O,
    O: Future<Output = Result<Option<BI>, actix_web::Error>>,
{
    pub(super) fn new(backend: BE, input_fn: F) -> Self {
        Self {
            backend,
            input_fn,
            fail_open: false,
            allowed_transformation: None,
            denied_response: Rc::new(|_| HttpResponse::TooManyRequests().finish()),
        }
    }

    /// Choose whether to allow a request if the backend returns a failure.
    ///
    /// Default is false.
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Report the rate limit status to clients through response headers.
    ///
    /// Allowed responses carry:
    ///
    /// - `x-ratelimit-limit`: requests permitted within one sliding window
    /// - `x-ratelimit-remaining`: further requests that would currently be admitted
    /// - `x-ratelimit-reset`: seconds until every request counted so far stops weighing
    ///
    /// Denied responses are an empty 429 carrying the same headers plus `retry-after`, which has
    /// the same value as `x-ratelimit-reset`. A client that waits that long without sending
    /// further requests is admitted again.
    ///
    /// This replaces both [RateLimiterBuilder::request_allowed_transformation] and
    /// [RateLimiterBuilder::request_denied_response], and requires the Backend Output to implement
    /// [HeaderCompatibleOutput].
    pub fn add_headers(mut self) -> Self
    where
        BO: HeaderCompatibleOutput,
    {
        self.allowed_transformation = Some(Rc::new(|map: &mut HeaderMap, output: Option<&BO>| {
            // Nothing to report when the backend failed open
            if let Some(output) = output {
                for (name, value) in rate_limit_headers(output) {
                    map.insert(name, value);
                }
            }
        }));
        self.denied_response = Rc::new(|output: &BO| {
            let mut response = HttpResponse::TooManyRequests();
            for header in rate_limit_headers(output) {
                response.insert_header(header);
            }
            response
                .insert_header((RETRY_AFTER, HeaderValue::from(output.seconds_until_reset())))
                .finish()
        });
        self
    }

    /// In the event that the request is allowed:
    ///
    /// You can optionally mutate the response headers to include the rate limit status.
    ///
    /// By default no changes are made to the response.
    ///
    /// Note the [Backend::Output] will be [None] if the backend failed and
    /// [RateLimiterBuilder::fail_open] is enabled.
    pub fn request_allowed_transformation<M>(mut self, mutation: Option<M>) -> Self
    where
        M: Fn(&mut HeaderMap, Option<&BO>) + 'static,
    {
        self.allowed_transformation = mutation.map(|m| Rc::new(m) as Rc<AllowedTransformation<BO>>);
        self
    }

    /// In the event that the request is denied, configure the [HttpResponse] returned.
    ///
    /// Defaults to an empty body with status 429.
    pub fn request_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&BO) -> HttpResponse + 'static,
    {
        self.denied_response = Rc::new(denied_response);
        self
    }

    pub fn build(self) -> RateLimiter<BE, BO, F> {
        RateLimiter {
            backend: self.backend,
            input_fn: Rc::new(self.input_fn),
            fail_open: self.fail_open,
            allowed_mutation: self.allowed_transformation,
            denied_response: self.denied_response,
        }
    }
}

fn rate_limit_headers<BO>(output: &BO) -> [(HeaderName, HeaderValue); 3]
where
    BO: HeaderCompatibleOutput,
{
    [
        (X_RATELIMIT_LIMIT.clone(), HeaderValue::from(output.limit())),
        (
            X_RATELIMIT_REMAINING.clone(),
            HeaderValue::from(output.remaining()),
        ),
        (
            X_RATELIMIT_RESET.clone(),
            HeaderValue::from(output.seconds_until_reset()),
        ),
    ]
}

/// Rate limit status that can be reported by [RateLimiterBuilder::add_headers].
pub trait HeaderCompatibleOutput {
    /// Requests permitted per key within one sliding window.
    fn limit(&self) -> u64;

    /// Requests that would still be admitted right now.
    fn remaining(&self) -> u64;

    /// Seconds from now after which a key that sends no further requests is admitted again.
    ///
    /// Sent as both `x-ratelimit-reset` and `retry-after`, so it must not undershoot: a client
    /// that waits this long and is still denied will keep retrying into the limit. Zero if
    /// nothing counted against the key any longer.
    fn seconds_until_reset(&self) -> u64;
}

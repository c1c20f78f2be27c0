mod input_builder;
mod sliding_window;
mod window;

pub use input_builder::{Error as InputError, InputFunctionBuilder, InputFuture};
pub use sliding_window::{SlidingWindowBackend, SlidingWindowBackendBuilder, SlidingWindowOutput};
pub use window::WindowCounter;

use std::future::Future;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Allowed,
    Denied,
}

impl Decision {
    pub fn from_allowed(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn is_denied(self) -> bool {
        matches!(self, Self::Denied)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc) so that every clone handed to an actix worker counts against the same
/// limits.
pub trait Backend<I: 'static = String>: Clone {
    type Output;
    type Error;

    /// Process an incoming request.
    ///
    /// The input identifies who the request should be counted against, for the
    /// [SlidingWindowBackend] this is simply the rate limit key.
    ///
    /// Returns whether to allow or deny the request, along with arbitrary output that can be used
    /// to transform the allowed and denied responses.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(Decision, Self::Output), Self::Error>>;
}

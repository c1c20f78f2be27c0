//! Sliding window rate limiting middleware for actix-web.
//!
//! Each request is attributed to a key (the client address, or the value of a header) and
//! counted by a [SlidingWindowBackend](backend::SlidingWindowBackend). The backend smooths the
//! counts of the current and previous fixed windows into an estimate of the requests seen over
//! the last window length, and the [RateLimiter] middleware answers `429 Too Many Requests` once
//! that estimate exceeds the configured ceiling.
//!
//! ```no_run
//! use actix_sliding_window_rate_limit::backend::{InputFunctionBuilder, SlidingWindowBackend};
//! use actix_sliding_window_rate_limit::config::{KeySource, RateLimitConfig};
//! use actix_sliding_window_rate_limit::RateLimiter;
//! use actix_web::{web, App, HttpServer};
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = RateLimitConfig::new(60, 100, KeySource::Address);
//!     let backend = SlidingWindowBackend::from_config(&config)
//!         .build()
//!         .expect("invalid rate limit configuration");
//!     HttpServer::new(move || {
//!         let input = InputFunctionBuilder::from_config(&config).build();
//!         let limiter = RateLimiter::builder(backend.clone(), input)
//!             .add_headers()
//!             .build();
//!         App::new()
//!             .wrap(limiter)
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

pub mod backend;
pub mod config;
mod middleware;

pub use middleware::builder::{HeaderCompatibleOutput, RateLimiterBuilder};
pub use middleware::RateLimiter;

//! Shared utilities for TeleForge sources and sinks.
//!
//! - **DSN utilities**: connection string parsing and credential redaction
//! - **Retry logic**: exponential backoff with jitter, watchdog timeouts

pub mod dsn;
pub mod retry;

pub use dsn::{DsnComponents, broker_url, redact_url_password};

pub use retry::{RetryOutcome, RetryPolicy, retry_async, watchdog};

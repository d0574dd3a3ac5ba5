mod policy;

pub use policy::{BackoffKind, RetryPolicy, DEFAULT_MAX_BACKOFF};

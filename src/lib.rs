pub mod algorithms;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod error;
pub mod key_generator;
pub mod metrics;
pub mod policy;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod sweeper;
pub mod throttler;
pub mod tracker;

pub use algorithms::RateLimitStatus;
pub use cancel::{CancelHandle, CancelSignal};
pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use config::Settings;
pub use coordinator::{CoordinatorStats, RequestCoordinator};
pub use debounce::Debouncer;
pub use error::{CoordinatorError, OperationTimeout, RequestError, Result, ThrottlerError};
pub use key_generator::{request_key, KeyGenerator};
pub use policy::ExecutionPolicy;
pub use rate_limit_config::{Algorithm, RateLimitConfig};
pub use rate_limiter::{LimiterStats, RateLimiter};
pub use throttler::{Throttler, ThrottlerStats};
pub use tracker::{LoadingConfig, LoadingGuard, OperationTracker};

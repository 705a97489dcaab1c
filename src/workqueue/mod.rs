pub mod delaying;
pub mod queue;
pub mod rate_limiter;
pub mod rate_limiting;

pub use delaying::DelayingQueue;
pub use queue::WorkQueue;
pub use rate_limiter::{
    ExponentialBackoff, FastSlow, MaxOf, RateLimiter, TokenBucket, default_controller_rate_limiter,
};
pub use rate_limiting::RateLimitingQueue;

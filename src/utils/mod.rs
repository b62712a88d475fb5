//! Small helpers shared by the storage and trigger code

pub mod retry;
pub mod throttle;

pub use retry::RetryPolicy;
pub use throttle::RepeatThrottle;

//! Sliding-window rate limiting over the shared store.

mod backend;
mod clock;
mod limiter;
mod retry;
mod window;

pub use backend::AdmissionGate;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Admission, Decision, LimiterSettings, SlidingWindowLimiter};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use window::{SlidingWindow, DEFAULT_WINDOW};

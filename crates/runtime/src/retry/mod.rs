//! Bounded retries with poison-message quarantine.

pub mod error_tracker;
pub mod poison_queue;
pub mod step;

pub use error_tracker::{ErrorTracker, InMemErrorTracker};
pub use poison_queue::PoisonQueueErrorHandler;
pub use step::{DISPATCH_AS_FAILED_MESSAGE, RetryStep, SecondLevelDispatch};

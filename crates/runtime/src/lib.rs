//! Message-bus runtime: bounded retries, poison-message quarantine, exclusive saga
//! access and cancellable worker loops.
//!
//! Most hosts only need [`BusBuilder`], [`BusConfig`] and a transport from
//! `courier-messaging`:
//!
//! ```no_run
//! # async fn run() -> courier_core::BusResult<()> {
//! use std::sync::Arc;
//! use courier_messaging::{InMemNetwork, InMemTransport, handler_fn};
//! use courier_runtime::BusBuilder;
//!
//! let transport = Arc::new(InMemTransport::new(InMemNetwork::new(), "orders"));
//! let bus = BusBuilder::new(transport)
//!     .with_handler("PlaceOrder", Arc::new(handler_fn(|_msg, _ctx| async { Ok(()) })))
//!     .start()
//!     .await?;
//! bus.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod retry;
pub mod router;
pub mod sagas;
pub mod steps;
pub mod workers;


pub use bus::{Bus, BusBuilder, StepPosition};
pub use config::{
    BackoffConfig, BusConfig, ConfigError, ErrorTrackerConfig, RetryConfig, SagaLockConfig,
    WorkerConfig,
};
pub use retry::{ErrorTracker, InMemErrorTracker, PoisonQueueErrorHandler, RetryStep};
pub use router::Router;
pub use sagas::{
    ExclusiveAccessLock, ExclusiveSagaAccessStep, InMemoryLockTable, LockError, LockTable,
    PollingLock, PollingLockConfig, PostgresLockTable, SemaphoreBuckets,
};
pub use workers::{BackoffStrategy, DefaultBackoffStrategy};

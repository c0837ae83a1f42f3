//! Exclusive access to saga instances.
//!
//! ```text
//! (saga type, property, value) ──fnv1a──▶ bucket ──▶ ExclusiveAccessLock
//! ```
//!
//! Two backends share the [`ExclusiveAccessLock`] contract:
//! - [`SemaphoreBuckets`]: in-process, one semaphore per bucket
//! - [`PollingLock`] over a [`LockTable`] (e.g. [`PostgresLockTable`]) for several
//!   processes sharing one database

pub mod lock;
pub mod lock_key;
pub mod lock_table;
pub mod postgres;
pub mod step;

pub use lock::{ExclusiveAccessLock, LockError, SemaphoreBuckets};
pub use lock_key::{LockKey, fnv1a, lock_buckets, lock_keys};
pub use lock_table::{InMemoryLockTable, LockTable, PollingLock, PollingLockConfig};
pub use postgres::PostgresLockTable;
pub use step::ExclusiveSagaAccessStep;

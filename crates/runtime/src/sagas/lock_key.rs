//! Lock keys and bucket assignment for saga correlation.
//!
//! A lock key is `(saga data type, correlation property, correlation value)`. Keys are
//! hashed into a fixed number of buckets; unrelated sagas that land in the same bucket
//! simply share a lock.

use std::fmt;

use courier_core::Message;
use courier_messaging::HandlerInvokers;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Separator between key parts. Not expected in type or property names.
const KEY_SEPARATOR: u8 = 0x1f;

/// 64-bit FNV-1a. Stable across processes, which the distributed lock table relies on.
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub saga_data_type: String,
    pub property_name: String,
    pub value: String,
}

impl LockKey {
    pub fn new(
        saga_data_type: impl Into<String>,
        property_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            saga_data_type: saga_data_type.into(),
            property_name: property_name.into(),
            value: value.into(),
        }
    }

    /// Bucket index in `[0, max_buckets)`. `max_buckets` must be non-zero.
    pub fn bucket(&self, max_buckets: usize) -> usize {
        let mut bytes = Vec::with_capacity(
            self.saga_data_type.len() + self.property_name.len() + self.value.len() + 2,
        );
        bytes.extend_from_slice(self.saga_data_type.as_bytes());
        bytes.push(KEY_SEPARATOR);
        bytes.extend_from_slice(self.property_name.as_bytes());
        bytes.push(KEY_SEPARATOR);
        bytes.extend_from_slice(self.value.as_bytes());

        (fnv1a(&bytes) % max_buckets.max(1) as u64) as usize
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}={}", self.saga_data_type, self.property_name, self.value)
    }
}

/// Every lock key the saga handlers among `invokers` need for `message`.
pub fn lock_keys(invokers: &HandlerInvokers, message: &Message) -> Vec<LockKey> {
    invokers
        .sagas()
        .flat_map(|saga| {
            saga.correlation_values(message)
                .map(move |(property, value)| LockKey::new(saga.saga_data_type(), property, value))
        })
        .collect()
}

/// Buckets to acquire, de-duplicated and in ascending order.
///
/// Acquiring in one global order is what keeps two messages with overlapping bucket
/// sets from waiting on each other.
pub fn lock_buckets(invokers: &HandlerInvokers, message: &Message, max_buckets: usize) -> Vec<usize> {
    let mut buckets: Vec<usize> = lock_keys(invokers, message)
        .iter()
        .map(|key| key.bucket(max_buckets))
        .collect();
    buckets.sort_unstable();
    buckets.dedup();
    buckets
}

//! Time-partitioned unique id generator.
//!
//! An id is `(seconds since origin) << counter_bits | counter`, where the
//! counter is an atomic `INCR` on a key scoped to the namespace and the
//! current calendar day (UTC). The day in the key gives a daily reset
//! without any scheduled job.
//!
//! Ids are unique within a namespace and strictly increasing for
//! sequential calls from one process under a non-decreasing clock. They are
//! not globally monotonic across processes with skewed clocks.

use crate::kv::KvStore;
use rushline_core::keys::sequence_key;
use rushline_core::{Clock, RushlineResult, SequenceError, SequenceSettings};
use std::sync::Arc;

/// Widest counter a layout can reserve while keeping one timestamp bit.
pub const MAX_COUNTER_BITS: u32 = 63;

/// Allocates ids from the shared store.
#[derive(Clone)]
pub struct SequenceGenerator {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    origin_epoch_secs: i64,
    counter_bits: u32,
}

impl SequenceGenerator {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: &SequenceSettings) -> Self {
        Self {
            store,
            clock,
            origin_epoch_secs: settings.origin_epoch_secs,
            counter_bits: settings.counter_bits,
        }
    }

    pub fn counter_bits(&self) -> u32 {
        self.counter_bits
    }

    /// Allocate the next id in `namespace`.
    pub async fn next_id(&self, namespace: &str) -> RushlineResult<u64> {
        let now = self.clock.now();
        let elapsed = now.timestamp() - self.origin_epoch_secs;
        if elapsed < 0 {
            return Err(SequenceError::ClockBeforeOrigin {
                now_secs: now.timestamp(),
                origin_secs: self.origin_epoch_secs,
            }
            .into());
        }

        let Some(base) = compose_id(elapsed as u64, 0, self.counter_bits) else {
            return Err(SequenceError::LayoutOverflow {
                elapsed_secs: elapsed as u64,
                counter_bits: self.counter_bits,
            }
            .into());
        };

        let day = now.format("%Y:%m:%d").to_string();
        let counter = self.store.incr(&sequence_key(namespace, &day)).await?;
        if counter <= 0 || counter as u64 > self.max_counter() {
            tracing::error!(namespace = %namespace, counter, "Sequence counter out of range");
            return Err(SequenceError::CounterExhausted {
                namespace: namespace.to_string(),
                counter,
            }
            .into());
        }

        Ok(base | counter as u64)
    }

    fn max_counter(&self) -> u64 {
        counter_mask(self.counter_bits)
    }
}

fn counter_mask(counter_bits: u32) -> u64 {
    u64::MAX >> (64 - counter_bits.clamp(1, 64))
}

/// Pack a timestamp component and a counter into one id.
///
/// `None` when `counter_bits` is outside `1..=MAX_COUNTER_BITS` or either
/// component does not fit its bits.
pub fn compose_id(elapsed_secs: u64, counter: u64, counter_bits: u32) -> Option<u64> {
    if !(1..=MAX_COUNTER_BITS).contains(&counter_bits) || counter > counter_mask(counter_bits) {
        return None;
    }
    if elapsed_secs >> (64 - counter_bits) != 0 {
        return None;
    }
    Some((elapsed_secs << counter_bits) | counter)
}

/// Split an id back into `(elapsed_secs, counter)`.
pub fn decompose_id(id: u64, counter_bits: u32) -> (u64, u64) {
    let counter_bits = counter_bits.clamp(1, MAX_COUNTER_BITS);
    (id >> counter_bits, id & counter_mask(counter_bits))
}

//! In-process key-value store.
//!
//! One mutex guards the whole keyspace, so every method is atomic with
//! respect to every other, which is the same guarantee a single-threaded
//! Redis server gives its scripts. Expiry is lazy and measured on the tokio
//! clock, so tests can pause and advance time.

use super::traits::{KvStore, StreamEntry};
use async_trait::async_trait;
use rushline_core::{
    AdmissionVerdict, RejectReason, RushlineResult, StoreError, UserId, VoucherId, VoucherStock,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

const BACKEND: &str = "memory";

struct ValueSlot {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueSlot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct VoucherSlot {
    stock: i64,
    begin_ms: i64,
    end_ms: i64,
    admitted: HashSet<UserId>,
}

struct PendingEntry {
    consumer: String,
    delivery_count: u64,
    delivered_at: Instant,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: BTreeMap<u64, String>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct State {
    values: HashMap<String, ValueSlot>,
    vouchers: HashMap<VoucherId, VoucherSlot>,
    streams: HashMap<String, StreamState>,
}

impl State {
    /// Live value for `key`, dropping it if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut ValueSlot> {
        let expired = self.values.get(key).is_some_and(|slot| !slot.is_live(now));
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get_mut(key)
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> RushlineResult<(&mut GroupState, &BTreeMap<u64, String>)> {
        let missing = || StoreError::Query {
            reason: format!("NOGROUP no consumer group {} for stream {}", group, stream),
        };
        let state = self.streams.get_mut(stream).ok_or_else(missing)?;
        let group = state.groups.get_mut(group).ok_or_else(missing)?;
        Ok((group, &state.entries))
    }
}

fn entry_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// In-memory [`KvStore`] used by tests and single-process deployments.
pub struct InMemoryKvStore {
    state: Mutex<State>,
    appended: Notify,
    streams_available: AtomicBool,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            streams_available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage of the stream primitive. While unavailable,
    /// `stream_append` fails with `StoreError::Unavailable`.
    pub fn set_streams_available(&self, available: bool) {
        self.streams_available.store(available, Ordering::SeqCst);
    }

    /// Remaining in-memory stock of a published voucher.
    pub fn voucher_stock(&self, voucher_id: VoucherId) -> Option<i64> {
        self.lock().vouchers.get(&voucher_id).map(|slot| slot.stock)
    }

    /// Whether `user_id` holds an admission marker for the voucher.
    pub fn is_admitted(&self, voucher_id: VoucherId, user_id: UserId) -> bool {
        self.lock()
            .vouchers
            .get(&voucher_id)
            .is_some_and(|slot| slot.admitted.contains(&user_id))
    }

    /// Number of entries ever appended to a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map_or(0, |state| state.entries.len())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let (group_state, entries) = state.group_mut(stream, group)?;

        let mut delivered = Vec::new();
        for (&seq, payload) in entries.range(group_state.last_delivered + 1..).take(count.max(1)) {
            group_state.last_delivered = seq;
            group_state.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    delivered_at: now,
                },
            );
            delivered.push(StreamEntry {
                id: entry_id(seq),
                payload: payload.clone(),
                delivery_count: 1,
            });
        }
        Ok(delivered)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> RushlineResult<Option<String>> {
        let now = Instant::now();
        Ok(self.lock().live(key, now).map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RushlineResult<()> {
        let now = Instant::now();
        self.lock().values.insert(
            key.to_string(),
            ValueSlot {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RushlineResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            ValueSlot {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> RushlineResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        let existed = state.live(key, now).is_some();
        state.values.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> RushlineResult<i64> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.live(key, now) {
            Some(slot) => {
                let current: i64 = slot.value.parse().map_err(|_| StoreError::Codec {
                    reason: format!("value at {} is not an integer", key),
                })?;
                let next = current + 1;
                slot.value = next.to_string();
                Ok(next)
            }
            None => {
                state.values.insert(
                    key.to_string(),
                    ValueSlot {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> RushlineResult<bool> {
        let now = Instant::now();
        let mut state = self.lock();
        let matches = state
            .live(key, now)
            .is_some_and(|slot| slot.value == expected);
        if matches {
            state.values.remove(key);
        }
        Ok(matches)
    }

    async fn publish_voucher(
        &self,
        voucher: &VoucherStock,
        buyers: &[UserId],
    ) -> RushlineResult<()> {
        self.lock().vouchers.insert(
            voucher.voucher_id,
            VoucherSlot {
                stock: voucher.stock,
                begin_ms: voucher.begin_at.timestamp_millis(),
                end_ms: voucher.end_at.timestamp_millis(),
                admitted: buyers.iter().copied().collect(),
            },
        );
        Ok(())
    }

    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        now_ms: i64,
    ) -> RushlineResult<AdmissionVerdict> {
        let mut state = self.lock();
        let Some(slot) = state.vouchers.get_mut(&voucher_id) else {
            return Ok(AdmissionVerdict::Rejected(RejectReason::VoucherNotFound));
        };
        if now_ms < slot.begin_ms {
            return Ok(AdmissionVerdict::Rejected(RejectReason::NotStarted));
        }
        if now_ms > slot.end_ms {
            return Ok(AdmissionVerdict::Rejected(RejectReason::Ended));
        }
        if slot.admitted.contains(&user_id) {
            return Ok(AdmissionVerdict::Rejected(RejectReason::DuplicateOrder));
        }
        if slot.stock <= 0 {
            return Ok(AdmissionVerdict::Rejected(RejectReason::OutOfStock));
        }
        slot.stock -= 1;
        slot.admitted.insert(user_id);
        Ok(AdmissionVerdict::Admitted)
    }

    async fn revoke_admission(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> RushlineResult<bool> {
        let mut state = self.lock();
        let Some(slot) = state.vouchers.get_mut(&voucher_id) else {
            return Ok(false);
        };
        if slot.admitted.remove(&user_id) {
            slot.stock += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn stream_ensure_group(&self, stream: &str, group: &str) -> RushlineResult<()> {
        self.lock()
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn stream_append(&self, stream: &str, payload: &str) -> RushlineResult<String> {
        if !self.streams_available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(BACKEND, format!("stream {} offline", stream)).into());
        }
        let id = {
            let mut state = self.lock();
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            stream_state.next_seq += 1;
            let seq = stream_state.next_seq;
            stream_state.entries.insert(seq, payload.to_string());
            entry_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn stream_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> RushlineResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append between the
            // check and the wait still wakes us.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.deliver_new(stream, group, consumer, count)?;
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn stream_read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let (group_state, entries) = state.group_mut(stream, group)?;

        let mut redelivered = Vec::new();
        for (seq, pending) in group_state
            .pending
            .iter_mut()
            .filter(|(_, pending)| pending.consumer == consumer)
            .take(count.max(1))
        {
            let Some(payload) = entries.get(seq) else {
                continue;
            };
            pending.delivery_count += 1;
            pending.delivered_at = now;
            redelivered.push(StreamEntry {
                id: entry_id(*seq),
                payload: payload.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(redelivered)
    }

    async fn stream_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut state = self.lock();
        let (group_state, entries) = state.group_mut(stream, group)?;

        let mut claimed = Vec::new();
        for (seq, pending) in group_state
            .pending
            .iter_mut()
            .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
            .take(count.max(1))
        {
            let Some(payload) = entries.get(seq) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.delivery_count += 1;
            pending.delivered_at = now;
            claimed.push(StreamEntry {
                id: entry_id(*seq),
                payload: payload.clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> RushlineResult<bool> {
        let Some(seq) = parse_entry_id(id) else {
            return Ok(false);
        };
        let mut state = self.lock();
        let (group_state, _) = state.group_mut(stream, group)?;
        Ok(group_state.pending.remove(&seq).is_some())
    }

    async fn stream_pending_count(&self, stream: &str, group: &str) -> RushlineResult<u64> {
        let mut state = self.lock();
        let (group_state, _) = state.group_mut(stream, group)?;
        Ok(group_state.pending.len() as u64)
    }
}

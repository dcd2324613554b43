//! Redis-backed key-value store.
//!
//! Plain commands go over one multiplexed connection. Blocking stream reads
//! get a dedicated connection per consumer so a `BLOCK` never stalls the
//! commands of other callers.

use super::traits::{KvStore, StreamEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use rushline_core::keys::{voucher_orders_key, voucher_stock_key};
use rushline_core::{
    AdmissionVerdict, RushlineError, RushlineResult, StoreError, UserId, VoucherId, VoucherStock,
};
use std::collections::HashMap;
use std::time::Duration;

const BACKEND: &str = "redis";

/// Milliseconds for `PX` and `BLOCK`, never zero.
fn millis_arg(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

static COMPARE_AND_DELETE: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

// KEYS[1] stock hash, KEYS[2] admitted-user set; ARGV[1] user id, ARGV[2] now in ms.
// Return codes match AdmissionVerdict::from_code.
static ADMIT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 5
end
local window = redis.call('HMGET', KEYS[1], 'begin_ms', 'end_ms')
local now = tonumber(ARGV[2])
if now < tonumber(window[1]) then
  return 3
end
if now > tonumber(window[2]) then
  return 4
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return 2
end
if tonumber(redis.call('HGET', KEYS[1], 'stock')) <= 0 then
  return 1
end
redis.call('HINCRBY', KEYS[1], 'stock', -1)
redis.call('SADD', KEYS[2], ARGV[1])
return 0
"#,
    )
});

static REVOKE: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('SREM', KEYS[2], ARGV[1]) == 1 then
  redis.call('HINCRBY', KEYS[1], 'stock', 1)
  return 1
end
return 0
"#,
    )
});

/// Connection settings for the shared key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl RedisSettings {
    /// Reads `RUSHLINE_REDIS_URL`.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("RUSHLINE_REDIS_URL").unwrap_or_else(|_| Self::default().url),
        }
    }
}

fn store_err(err: redis::RedisError) -> RushlineError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        StoreError::unavailable(BACKEND, err).into()
    } else {
        StoreError::Query {
            reason: err.to_string(),
        }
        .into()
    }
}

fn script_err(script: &str, err: redis::RedisError) -> RushlineError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
        return store_err(err);
    }
    StoreError::Script {
        script: script.to_string(),
        reason: err.to_string(),
    }
    .into()
}

fn extract_entries(reply: Option<redis::streams::StreamReadReply>) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    let Some(reply) = reply else {
        return out;
    };
    for key in reply.keys {
        for id in key.ids {
            // Entries without a readable payload are still returned so the
            // consumer can acknowledge them; otherwise they stay pending.
            let payload = id
                .map
                .get("payload")
                .and_then(|value| redis::from_redis_value::<String>(value).ok())
                .unwrap_or_else(|| {
                    tracing::warn!(entry_id = %id.id, "Stream entry has no payload field");
                    String::new()
                });
            out.push(StreamEntry {
                id: id.id,
                payload,
                delivery_count: 1,
            });
        }
    }
    out
}

/// Parse the entries of an `XAUTOCLAIM` reply:
/// `[next-cursor, [[id, [field, value, ...]], ...], deleted-ids]`.
/// Entries deleted from the stream come back as nil and are skipped; Redis
/// drops them from the pending list itself.
fn parse_claimed(value: redis::Value) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    let redis::Value::Bulk(parts) = value else {
        return out;
    };
    let Some(redis::Value::Bulk(entries)) = parts.into_iter().nth(1) else {
        return out;
    };
    for entry in entries {
        let redis::Value::Bulk(entry) = entry else {
            continue;
        };
        let mut entry = entry.into_iter();
        let Some(id) = entry
            .next()
            .and_then(|v| redis::from_redis_value::<String>(&v).ok())
        else {
            continue;
        };
        let fields = match entry.next() {
            Some(redis::Value::Bulk(fields)) => fields,
            _ => continue,
        };
        let payload = fields
            .chunks(2)
            .find(|pair| {
                redis::from_redis_value::<String>(&pair[0]).is_ok_and(|name| name == "payload")
            })
            .and_then(|pair| pair.get(1))
            .and_then(|v| redis::from_redis_value::<String>(v).ok())
            .unwrap_or_else(|| {
                tracing::warn!(entry_id = %id, "Claimed stream entry has no payload field");
                String::new()
            });
        out.push(StreamEntry {
            id,
            payload,
            delivery_count: 2,
        });
    }
    out
}

/// Parse `XPENDING key group - + count consumer` into id -> delivery count.
fn parse_delivery_counts(value: redis::Value) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    let redis::Value::Bulk(entries) = value else {
        return out;
    };
    for entry in entries {
        let redis::Value::Bulk(parts) = entry else {
            continue;
        };
        if parts.len() < 4 {
            continue;
        }
        let id = redis::from_redis_value::<String>(&parts[0]).ok();
        let deliveries = redis::from_redis_value::<u64>(&parts[3]).ok();
        if let (Some(id), Some(deliveries)) = (id, deliveries) {
            out.insert(id, deliveries);
        }
    }
    out
}

/// [`KvStore`] over a Redis server.
pub struct RedisKvStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: DashMap<String, MultiplexedConnection>,
}

impl RedisKvStore {
    pub async fn connect(settings: &RedisSettings) -> RushlineResult<Self> {
        let client = redis::Client::open(settings.url.as_str()).map_err(store_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_err)?;
        tracing::info!(url = %settings.url, "Connected to redis");
        Ok(Self {
            client,
            conn,
            blocking: DashMap::new(),
        })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> RushlineResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(store_err)
    }

    async fn blocking_conn(&self, consumer: &str) -> RushlineResult<MultiplexedConnection> {
        if let Some(conn) = self.blocking.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_err)?;
        self.blocking.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> RushlineResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RushlineResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis_arg(ttl));
        }
        self.query(cmd).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> RushlineResult<bool> {
        // SET key val NX PX ttl: OK on success, nil when held
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis_arg(ttl));
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> RushlineResult<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let removed: u64 = self.query(cmd).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> RushlineResult<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> RushlineResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = COMPARE_AND_DELETE
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("compare_and_delete", e))?;
        Ok(removed > 0)
    }

    async fn publish_voucher(
        &self,
        voucher: &VoucherStock,
        buyers: &[UserId],
    ) -> RushlineResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(voucher_orders_key(voucher.voucher_id))
            .ignore();
        if !buyers.is_empty() {
            pipe.cmd("SADD")
                .arg(voucher_orders_key(voucher.voucher_id))
                .arg(buyers.iter().map(|user| user.get()).collect::<Vec<_>>())
                .ignore();
        }
        pipe.cmd("HSET")
            .arg(voucher_stock_key(voucher.voucher_id))
            .arg("stock")
            .arg(voucher.stock)
            .arg("begin_ms")
            .arg(voucher.begin_at.timestamp_millis())
            .arg("end_ms")
            .arg(voucher.end_at.timestamp_millis())
            .ignore();
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await.map_err(store_err)
    }

    async fn admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
        now_ms: i64,
    ) -> RushlineResult<AdmissionVerdict> {
        let mut conn = self.conn.clone();
        let code: i64 = ADMIT
            .key(voucher_stock_key(voucher_id))
            .key(voucher_orders_key(voucher_id))
            .arg(user_id.get())
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("admit", e))?;
        AdmissionVerdict::from_code(code).ok_or_else(|| {
            StoreError::Script {
                script: "admit".to_string(),
                reason: format!("unexpected return code {}", code),
            }
            .into()
        })
    }

    async fn revoke_admission(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> RushlineResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = REVOKE
            .key(voucher_stock_key(voucher_id))
            .key(voucher_orders_key(voucher_id))
            .arg(user_id.get())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("revoke_admission", e))?;
        Ok(removed > 0)
    }

    async fn stream_ensure_group(&self, stream: &str, group: &str) -> RushlineResult<()> {
        // XGROUP CREATE <stream> <group> 0 MKSTREAM
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
        let mut conn = self.conn.clone();
        match cmd.query_async::<_, ()>(&mut conn).await {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn stream_append(&self, stream: &str, payload: &str) -> RushlineResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*").arg("payload").arg(payload);
        self.query(cmd).await
    }

    async fn stream_read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> RushlineResult<Vec<StreamEntry>> {
        // XREADGROUP GROUP <group> <consumer> COUNT <count> [BLOCK <ms>] STREAMS <stream> >
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(millis_arg(block));
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let mut conn = self.blocking_conn(consumer).await?;
        let reply: Option<redis::streams::StreamReadReply> = match cmd.query_async(&mut conn).await {
            Ok(reply) => reply,
            Err(e) => {
                // Drop the connection so the next read reconnects.
                self.blocking.remove(consumer);
                return Err(store_err(e));
            }
        };
        Ok(extract_entries(reply))
    }

    async fn stream_read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>> {
        // Reading from id 0 returns this consumer's own pending entries.
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("STREAMS")
            .arg(stream)
            .arg("0");
        let reply: Option<redis::streams::StreamReadReply> = self.query(cmd).await?;
        let mut entries = extract_entries(reply);
        if entries.is_empty() {
            return Ok(entries);
        }

        let mut pending = redis::cmd("XPENDING");
        pending
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .arg(consumer);
        let counts = parse_delivery_counts(self.query(pending).await?);
        for entry in &mut entries {
            entry.delivery_count = counts.get(&entry.id).copied().unwrap_or(2);
        }
        Ok(entries)
    }

    async fn stream_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> RushlineResult<Vec<StreamEntry>> {
        // XAUTOCLAIM <stream> <group> <consumer> <min-idle-ms> 0-0 COUNT <count>
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
            .arg("0-0")
            .arg("COUNT")
            .arg(count.max(1));
        Ok(parse_claimed(self.query(cmd).await?))
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> RushlineResult<bool> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id);
        let acked: u64 = self.query(cmd).await?;
        Ok(acked > 0)
    }

    async fn stream_pending_count(&self, stream: &str, group: &str) -> RushlineResult<u64> {
        // XPENDING <stream> <group> -> [count, min-id, max-id, consumers]
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group);
        let summary: Vec<redis::Value> = self.query(cmd).await?;
        Ok(summary
            .first()
            .and_then(|v| redis::from_redis_value::<u64>(v).ok())
            .unwrap_or(0))
    }
}

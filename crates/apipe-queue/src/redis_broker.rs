//! Redis-backed broker.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:queue:{high|normal|low}`: sorted set of job ids scored by
//!   visibility time in microseconds
//! - `{prefix}:leases`: hash of lease token to lease JSON
//! - `{prefix}:lease_expiry`: sorted set of lease tokens scored by expiry ms
//! - `{prefix}:leased_jobs`: hash of job id to lease token
//! - `{prefix}:deliveries`: hash of job id to delivery count
//!
//! Every state change runs as a Lua script so a reference is never both
//! queued and leased.

use std::time::Duration;

use apipe_models::{JobId, Priority};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::{Lease, LeaseToken, QueueBroker, QueueDepth};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

// Shared by scripts: move expired leases back to their tier.
const RECLAIM_LUA: &str = r#"
local function reclaim(tiers, leases, expiry, leased_jobs, now, now_us)
  local expired = redis.call('ZRANGEBYSCORE', expiry, '-inf', now)
  for _, token in ipairs(expired) do
    local raw = redis.call('HGET', leases, token)
    if raw then
      local lease = cjson.decode(raw)
      redis.call('ZADD', tiers[lease.tier], now_us, lease.job_id)
      redis.call('HDEL', leases, token)
      if redis.call('HGET', leased_jobs, lease.job_id) == token then
        redis.call('HDEL', leased_jobs, lease.job_id)
      end
    end
    redis.call('ZREM', expiry, token)
  end
end
"#;

// KEYS: high, normal, low, leases, lease_expiry, leased_jobs, deliveries
// ARGV: now_ms, visibility_ms, token, worker_id, now_us
const LEASE_BODY: &str = r#"
local tiers = {KEYS[1], KEYS[2], KEYS[3]}
local now = tonumber(ARGV[1])
reclaim(tiers, KEYS[4], KEYS[5], KEYS[6], now, ARGV[5])

for i, tier in ipairs(tiers) do
  local head = redis.call('ZRANGEBYSCORE', tier, '-inf', ARGV[5], 'LIMIT', 0, 1)
  if #head > 0 then
    local job_id = head[1]
    redis.call('ZREM', tier, job_id)
    local count = redis.call('HINCRBY', KEYS[7], job_id, 1)
    local expires = now + tonumber(ARGV[2])
    local lease = cjson.encode({
      job_id = job_id, tier = i, worker_id = ARGV[4],
      delivery_count = count, leased_at = now, expires_at = expires
    })
    redis.call('HSET', KEYS[4], ARGV[3], lease)
    redis.call('ZADD', KEYS[5], expires, ARGV[3])
    redis.call('HSET', KEYS[6], job_id, ARGV[3])
    return lease
  end
end
return false
"#;

// KEYS: high, normal, low, leased_jobs
// ARGV: job_id, tier index, now_us
const ENQUEUE_LUA: &str = r#"
if redis.call('HEXISTS', KEYS[4], ARGV[1]) == 1 then return 0 end
for i = 1, 3 do
  if redis.call('ZSCORE', KEYS[i], ARGV[1]) then return 0 end
end
redis.call('ZADD', KEYS[tonumber(ARGV[2])], ARGV[3], ARGV[1])
return 1
"#;

// KEYS: high, normal, low, leases, lease_expiry, leased_jobs, deliveries
// ARGV: token, now_ms, mode ('ack' | 'nack'), requeue_at_us, now_us
const SETTLE_BODY: &str = r#"
local tiers = {KEYS[1], KEYS[2], KEYS[3]}
local now = tonumber(ARGV[2])
reclaim(tiers, KEYS[4], KEYS[5], KEYS[6], now, ARGV[5])

local raw = redis.call('HGET', KEYS[4], ARGV[1])
if not raw then return 0 end
local lease = cjson.decode(raw)
redis.call('HDEL', KEYS[4], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('HDEL', KEYS[6], lease.job_id)
if ARGV[3] == 'nack' then
  redis.call('ZADD', tiers[lease.tier], ARGV[4], lease.job_id)
else
  redis.call('HDEL', KEYS[7], lease.job_id)
end
return 1
"#;

#[derive(Debug, Serialize, Deserialize)]
struct StoredLease {
    job_id: String,
    tier: usize,
    worker_id: String,
    delivery_count: u32,
    leased_at: i64,
    expires_at: i64,
}

fn tier_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

fn tier_priority(index: usize) -> Priority {
    match index {
        1 => Priority::High,
        3 => Priority::Low,
        _ => Priority::Normal,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// Scores stay below 2^53, so they are exact as Redis doubles.
fn now_us() -> i64 {
    Utc::now().timestamp_micros()
}

fn ms_to_datetime(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Broker backed by Redis sorted sets and Lua scripts.
#[derive(Clone)]
pub struct RedisBroker {
    conn: MultiplexedConnection,
    prefix: String,
    poll_interval: Duration,
    lease_script: Script,
    enqueue_script: Script,
    settle_script: Script,
}

impl RedisBroker {
    /// Connect using the given configuration.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        info!(prefix = %config.key_prefix, "Connected Redis broker");

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            poll_interval: config.poll_interval,
            lease_script: Script::new(&format!("{}{}", RECLAIM_LUA, LEASE_BODY)),
            enqueue_script: Script::new(ENQUEUE_LUA),
            settle_script: Script::new(&format!("{}{}", RECLAIM_LUA, SETTLE_BODY)),
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(&QueueConfig::from_env()).await
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn tier_keys(&self) -> [String; 3] {
        [
            self.key("queue:high"),
            self.key("queue:normal"),
            self.key("queue:low"),
        ]
    }

    async fn try_lease(&self, worker_id: &str, visibility_timeout: Duration) -> QueueResult<Option<Lease>> {
        let mut conn = self.conn.clone();
        let token = LeaseToken::new();

        let mut invocation = self.lease_script.prepare_invoke();
        for key in self.tier_keys() {
            invocation.key(key);
        }
        invocation
            .key(self.key("leases"))
            .key(self.key("lease_expiry"))
            .key(self.key("leased_jobs"))
            .key(self.key("deliveries"))
            .arg(now_ms())
            .arg(visibility_timeout.as_millis() as i64)
            .arg(token.as_str())
            .arg(worker_id)
            .arg(now_us());

        let raw: Option<String> = invocation.invoke_async(&mut conn).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let stored: StoredLease = serde_json::from_str(&raw)?;
        Ok(Some(Lease {
            job_id: JobId::from_string(stored.job_id),
            token,
            worker_id: stored.worker_id,
            priority: tier_priority(stored.tier),
            delivery_count: stored.delivery_count,
            leased_at: ms_to_datetime(stored.leased_at),
            expires_at: ms_to_datetime(stored.expires_at),
        }))
    }

    async fn settle(&self, token: &LeaseToken, requeue_delay: Option<Duration>) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let now_micros = now_us();
        let (mode, requeue_at) = match requeue_delay {
            Some(delay) => ("nack", now_micros + delay.as_micros() as i64),
            None => ("ack", now_micros),
        };

        let mut invocation = self.settle_script.prepare_invoke();
        for key in self.tier_keys() {
            invocation.key(key);
        }
        invocation
            .key(self.key("leases"))
            .key(self.key("lease_expiry"))
            .key(self.key("leased_jobs"))
            .key(self.key("deliveries"))
            .arg(token.as_str())
            .arg(now)
            .arg(mode)
            .arg(requeue_at)
            .arg(now_micros);

        let settled: i64 = invocation.invoke_async(&mut conn).await?;
        if settled == 1 {
            debug!(token = %token, mode, "Lease settled");
            Ok(())
        } else {
            Err(QueueError::lease_not_found(token.as_str()))
        }
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        let mut invocation = self.enqueue_script.prepare_invoke();
        for key in self.tier_keys() {
            invocation.key(key);
        }
        invocation
            .key(self.key("leased_jobs"))
            .arg(job_id.as_str())
            .arg(tier_index(priority))
            .arg(now_us());

        let added: i64 = invocation.invoke_async(&mut conn).await?;
        if added == 1 {
            debug!(job_id = %job_id, priority = %priority, "Enqueued");
        } else {
            debug!(job_id = %job_id, "Job already held by broker, enqueue ignored");
        }
        Ok(())
    }

    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
        wait: Option<Duration>,
    ) -> QueueResult<Option<Lease>> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);

        loop {
            if let Some(lease) = self.try_lease(worker_id, visibility_timeout).await? {
                return Ok(Some(lease));
            }

            match deadline {
                Some(d) if tokio::time::Instant::now() < d => {
                    let remaining = d - tokio::time::Instant::now();
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn ack(&self, token: &LeaseToken) -> QueueResult<()> {
        self.settle(token, None).await
    }

    async fn nack(&self, token: &LeaseToken, delay: Duration) -> QueueResult<()> {
        self.settle(token, Some(delay)).await
    }

    async fn contains(&self, job_id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let [high, normal, low] = self.tier_keys();

        let (leased, in_high, in_normal, in_low): (bool, Option<f64>, Option<f64>, Option<f64>) =
            redis::pipe()
                .hexists(self.key("leased_jobs"), job_id.as_str())
                .zscore(high, job_id.as_str())
                .zscore(normal, job_id.as_str())
                .zscore(low, job_id.as_str())
                .query_async(&mut conn)
                .await?;

        Ok(leased || in_high.is_some() || in_normal.is_some() || in_low.is_some())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.conn.clone();
        let visible_max = now_us();
        let mut depth = QueueDepth::default();

        for (index, key) in self.tier_keys().into_iter().enumerate() {
            let (ready, delayed): (usize, usize) = redis::pipe()
                .zcount(&key, "-inf", visible_max)
                .zcount(&key, format!("({}", visible_max), "+inf")
                .query_async(&mut conn)
                .await?;
            let tier = depth.tier_mut(tier_priority(index + 1));
            tier.ready = ready;
            tier.delayed = delayed;
        }

        let leases: Vec<String> = redis::cmd("HVALS")
            .arg(self.key("leases"))
            .query_async(&mut conn)
            .await?;
        for raw in leases {
            let stored: StoredLease = serde_json::from_str(&raw)?;
            depth.tier_mut(tier_priority(stored.tier)).leased += 1;
        }

        Ok(depth)
    }
}

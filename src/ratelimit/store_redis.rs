//! Redis rate limit store.
//!
//! Evaluation runs server-side as a Lua script so read-evaluate-write is
//! atomic per key across every instance sharing the Redis server. The script
//! mirrors [`LimitPolicy::evaluate`]; committed state expires once it would
//! have refilled to capacity, see [`LimitPolicy::retention_millis`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::policy::{BucketState, EvalMode, Evaluation, LimitPolicy, LimitRequest};
use super::store::RateLimitStore;
use super::{RateLimitError, StorageResultExt, StoreResult};

const EVALUATE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local kind = ARGV[2]
local rate = tonumber(ARGV[3])
local period = tonumber(ARGV[4])
local capacity = tonumber(ARGV[5])
local start = tonumber(ARGV[6])
local count = tonumber(ARGV[7])
local reserve = ARGV[8] == '1'
local commit = ARGV[9] == '1'

local stored = redis.call('HMGET', KEYS[1], 'value', 'ts')
local value, ts
if stored[1] and stored[2] then
  value = tonumber(stored[1])
  ts = tonumber(stored[2])
else
  value = capacity
  if kind == 'fixed_window' then
    ts = now - ((now - start) % period)
  else
    ts = now
  end
end

if now > ts then
  if kind == 'fixed_window' then
    local windows = math.floor((now - ts) / period)
    if windows > 0 then
      value = math.min(value + windows * rate, capacity)
      ts = ts + windows * period
    end
  else
    value = math.min(value + (now - ts) * rate / period, capacity)
    ts = now
  end
end

local ok, deficit
if reserve then
  ok = commit or value > 0
  deficit = -value
else
  ok = value >= count
  deficit = count - value
end

local retry = -1
if ok then
  value = value - count
  if commit then
    redis.call('HSET', KEYS[1], 'value', tostring(value), 'ts', tostring(ts))
    local missing = math.max(capacity - value, 0)
    local refill
    if kind == 'fixed_window' then
      refill = math.max(ts + math.ceil(missing / rate) * period - now, 0)
    else
      refill = math.ceil(missing * period / rate)
    end
    redis.call('PEXPIRE', KEYS[1], refill + period)
  end
elseif reserve or count <= capacity then
  if kind == 'fixed_window' then
    local windows
    if reserve then windows = math.floor(deficit / rate) + 1 else windows = math.ceil(deficit / rate) end
    retry = ts + windows * period - now
  else
    if reserve then retry = math.floor(deficit * period / rate) + 1 else retry = math.ceil(deficit * period / rate) end
  end
  if retry < 0 then retry = 0 end
end

return { ok and 1 or 0, tostring(value), tostring(ts), tostring(retry) }
"#;

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Initial backoff duration for retries.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "chat_gate:ratelimit:".to_string(),
            connection_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(RateLimitError::Storage {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

pub struct RedisRateLimitStore {
    client: Arc<redis::Client>,
    config: RedisConfig,
    script: redis::Script,
}

impl RedisRateLimitStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
            script: redis::Script::new(EVALUATE_SCRIPT),
        })
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        self.config = self.config.prefix(prefix)?;
        Ok(self)
    }

    fn state_key(&self, limit: &str, key: &str) -> String {
        format!("{}{}:{}", self.config.key_prefix, limit, key)
    }

    async fn get_connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        super::with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            Self::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .storage_err_ctx("connection timeout")?
                .storage_err()
            },
        )
        .await
    }

    fn is_retryable(error: &RateLimitError) -> bool {
        match error {
            RateLimitError::Storage { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
                    || message.contains("CLUSTERDOWN")
            }
            _ => false,
        }
    }

    fn parse_reply(reply: (i64, String, String, String)) -> StoreResult<Evaluation> {
        let (ok, value, ts, retry) = reply;
        let value: f64 = value.parse().storage_err_ctx("invalid value")?;
        let ts: f64 = ts.parse().storage_err_ctx("invalid timestamp")?;
        let retry: f64 = retry.parse().storage_err_ctx("invalid retry")?;

        Ok(Evaluation {
            ok: ok == 1,
            retry_after: (retry >= 0.0).then(|| Duration::from_millis(retry as u64)),
            state: BucketState {
                value,
                ts: ts as i64,
            },
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn evaluate(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        request: LimitRequest,
        mode: EvalMode,
        now: i64,
    ) -> StoreResult<Evaluation> {
        let mut conn = self.get_connection().await?;

        let reply: (i64, String, String, String) = self
            .script
            .key(self.state_key(limit, key))
            .arg(now)
            .arg(policy.kind.as_str())
            .arg(policy.rate)
            .arg(policy.period_ms.max(1))
            .arg(policy.effective_capacity())
            .arg(policy.start_ms.unwrap_or(0))
            .arg(request.count)
            .arg(if request.reserve { "1" } else { "0" })
            .arg(if mode == EvalMode::Consume { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .storage_err()?;

        Self::parse_reply(reply)
    }

    async fn snapshot(
        &self,
        limit: &str,
        key: &str,
        policy: &LimitPolicy,
        now: i64,
    ) -> StoreResult<BucketState> {
        let mut conn = self.get_connection().await?;
        let stored: (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.state_key(limit, key))
            .arg("value")
            .arg("ts")
            .query_async(&mut conn)
            .await
            .storage_err()?;

        let state = match stored {
            (Some(value), Some(ts)) => Some(BucketState {
                value: value.parse().storage_err_ctx("invalid value")?,
                ts: ts.parse::<f64>().storage_err_ctx("invalid timestamp")? as i64,
            }),
            _ => None,
        };
        Ok(policy.replenish(state, now))
    }

    async fn reset(&self, limit: &str, key: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, ()>(self.state_key(limit, key))
            .await
            .storage_err()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryRateLimitStore;

    fn store() -> RedisRateLimitStore {
        RedisRateLimitStore::new("redis://127.0.0.1/").unwrap()
    }

    #[test]
    fn test_state_key_layout() {
        let store = store().prefix("app:rl:").unwrap();
        assert_eq!(store.state_key("send_message", "u1"), "app:rl:send_message:u1");
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        assert!(RedisConfig::default().prefix("bad prefix!").is_err());
    }

    #[test]
    fn test_parse_reply() {
        let eval = RedisRateLimitStore::parse_reply((
            0,
            "-150".to_string(),
            "1700000000000".to_string(),
            "90001".to_string(),
        ))
        .unwrap();
        assert!(!eval.ok);
        assert_eq!(eval.state.value, -150.0);
        assert_eq!(eval.state.ts, 1_700_000_000_000);
        assert_eq!(eval.retry_after, Some(Duration::from_millis(90_001)));

        let allowed =
            RedisRateLimitStore::parse_reply((1, "0.5".into(), "0".into(), "-1".into())).unwrap();
        assert!(allowed.ok);
        assert!(allowed.retry_after.is_none());
    }

    /// Needs a live server:
    /// `CHAT_GATE_TEST_REDIS_URL=redis://127.0.0.1/ cargo test --features redis-backend -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_script_matches_memory_store() {
        let Ok(url) = std::env::var("CHAT_GATE_TEST_REDIS_URL") else {
            return;
        };
        let server = RedisRateLimitStore::new(&url)
            .unwrap()
            .prefix(format!("chat_gate_test:{}:", uuid::Uuid::new_v4().simple()))
            .unwrap();
        let memory = MemoryRateLimitStore::new();

        let window = LimitPolicy::fixed_window(1.0, Duration::from_secs(5)).with_capacity(2.0);
        let bucket =
            LimitPolicy::token_bucket(2_000.0, Duration::from_secs(60)).with_capacity(10_000.0);
        let t0: i64 = 1_700_000_000_000;
        let steps = [
            (window, LimitRequest::default(), EvalMode::Consume, t0),
            (window, LimitRequest::default(), EvalMode::Consume, t0 + 1_000),
            (window, LimitRequest::default(), EvalMode::Consume, t0 + 2_000),
            (window, LimitRequest::default(), EvalMode::Check, t0 + 5_000),
            (window, LimitRequest::new(3.0), EvalMode::Consume, t0 + 6_000),
            (bucket, LimitRequest::reserved(400.0), EvalMode::Check, t0),
            (bucket, LimitRequest::reserved(12_000.0), EvalMode::Consume, t0),
            (bucket, LimitRequest::reserved(5_000.0), EvalMode::Consume, t0 + 3_000),
            (bucket, LimitRequest::reserved(1.0), EvalMode::Check, t0 + 6_000),
            (bucket, LimitRequest::new(500.0), EvalMode::Consume, t0 + 9_000),
        ];

        for (step, (policy, request, mode, now)) in steps.into_iter().enumerate() {
            let limit = policy.kind.as_str();
            let expected = memory
                .evaluate(limit, "u1", &policy, request, mode, now)
                .await
                .unwrap();
            let actual = server
                .evaluate(limit, "u1", &policy, request, mode, now)
                .await
                .unwrap();
            assert_eq!(actual.ok, expected.ok, "step {}", step);
            assert_eq!(actual.state, expected.state, "step {}", step);
            assert_eq!(actual.retry_after, expected.retry_after, "step {}", step);
        }

        // Last committed bucket state: -6900 at t0 + 3s.
        let committed = BucketState {
            value: -6_900.0,
            ts: t0 + 3_000,
        };
        let expected_ttl = bucket.retention_millis(&committed, committed.ts) as i64;
        let mut conn = server.get_connection().await.unwrap();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(server.state_key("token_bucket", "u1"))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl <= expected_ttl && ttl > expected_ttl - 10_000, "ttl {}", ttl);

        for policy in [window, bucket] {
            server.reset(policy.kind.as_str(), "u1").await.unwrap();
        }
    }
}

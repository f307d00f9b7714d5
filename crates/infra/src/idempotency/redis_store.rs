//! Redis-backed idempotency store.
//!
//! - claim: `SET <key> processing NX PX <lease>`, then `GET` on conflict to
//!   tell a processed marker from a live lease
//! - mark: `SET <key> processed PX <ttl>`
//! - release: compare-and-delete script, so a processed marker is never removed

use std::sync::Arc;
use std::time::Duration;

use super::{ClaimOutcome, IdempotencyError, IdempotencyStore};

const PROCESSING: &str = "processing";
const PROCESSED: &str = "processed";

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisIdempotencyStore {
    client: Arc<redis::Client>,
}

impl RedisIdempotencyStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, IdempotencyError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| IdempotencyError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, IdempotencyError> {
        self.client
            .get_connection()
            .map_err(|e| IdempotencyError::Unavailable(e.to_string()))
    }
}

fn storage_error(command: &str, e: redis::RedisError) -> IdempotencyError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        return IdempotencyError::Unavailable(format!("{} failed: {}", command, e));
    }
    IdempotencyError::Storage(format!("{} failed: {}", command, e))
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

impl IdempotencyStore for RedisIdempotencyStore {
    fn try_claim(&self, key: &str, lease: Duration) -> Result<ClaimOutcome, IdempotencyError> {
        let mut conn = self.connection()?;

        let reply: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg(PROCESSING)
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query(&mut conn)
            .map_err(|e| storage_error("SET NX", e))?;

        if !matches!(reply, redis::Value::Nil) {
            return Ok(ClaimOutcome::Claimed);
        }

        // A record vanishing between SET and GET reads as in flight; the
        // entry stays pending and the next attempt claims it.
        let existing: Option<String> = redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| storage_error("GET", e))?;
        match existing.as_deref() {
            Some(PROCESSED) => Ok(ClaimOutcome::Processed),
            _ => Ok(ClaimOutcome::InFlight),
        }
    }

    fn mark_processed(&self, key: &str, ttl: Duration) -> Result<(), IdempotencyError> {
        let mut conn = self.connection()?;

        let _: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg(PROCESSED)
            .arg("PX")
            .arg(millis(ttl))
            .query(&mut conn)
            .map_err(|e| storage_error("SET", e))?;
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut conn = self.connection()?;

        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(PROCESSING)
            .query(&mut conn)
            .map_err(|e| storage_error("EVAL release", e))?;
        Ok(())
    }

    fn is_processed(&self, key: &str) -> Result<bool, IdempotencyError> {
        let mut conn = self.connection()?;

        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| storage_error("GET", e))?;
        Ok(value.as_deref() == Some(PROCESSED))
    }
}

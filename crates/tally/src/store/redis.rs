//! Redis-backed aggregate store.
//!
//! Layout, for a key prefix `p`:
//!
//! - `p:count:{type}` - number of events seen, as a float string
//! - `p:sum:{type}` - sum of event values, as a float string
//! - `p:event_types` - set of registered type names
//!
//! Increments run as a `MULTI`/`EXEC` pipeline so readers never see a count
//! without its matching sum. Reset and the full snapshot read the type set
//! and touch every per-type key inside one Lua script, so a concurrent
//! increment of a new type lands either entirely before or entirely after.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use snafu::prelude::*;
use tally_core::emit;
use tally_core::metrics::events::RequestStatus;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{AggregateStats, AggregateStore};
use crate::error::{CorruptSnafu, RedisSnafu, StoreError};
use crate::metrics::{StoreOperation, StoreRequest};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// KEYS[1] = type set, ARGV[1] = key prefix. Returns the number of types cleared.
const RESET_SCRIPT: &str = r"
local types = redis.call('SMEMBERS', KEYS[1])
for _, t in ipairs(types) do
    redis.call('DEL', ARGV[1] .. ':count:' .. t, ARGV[1] .. ':sum:' .. t)
end
redis.call('DEL', KEYS[1])
return #types
";

/// KEYS[1] = type set, ARGV[1] = key prefix. Returns `[type, count, sum, ...]`
/// for every type whose count and sum both exist.
const SNAPSHOT_SCRIPT: &str = r"
local types = redis.call('SMEMBERS', KEYS[1])
local out = {}
for _, t in ipairs(types) do
    local count = redis.call('GET', ARGV[1] .. ':count:' .. t)
    local sum = redis.call('GET', ARGV[1] .. ':sum:' .. t)
    if count and sum then
        table.insert(out, t)
        table.insert(out, count)
        table.insert(out, sum)
    end
end
return out
";

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub key_prefix: String,
}

impl RedisStoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    prefix: String,
    reset_script: redis::Script,
    snapshot_script: redis::Script,
}

impl RedisStore {
    /// Create a store. No connection is made until the first call.
    pub fn new(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url()).context(RedisSnafu)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            prefix: config.key_prefix.clone(),
            reset_script: redis::Script::new(RESET_SCRIPT),
            snapshot_script: redis::Script::new(SNAPSHOT_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                debug!("Connecting to Redis");
                let config = ConnectionManagerConfig::new()
                    .set_connection_timeout(CONNECT_TIMEOUT)
                    .set_response_timeout(RESPONSE_TIMEOUT)
                    .set_number_of_retries(1);
                ConnectionManager::new_with_config(self.client.clone(), config).await
            })
            .await
            .context(RedisSnafu)?;
        Ok(manager.clone())
    }

    fn count_key(&self, event_type: &str) -> String {
        format!("{}:count:{}", self.prefix, event_type)
    }

    fn sum_key(&self, event_type: &str) -> String {
        format!("{}:sum:{}", self.prefix, event_type)
    }

    fn types_key(&self) -> String {
        format!("{}:event_types", self.prefix)
    }

    async fn try_ping(&self) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(reply == "PONG")
    }

    async fn try_increment(&self, event_type: &str, value: f64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("INCRBYFLOAT")
            .arg(self.count_key(event_type))
            .arg(1)
            .ignore()
            .cmd("INCRBYFLOAT")
            .arg(self.sum_key(event_type))
            .arg(value)
            .ignore()
            .cmd("SADD")
            .arg(self.types_key())
            .arg(event_type)
            .ignore()
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        Ok(())
    }

    async fn try_get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError> {
        let mut conn = self.connection().await?;
        let count_key = self.count_key(event_type);
        let sum_key = self.sum_key(event_type);

        let (count, sum): (Option<String>, Option<String>) = redis::cmd("MGET")
            .arg(&count_key)
            .arg(&sum_key)
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)?;

        stats_from_keys((count_key.as_str(), count), (sum_key.as_str(), sum))
    }

    async fn try_get_all(&self) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        let mut conn = self.connection().await?;
        let flat: Vec<String> = self
            .snapshot_script
            .key(self.types_key())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        self.parse_snapshot(flat)
    }

    fn parse_snapshot(
        &self,
        flat: Vec<String>,
    ) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        let mut all = BTreeMap::new();
        let mut fields = flat.into_iter();
        while let (Some(event_type), Some(count), Some(sum)) =
            (fields.next(), fields.next(), fields.next())
        {
            let stats = AggregateStats {
                count: parse_float(&self.count_key(&event_type), count)?,
                sum: parse_float(&self.sum_key(&event_type), sum)?,
            };
            all.insert(event_type, stats);
        }
        Ok(all)
    }

    async fn try_list_types(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("SMEMBERS")
            .arg(self.types_key())
            .query_async(&mut conn)
            .await
            .context(RedisSnafu)
    }

    async fn try_reset_all(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let cleared: u64 = self
            .reset_script
            .key(self.types_key())
            .arg(&self.prefix)
            .invoke_async(&mut conn)
            .await
            .context(RedisSnafu)?;
        debug!(types = cleared, "Reset all aggregates");
        Ok(())
    }
}

fn parse_float(key: &str, value: String) -> Result<f64, StoreError> {
    match value.parse::<f64>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => CorruptSnafu { key, value }.fail(),
    }
}

/// A type only exists once both halves of its increment have landed.
fn stats_from_keys(
    (count_key, count): (&str, Option<String>),
    (sum_key, sum): (&str, Option<String>),
) -> Result<Option<AggregateStats>, StoreError> {
    let (Some(count), Some(sum)) = (count, sum) else {
        return Ok(None);
    };
    Ok(Some(AggregateStats {
        count: parse_float(count_key, count)?,
        sum: parse_float(sum_key, sum)?,
    }))
}

fn record<T>(operation: StoreOperation, result: Result<T, StoreError>) -> Result<T, StoreError> {
    emit!(StoreRequest {
        operation,
        status: RequestStatus::of(&result),
    });
    result
}

#[async_trait]
impl AggregateStore for RedisStore {
    async fn ping(&self) -> bool {
        match record(StoreOperation::Ping, self.try_ping().await) {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                false
            }
        }
    }

    async fn increment(&self, event_type: &str, value: f64) -> Result<(), StoreError> {
        record(
            StoreOperation::Increment,
            self.try_increment(event_type, value).await,
        )
    }

    async fn get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError> {
        record(StoreOperation::Get, self.try_get(event_type).await)
    }

    async fn list_types(&self) -> Result<BTreeSet<String>, StoreError> {
        record(StoreOperation::List, self.try_list_types().await)
    }

    async fn get_all(&self) -> Result<BTreeMap<String, AggregateStats>, StoreError> {
        record(StoreOperation::GetAll, self.try_get_all().await)
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        record(StoreOperation::Reset, self.try_reset_all().await)
    }
}

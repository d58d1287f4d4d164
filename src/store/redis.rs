use super::{Fields, SessionStore};
use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Sets ARGV[1] to ARGV[2] on hash KEYS[1] when its current value is one of ARGV[3..]
const COMPARE_AND_SET: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then
    return 0
end
for i = 3, #ARGV do
    if current == ARGV[i] then
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        return 1
    end
end
return 0
";

/// Sets field/value pairs from ARGV on hash KEYS[1] only if the hash exists
const UPDATE_EXISTING: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
";

/// Record store backed by Redis hashes
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    compare_and_set: Script,
    update_existing: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            conn,
            op_timeout,
            compare_and_set: Script::new(COMPARE_AND_SET),
            update_existing: Script::new(UPDATE_EXISTING),
        }
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, call).await {
            Ok(result) => result.with_context(|| format!("Redis {} failed", what)),
            Err(_) => Err(anyhow!("Redis {} timed out after {:?}", what, self.op_timeout)),
        }
    }
}

fn items(fields: &Fields) -> Vec<(&str, &str)> {
    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

#[async_trait::async_trait]
impl SessionStore for RedisStore {
    async fn put(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        if !fields.is_empty() {
            pipe.hset_multiple(key, &items(fields)).ignore();
        }
        pipe.expire(key, ttl.as_secs().max(1) as i64).ignore();

        self.bounded::<()>("HSET/EXPIRE", pipe.query_async(&mut conn)).await
    }

    async fn update(&self, key: &str, fields: &Fields) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.update_existing.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let _patched: i64 = self.bounded("HSET", invocation.invoke_async(&mut conn)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Fields>> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = self.bounded("HGETALL", conn.hgetall(key)).await?;

        if record.is_empty() {
            return Ok(None);
        }
        Ok(Some(record.into_iter().collect()))
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        self.bounded("DEL", conn.del(keys)).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = self
                .bounded(
                    "SCAN",
                    redis::cmd("SCAN")
                        .cursor_arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;

            keys.extend(batch.into_iter().filter(|key| key.starts_with(prefix)));
            cursor = next_cursor;

            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn compare_and_set(&self, key: &str, field: &str, expected: &[&str], new: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let mut invocation = self.compare_and_set.key(key);
        invocation.arg(field).arg(new);
        for value in expected {
            invocation.arg(*value);
        }

        let swapped: i64 = self
            .bounded("compare-and-set", invocation.invoke_async(&mut conn))
            .await?;
        Ok(swapped == 1)
    }
}

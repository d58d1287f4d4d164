//! Key/value records with field-level merge-patch updates and expiry
//!
//! Sessions and chunks are stored as flat string maps. Writers only ever
//! overwrite the fields they name, so concurrent actors touching different
//! fields of the same record never clobber each other. Status changes go
//! through [`SessionStore::compare_and_set`] so a record can only move along
//! an allowed edge once.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;

/// A record's fields
pub type Fields = BTreeMap<String, String>;

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Merge `fields` into the record (creating it) and (re)set its expiry
    async fn put(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()>;

    /// Merge `fields` into an existing record without touching its expiry.
    /// A missing or expired record stays missing.
    async fn update(&self, key: &str, fields: &Fields) -> Result<()>;

    /// All fields of a record, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Fields>>;

    /// Delete records, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Keys starting with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically set `field` to `new` if its current value is one of
    /// `expected`. Returns whether the write happened. A missing record or
    /// field never matches.
    async fn compare_and_set(&self, key: &str, field: &str, expected: &[&str], new: &str) -> Result<bool>;
}

/// Build a [`Fields`] map from string pairs
pub fn fields<K, V, I>(pairs: I) -> Fields
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

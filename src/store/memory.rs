use super::{Fields, SessionStore};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// In-process record store with lazy expiry
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
}

struct Record {
    fields: Fields,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locked map with expired records already dropped
    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        records.retain(|_, record| record.is_live(now));
        records
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, key: &str, fields: &Fields, ttl: Duration) -> Result<()> {
        let mut records = self.records();
        let record = records.entry(key.to_string()).or_insert_with(|| Record {
            fields: Fields::new(),
            expires_at: None,
        });
        record.fields.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        record.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn update(&self, key: &str, fields: &Fields) -> Result<()> {
        if let Some(record) = self.records().get_mut(key) {
            record.fields.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Fields>> {
        Ok(self.records().get(key).map(|record| record.fields.clone()))
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut records = self.records();
        Ok(keys.iter().filter(|key| records.remove(key.as_str()).is_some()).count())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .records()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn compare_and_set(&self, key: &str, field: &str, expected: &[&str], new: &str) -> Result<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };

        match record.fields.get(field) {
            Some(current) if expected.contains(&current.as_str()) => {
                record.fields.insert(field.to_string(), new.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

//! In-process lock store for local runs and tests

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LockRecord, LockStore};
use crate::error::{GrafanaLambdaError, Result};

/// Lock store backed by a map, with optional scripted failures
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<String, i64>>,
    failures: Mutex<VecDeque<GrafanaLambdaError>>,
    put_attempts: Mutex<usize>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next store call fail with `error` before touching state
    pub fn push_failure(&self, error: GrafanaLambdaError) {
        self.failures.lock().push_back(error);
    }

    /// Number of conditional writes attempted so far
    pub fn put_attempts(&self) -> usize {
        *self.put_attempts.lock()
    }

    pub fn get(&self, id: &str) -> Option<LockRecord> {
        self.records.lock().get(id).map(|expire_at| LockRecord {
            id: id.to_string(),
            expire_at: *expire_at,
        })
    }

    fn next_failure(&self) -> Option<GrafanaLambdaError> {
        self.failures.lock().pop_front()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn put_if_vacant(&self, record: &LockRecord, now: i64) -> Result<()> {
        *self.put_attempts.lock() += 1;
        if let Some(err) = self.next_failure() {
            return Err(err);
        }

        let mut records = self.records.lock();
        match records.get(&record.id) {
            Some(expire_at) if now <= *expire_at => Err(GrafanaLambdaError::ConditionFailed(
                format!("lock {} held until {}", record.id, expire_at),
            )),
            _ => {
                records.insert(record.id.clone(), record.expire_at);
                Ok(())
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some(err) = self.next_failure() {
            return Err(err);
        }
        self.records.lock().remove(id);
        Ok(())
    }
}

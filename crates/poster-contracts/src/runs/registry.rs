use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::Serialize;

pub const DEFAULT_REGISTRY_CAPACITY: usize = 256;
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Processing { progress: u8, state: String },
    Success { output_path: String },
    Error { kind: String, message: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Processing { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub key: String,
    pub job_id: Option<String>,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub updated_at: String,
}

/// In-process map from a caller-assigned task key to the last known status.
///
/// Bounded in both directions: entries older than `ttl` are dropped on every
/// write and ignored on read, and once `capacity` is exceeded the entry with
/// the oldest update goes first. Each key is expected to be written by the one
/// worker that owns it; readers receive copies.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Debug)]
struct RegistryInner {
    entries: IndexMap<String, RegistryEntry>,
    capacity: usize,
    ttl: Duration,
}

#[derive(Debug)]
struct RegistryEntry {
    record: TaskRecord,
    touched: Instant,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_CAPACITY, DEFAULT_REGISTRY_TTL)
    }
}

impl TaskRegistry {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                entries: IndexMap::new(),
                capacity: capacity.max(1),
                ttl,
            })),
        }
    }

    pub fn set_status(&self, key: &str, status: TaskStatus) {
        self.write_at(key, None, status, Instant::now());
    }

    pub fn set_job_id(&self, key: &str, job_id: &str) {
        let now = Instant::now();
        let status = self
            .get_at(key, now)
            .map(|record| record.status)
            .unwrap_or(TaskStatus::Processing {
                progress: 0,
                state: "waiting".to_string(),
            });
        self.write_at(key, Some(job_id.to_string()), status, now);
    }

    pub fn get(&self, key: &str) -> Option<TaskRecord> {
        self.get_at(key, Instant::now())
    }

    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.touched) < inner.ttl)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_at(&self, key: &str, job_id: Option<String>, status: TaskStatus, now: Instant) {
        let mut inner = self.lock();
        let previous_job_id = inner
            .entries
            .shift_remove(key)
            .and_then(|entry| entry.record.job_id);
        inner.entries.insert(
            key.to_string(),
            RegistryEntry {
                record: TaskRecord {
                    key: key.to_string(),
                    job_id: job_id.or(previous_job_id),
                    status,
                    updated_at: now_utc_iso(),
                },
                touched: now,
            },
        );
        inner.evict(now);
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<TaskRecord> {
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .filter(|entry| now.duration_since(entry.touched) < inner.ttl)
            .map(|entry| entry.record.clone())
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RegistryInner {
    // Entries are kept in update order, so expired ones sit at the front.
    fn evict(&mut self, now: Instant) {
        while let Some((_, entry)) = self.entries.first() {
            if now.duration_since(entry.touched) < self.ttl {
                break;
            }
            self.entries.shift_remove_index(0);
        }
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

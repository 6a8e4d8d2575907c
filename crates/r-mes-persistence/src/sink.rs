//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::{EventRecord, NewEvent};
use crate::event_log::{EventLogReader, EventLogWriter};
use crate::latency::WriteLatencyTracker;
use crate::metrics::PersistenceMetrics;
use crate::read_model::ReadModel;
use crate::{PersistenceError, Result};

const REPLAY_BATCH: usize = 1024;

/// Acknowledgement of a durable append.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    /// Record as stored, with its assigned offset.
    pub record: EventRecord,
    /// Bytes written.
    pub bytes: usize,
}

/// Storage backend behind the sink.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append `event`; returns only once the write is complete.
    async fn append(&self, event: NewEvent) -> Result<Appended>;

    /// Up to `limit` records with offset greater than `cursor`, in append order.
    async fn read_since(&self, cursor: u64, limit: usize) -> Result<Vec<EventRecord>>;

    /// Offset of the newest record.
    async fn last_offset(&self) -> Result<u64>;
}

/// JSONL file store. Appends run on the blocking pool.
#[derive(Clone)]
pub struct FileEventStore {
    path: PathBuf,
    writer: Arc<Mutex<EventLogWriter>>,
}

impl FileEventStore {
    /// Open (or create) the log at `path`.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = EventLogWriter::open(&path, sync)?;
        info!(path = %path.display(), last_offset = writer.last_offset(), "file event store ready");
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    /// Location of the log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, event: NewEvent) -> Result<Appended> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock();
            writer
                .append(&event)
                .map(|(record, bytes)| Appended { record, bytes })
        })
        .await
        .map_err(|err| PersistenceError::Task(err.to_string()))?
    }

    async fn read_since(&self, cursor: u64, limit: usize) -> Result<Vec<EventRecord>> {
        let writer = Arc::clone(&self.writer);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let Some(position) = writer.lock().position_after(cursor) else {
                return Ok(Vec::new());
            };
            let mut records = Vec::new();
            for record in EventLogReader::open_at(&path, position)? {
                let record = record?;
                if record.offset > cursor {
                    records.push(record);
                }
                if records.len() >= limit {
                    break;
                }
            }
            Ok(records)
        })
        .await
        .map_err(|err| PersistenceError::Task(err.to_string()))?
    }

    async fn last_offset(&self) -> Result<u64> {
        Ok(self.writer.lock().last_offset())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<EventRecord>,
    fail_next: usize,
    fail_all: Option<String>,
    latency: Duration,
}

/// In-memory store with failure and latency injection.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
}

impl MemoryEventStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Fail every append with `reason` until called with `None`.
    pub fn fail_all(&self, reason: Option<String>) {
        self.state.lock().fail_all = reason;
    }

    /// Delay every append by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Copy of everything stored.
    pub fn records(&self) -> Vec<EventRecord> {
        self.state.lock().records.clone()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: NewEvent) -> Result<Appended> {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if let Some(reason) = &state.fail_all {
            return Err(PersistenceError::Injected(reason.clone()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PersistenceError::Injected("append failed".into()));
        }
        let record = event.to_record(state.records.len() as u64 + 1)?;
        let bytes = serde_json::to_string(&record)?.len() + 1;
        state.records.push(record.clone());
        Ok(Appended { record, bytes })
    }

    async fn read_since(&self, cursor: u64, limit: usize) -> Result<Vec<EventRecord>> {
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .skip(cursor as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_offset(&self) -> Result<u64> {
        Ok(self.state.lock().records.len() as u64)
    }
}

/// Durable, ordered, at-least-once write path.
///
/// An event is acknowledged only after the store reports it durable; callers
/// must treat an error as "did not happen". Append latency is tracked for the
/// backpressure manager.
#[derive(Clone)]
pub struct PersistenceSink {
    store: Arc<dyn EventStore>,
    latency: Arc<Mutex<WriteLatencyTracker>>,
    metrics: Option<PersistenceMetrics>,
}

impl PersistenceSink {
    /// Sink over `store`.
    pub fn new(store: Arc<dyn EventStore>, metrics: Option<PersistenceMetrics>) -> Self {
        Self {
            store,
            latency: Arc::new(Mutex::new(WriteLatencyTracker::default())),
            metrics,
        }
    }

    /// Append and wait for durability.
    pub async fn append(&self, event: NewEvent) -> Result<EventRecord> {
        let kind = event.kind();
        let event_id = event.event_id();
        let started = Instant::now();
        let result = self.store.append(event).await;
        let elapsed = started.elapsed();
        self.latency.lock().observe(elapsed);
        match result {
            Ok(appended) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_appended(kind.as_str(), appended.bytes, elapsed.as_secs_f64());
                }
                debug!(event_id = %event_id, kind = %kind, offset = appended.record.offset, "event appended");
                Ok(appended.record)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(kind.as_str(), elapsed.as_secs_f64());
                }
                warn!(event_id = %event_id, kind = %kind, error = %err, "event append failed");
                Err(err)
            }
        }
    }

    /// Records after `cursor`, in append order.
    pub async fn read_since(&self, cursor: u64, limit: usize) -> Result<Vec<EventRecord>> {
        self.store.read_since(cursor, limit).await
    }

    /// Offset of the newest record.
    pub async fn last_offset(&self) -> Result<u64> {
        self.store.last_offset().await
    }

    /// Fold every record after the model's cursor into it.
    pub async fn catch_up(&self, model: &mut ReadModel) -> Result<usize> {
        let started = Instant::now();
        let mut applied = 0usize;
        loop {
            let batch = self.store.read_since(model.cursor(), REPLAY_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                if model.apply(record) {
                    applied += 1;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_replay_duration(started.elapsed().as_secs_f64());
        }
        Ok(applied)
    }

    /// Smoothed append latency.
    pub fn write_latency(&self) -> Duration {
        self.latency.lock().current()
    }
}

impl std::fmt::Debug for PersistenceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceSink")
            .field("write_latency", &self.write_latency())
            .finish_non_exhaustive()
    }
}

//! ---
//! mes_section: "03-persistence-logging"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Durable event sink and read model."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Persistence sink for R-MES: every order transition, measurement, alarm and
//! inventory change is appended here before it is considered to have happened.
#![warn(missing_docs)]

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing the event log.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A log line that cannot be decoded.
    #[error("corrupt event log line {line}: {reason}")]
    Corrupt {
        /// 1-based line number in the file.
        line: usize,
        /// Decoder message.
        reason: String,
    },
    /// Header missing or of an unsupported version.
    #[error("unsupported event log header: {0}")]
    Header(String),
    /// Failure injected by an in-memory store.
    #[error("injected failure: {0}")]
    Injected(String),
    /// Blocking writer task could not complete.
    #[error("writer task failed: {0}")]
    Task(String),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<PersistenceError> for r_mes_common::MesError {
    fn from(err: PersistenceError) -> Self {
        r_mes_common::MesError::Persistence(err.to_string())
    }
}

pub mod event;
pub mod event_log;
pub mod latency;
pub mod metrics;
pub mod read_model;
pub mod sink;

pub use event::{
    AlarmAcknowledged, AlarmCleared, DomainEvent, EventKind, EventRecord, InventoryAdjusted,
    LineSpeedChanged, MeasurementRecorded, NewEvent, OrderCreated, OrderFaulted, OrderResumed,
    OrderTransitioned, QualityRecorded, UnitCompleted, ALARM_SUBJECT,
};
pub use event_log::replay as replay_event_log;
pub use event_log::{EventLogReader, EventLogWriter, EVENT_LOG_VERSION};
pub use latency::WriteLatencyTracker;
pub use metrics::PersistenceMetrics;
pub use read_model::{InventoryLevel, LineView, OrderView, ReadModel};
pub use sink::{Appended, EventStore, FileEventStore, MemoryEventStore, PersistenceSink};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_map_to_engine_taxonomy() {
        let err = PersistenceError::Injected("disk full".into());
        assert_eq!(format!("{err}"), "injected failure: disk full");
        let mapped: r_mes_common::MesError = err.into();
        assert!(matches!(mapped, r_mes_common::MesError::Persistence(_)));
    }
}

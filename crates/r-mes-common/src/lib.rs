//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Shared primitives for the R-MES workspace: the immutable configuration
//! object, tracing bootstrap, the error taxonomy, and the domain types that
//! flow between the field bridge, the production state machines and the
//! persistence sink.

pub mod address;
pub mod alarm;
pub mod config;
pub mod error;
pub mod logging;
pub mod production;
pub mod signal;

pub use address::{AddressSpace, PhysicalAddress, Protocol};
pub use alarm::{Alarm, AlarmCondition, AlarmSeverity};
pub use config::{
    AlarmConfig, AppConfig, BackoffConfig, BridgeConfig, EndpointConfig, LineConfig,
    LoggingConfig, MaterialConfig, MetricsConfig, PersistenceConfig, QualityConfig,
    SchedulingConfig, SignalPriority, TagConfig, ToleranceBand,
};
pub use error::{MesError, MesResult};
pub use logging::{endpoint_span, init_tracing, line_span, LogFormat};
pub use production::{
    FaultReason, InventoryItem, LineId, OperatingMode, OrderId, OrderState, QualityTest, Verdict,
};
pub use signal::{DataKind, Signal, SignalEvent, SignalQuality, SignalValue, UpdateOrigin};

//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Field side of R-MES: the static tag registry, protocol adapters and the
//! subscription bridge that turns raw device updates into typed signal events.
#![warn(missing_docs)]

pub mod adapters;
pub mod backoff;
pub mod bridge;
pub mod metrics;
pub mod tags;

pub use adapters::{
    build_adapter, modbus::ModbusAdapter, opcua::OpcUaAdapter, sim::SimulatedDevice,
    AdapterError, AdapterEvent, DeviceAdapter,
};
pub use backoff::Backoff;
pub use bridge::{BridgeNotice, SignalCallback, SubscriptionBridge, SubscriptionId};
pub use metrics::BridgeMetrics;
pub use tags::{TagBinding, TagRegistry};

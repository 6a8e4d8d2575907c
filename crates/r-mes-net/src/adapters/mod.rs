//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r_mes_common::{EndpointConfig, PhysicalAddress, Protocol};
use serde_json::Value;

/// Raw field update produced by an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterEvent {
    /// Physical location that changed.
    pub address: PhysicalAddress,
    /// Device-native payload; decoded by the bridge against the tag's kind.
    pub value: Value,
    /// Device timestamp of the observation.
    pub observed_at: DateTime<Utc>,
}

/// Failures reported by the field layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    /// No session, or the session dropped.
    #[error("endpoint '{endpoint}' is disconnected")]
    Disconnected {
        /// Endpoint name.
        endpoint: String,
    },
    /// Session could not be established.
    #[error("endpoint '{endpoint}' unreachable: {reason}")]
    Unreachable {
        /// Endpoint name.
        endpoint: String,
        /// Transport-level detail.
        reason: String,
    },
    /// Address does not belong to the adapter's protocol.
    #[error("address {address} is not served by endpoint '{endpoint}'")]
    UnsupportedAddress {
        /// Endpoint name.
        endpoint: String,
        /// Offending address.
        address: String,
    },
    /// Device refused a command write.
    #[error("write to {address} rejected: {reason}")]
    Rejected {
        /// Target address.
        address: String,
        /// Device-reported reason.
        reason: String,
    },
}

/// Unified interface implemented by protocol-specific adapters.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Name of the endpoint this adapter talks to.
    fn endpoint(&self) -> &str;

    /// Establish (or re-establish) a session.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Full read of the supplied addresses.
    async fn read(&self, addresses: &[PhysicalAddress]) -> Result<Vec<AdapterEvent>, AdapterError>;

    /// Changes reported since the previous poll, in device order.
    async fn poll_changes(&self) -> Result<Vec<AdapterEvent>, AdapterError>;

    /// Write a command value and wait for the device acknowledgement.
    async fn write(&self, address: &PhysicalAddress, value: Value) -> Result<(), AdapterError>;
}

/// Build the adapter matching an endpoint's protocol on top of a device image.
pub fn build_adapter(
    name: &str,
    endpoint: &EndpointConfig,
    device: sim::SimulatedDevice,
) -> Arc<dyn DeviceAdapter> {
    match endpoint.protocol {
        Protocol::Modbus => Arc::new(modbus::ModbusAdapter::new(
            modbus::ModbusConfig::new(name, &endpoint.address),
            device,
        )),
        Protocol::OpcUa => Arc::new(opcua::OpcUaAdapter::new(
            opcua::OpcUaConfig::new(name, &endpoint.address),
            device,
        )),
    }
}

pub mod modbus;
pub mod opcua;
pub mod sim;

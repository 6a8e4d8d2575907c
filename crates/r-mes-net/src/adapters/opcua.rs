//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use async_trait::async_trait;
use r_mes_common::{PhysicalAddress, Protocol};
use serde_json::Value;
use tracing::debug;

use super::sim::SimulatedDevice;
use super::{AdapterError, AdapterEvent, DeviceAdapter};

/// OPC UA server description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcUaConfig {
    /// Endpoint name used by tags.
    pub endpoint: String,
    /// `opc.tcp://` URL of the server.
    pub url: String,
}

impl OpcUaConfig {
    /// Configuration for `url`.
    pub fn new(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            url: url.into(),
        }
    }
}

/// OPC UA adapter; node values come from a device image and change
/// notifications are drained per publish cycle.
#[derive(Debug, Clone)]
pub struct OpcUaAdapter {
    config: OpcUaConfig,
    device: SimulatedDevice,
}

impl OpcUaAdapter {
    /// Adapter for `config` backed by `device`.
    pub fn new(config: OpcUaConfig, device: SimulatedDevice) -> Self {
        Self { config, device }
    }

    fn ensure_node(&self, address: &PhysicalAddress) -> Result<(), AdapterError> {
        if address.protocol() == Protocol::OpcUa {
            Ok(())
        } else {
            Err(AdapterError::UnsupportedAddress {
                endpoint: self.config.endpoint.clone(),
                address: address.to_string(),
            })
        }
    }
}

#[async_trait]
impl DeviceAdapter for OpcUaAdapter {
    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        debug!(endpoint = %self.config.endpoint, url = %self.config.url, "activating opc-ua session");
        self.device.open_session(&self.config.endpoint)
    }

    async fn read(&self, addresses: &[PhysicalAddress]) -> Result<Vec<AdapterEvent>, AdapterError> {
        for address in addresses {
            self.ensure_node(address)?;
        }
        self.device.read(&self.config.endpoint, addresses)
    }

    async fn poll_changes(&self) -> Result<Vec<AdapterEvent>, AdapterError> {
        self.device.drain(&self.config.endpoint)
    }

    async fn write(&self, address: &PhysicalAddress, value: Value) -> Result<(), AdapterError> {
        self.ensure_node(address)?;
        if value.is_null() || value.is_object() || value.is_array() {
            return Err(AdapterError::Rejected {
                address: address.to_string(),
                reason: "BadTypeMismatch".into(),
            });
        }
        self.device
            .apply_write(&self.config.endpoint, address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn serves_only_node_ids() {
        let adapter = OpcUaAdapter::new(
            OpcUaConfig::new("opc", "opc.tcp://localhost:4840"),
            SimulatedDevice::new(),
        );
        adapter.connect().await.unwrap();
        let node: PhysicalAddress = "ns=2;s=Conveyor.C1.Speed".parse().unwrap();
        adapter.write(&node, json!(1.5)).await.unwrap();
        assert_eq!(adapter.read(&[node]).await.unwrap()[0].value, json!(1.5));
        assert!(adapter
            .read(&[PhysicalAddress::Coil(1)])
            .await
            .is_err());
    }
}

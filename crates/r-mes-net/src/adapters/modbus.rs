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
use r_mes_common::{AddressSpace, PhysicalAddress, Protocol};
use serde_json::Value;
use tracing::debug;

use super::sim::SimulatedDevice;
use super::{AdapterError, AdapterEvent, DeviceAdapter};

/// Modbus TCP endpoint description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusConfig {
    /// Endpoint name used by tags.
    pub endpoint: String,
    /// `host:port` of the PLC.
    pub address: String,
    /// Modbus unit identifier.
    pub unit_id: u8,
}

impl ModbusConfig {
    /// Configuration for unit 1 at `address`.
    pub fn new(endpoint: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            address: address.into(),
            unit_id: 1,
        }
    }
}

/// Modbus adapter over a device image holding coils, discrete inputs, and
/// input/holding registers.
#[derive(Debug, Clone)]
pub struct ModbusAdapter {
    config: ModbusConfig,
    device: SimulatedDevice,
}

impl ModbusAdapter {
    /// Adapter for `config` backed by `device`.
    pub fn new(config: ModbusConfig, device: SimulatedDevice) -> Self {
        Self { config, device }
    }

    fn ensure_modbus(&self, address: &PhysicalAddress) -> Result<(), AdapterError> {
        if address.protocol() == Protocol::Modbus {
            Ok(())
        } else {
            Err(AdapterError::UnsupportedAddress {
                endpoint: self.config.endpoint.clone(),
                address: address.to_string(),
            })
        }
    }

    fn encode(&self, address: &PhysicalAddress, value: Value) -> Result<Value, AdapterError> {
        let rejected = |reason: &str| AdapterError::Rejected {
            address: address.to_string(),
            reason: reason.to_owned(),
        };
        match address.space() {
            AddressSpace::Coil => match value {
                Value::Bool(_) => Ok(value),
                Value::Number(ref number) if matches!(number.as_u64(), Some(0 | 1)) => {
                    Ok(Value::Bool(number.as_u64() == Some(1)))
                }
                _ => Err(rejected("coil writes require a boolean")),
            },
            AddressSpace::HoldingRegister => {
                if let Some(integer) = value.as_i64() {
                    if !(0..=i64::from(u16::MAX)).contains(&integer) {
                        return Err(rejected("value out of range for 16-bit register"));
                    }
                    Ok(value)
                } else if value.as_f64().is_some() {
                    // floats occupy a register pair
                    Ok(value)
                } else {
                    Err(rejected("register writes require a numeric payload"))
                }
            }
            _ => Err(rejected("address space is read-only")),
        }
    }
}

#[async_trait]
impl DeviceAdapter for ModbusAdapter {
    fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        debug!(
            endpoint = %self.config.endpoint,
            address = %self.config.address,
            unit_id = self.config.unit_id,
            "opening modbus session"
        );
        self.device.open_session(&self.config.endpoint)
    }

    async fn read(&self, addresses: &[PhysicalAddress]) -> Result<Vec<AdapterEvent>, AdapterError> {
        for address in addresses {
            self.ensure_modbus(address)?;
        }
        self.device.read(&self.config.endpoint, addresses)
    }

    async fn poll_changes(&self) -> Result<Vec<AdapterEvent>, AdapterError> {
        self.device.drain(&self.config.endpoint)
    }

    async fn write(&self, address: &PhysicalAddress, value: Value) -> Result<(), AdapterError> {
        self.ensure_modbus(address)?;
        let encoded = self.encode(address, value)?;
        self.device
            .apply_write(&self.config.endpoint, address, encoded)
    }
}

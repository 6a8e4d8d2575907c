//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Field protocol spoken by an endpoint.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    #[serde(rename = "opcua")]
    OpcUa,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::OpcUa => "opcua",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition of the physical address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
    Node,
}

impl AddressSpace {
    /// Whether the field layer accepts command writes into this space.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            AddressSpace::Coil | AddressSpace::HoldingRegister | AddressSpace::Node
        )
    }
}

/// Physical location of a process variable.
///
/// Modbus addresses follow the five digit convention (`0xxxx` coils, `1xxxx`
/// discrete inputs, `3xxxx` input registers, `4xxxx` holding registers) and are
/// written as `coil:1`, `di:10001`, `ir:30001` or `hr:40001`. OPC UA node ids
/// keep their native `ns=2;s=Conveyor.C1.Speed` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhysicalAddress {
    Coil(u16),
    DiscreteInput(u16),
    InputRegister(u16),
    HoldingRegister(u16),
    Node { namespace: u16, identifier: String },
}

impl PhysicalAddress {
    pub fn space(&self) -> AddressSpace {
        match self {
            PhysicalAddress::Coil(_) => AddressSpace::Coil,
            PhysicalAddress::DiscreteInput(_) => AddressSpace::DiscreteInput,
            PhysicalAddress::InputRegister(_) => AddressSpace::InputRegister,
            PhysicalAddress::HoldingRegister(_) => AddressSpace::HoldingRegister,
            PhysicalAddress::Node { .. } => AddressSpace::Node,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            PhysicalAddress::Node { .. } => Protocol::OpcUa,
            _ => Protocol::Modbus,
        }
    }

    /// Zero-based register offset used on the Modbus wire.
    pub fn wire_offset(&self) -> Option<u16> {
        match self {
            PhysicalAddress::Coil(addr) => addr.checked_sub(1),
            PhysicalAddress::DiscreteInput(addr) => addr.checked_sub(10_001),
            PhysicalAddress::InputRegister(addr) => addr.checked_sub(30_001),
            PhysicalAddress::HoldingRegister(addr) => addr.checked_sub(40_001),
            PhysicalAddress::Node { .. } => None,
        }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalAddress::Coil(addr) => write!(f, "coil:{addr}"),
            PhysicalAddress::DiscreteInput(addr) => write!(f, "di:{addr}"),
            PhysicalAddress::InputRegister(addr) => write!(f, "ir:{addr}"),
            PhysicalAddress::HoldingRegister(addr) => write!(f, "hr:{addr}"),
            PhysicalAddress::Node {
                namespace,
                identifier,
            } => write!(f, "ns={namespace};s={identifier}"),
        }
    }
}

impl FromStr for PhysicalAddress {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("ns=") {
            let (namespace, identifier) = rest
                .split_once(";s=")
                .ok_or_else(|| format!("malformed node id: {raw}"))?;
            let namespace = namespace
                .parse::<u16>()
                .map_err(|_| format!("invalid namespace in node id: {raw}"))?;
            if identifier.is_empty() {
                return Err(format!("empty identifier in node id: {raw}"));
            }
            return Ok(PhysicalAddress::Node {
                namespace,
                identifier: identifier.to_owned(),
            });
        }

        let (space, number) = raw
            .split_once(':')
            .ok_or_else(|| format!("address must be <space>:<number>: {raw}"))?;
        let number = number
            .parse::<u32>()
            .map_err(|_| format!("invalid register number: {raw}"))?;
        let (range, build): (std::ops::RangeInclusive<u32>, fn(u16) -> PhysicalAddress) =
            match space {
                "coil" => (1..=9_999, PhysicalAddress::Coil),
                "di" => (10_001..=19_999, PhysicalAddress::DiscreteInput),
                "ir" => (30_001..=39_999, PhysicalAddress::InputRegister),
                "hr" => (40_001..=49_999, PhysicalAddress::HoldingRegister),
                other => return Err(format!("unknown address space '{other}' in {raw}")),
            };
        if !range.contains(&number) {
            return Err(format!(
                "{raw} is outside the {space} range {}..={}",
                range.start(),
                range.end()
            ));
        }
        Ok(build(number as u16))
    }
}

impl Serialize for PhysicalAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhysicalAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modbus_spaces() {
        let hr: PhysicalAddress = "hr:40001".parse().unwrap();
        assert_eq!(hr, PhysicalAddress::HoldingRegister(40_001));
        assert_eq!(hr.wire_offset(), Some(0));
        assert!(hr.space().is_writable());

        let di: PhysicalAddress = "di:10003".parse().unwrap();
        assert_eq!(di.wire_offset(), Some(2));
        assert!(!di.space().is_writable());
        assert_eq!(di.to_string(), "di:10003");
    }

    #[test]
    fn parses_opcua_node_ids() {
        let node: PhysicalAddress = "ns=2;s=Conveyor.C1.Speed".parse().unwrap();
        assert_eq!(node.protocol(), Protocol::OpcUa);
        assert_eq!(node.to_string(), "ns=2;s=Conveyor.C1.Speed");
    }

    #[test]
    fn rejects_out_of_range_registers() {
        assert!("hr:30001".parse::<PhysicalAddress>().is_err());
        assert!("coil:0".parse::<PhysicalAddress>().is_err());
        assert!("xx:1".parse::<PhysicalAddress>().is_err());
        assert!("ns=2;s=".parse::<PhysicalAddress>().is_err());
    }
}

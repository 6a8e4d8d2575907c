//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use r_mes_common::PhysicalAddress;
use serde_json::Value;

use super::{AdapterError, AdapterEvent};

#[derive(Debug)]
struct DeviceState {
    values: HashMap<PhysicalAddress, Value>,
    journal: VecDeque<AdapterEvent>,
    link_up: bool,
    session: bool,
    reject_writes: Option<String>,
    writes: u64,
}

/// In-memory device image shared between an adapter and whoever drives it
/// (a simulator task or a test).
///
/// Changes are journaled while the link is up and drained by
/// [`DeviceAdapter::poll_changes`](super::DeviceAdapter::poll_changes). Dropping
/// the link tears the session down and loses the journal, so anything changed
/// during the gap is only visible through a full read.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Device with the link up and no session yet.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                values: HashMap::new(),
                journal: VecDeque::new(),
                link_up: true,
                session: false,
                reject_writes: None,
                writes: 0,
            })),
        }
    }

    /// Change a value as the PLC would.
    pub fn inject(&self, address: PhysicalAddress, value: Value) {
        let mut state = self.state.lock();
        state.values.insert(address.clone(), value.clone());
        if state.link_up && state.session {
            state.journal.push_back(AdapterEvent {
                address,
                value,
                observed_at: Utc::now(),
            });
        }
    }

    /// Current value held by the device.
    pub fn value(&self, address: &PhysicalAddress) -> Option<Value> {
        self.state.lock().values.get(address).cloned()
    }

    /// Bring the network link up or down.
    pub fn set_link(&self, up: bool) {
        let mut state = self.state.lock();
        state.link_up = up;
        if !up {
            state.session = false;
            state.journal.clear();
        }
    }

    /// Whether the network link is up.
    pub fn is_link_up(&self) -> bool {
        self.state.lock().link_up
    }

    /// Make the device refuse command writes with `reason` (or accept them again).
    pub fn reject_writes(&self, reason: Option<String>) {
        self.state.lock().reject_writes = reason;
    }

    /// Number of accepted writes.
    pub fn accepted_writes(&self) -> u64 {
        self.state.lock().writes
    }

    pub(crate) fn open_session(&self, endpoint: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        if !state.link_up {
            return Err(AdapterError::Unreachable {
                endpoint: endpoint.to_owned(),
                reason: "no route to device".into(),
            });
        }
        state.session = true;
        state.journal.clear();
        Ok(())
    }

    pub(crate) fn read(
        &self,
        endpoint: &str,
        addresses: &[PhysicalAddress],
    ) -> Result<Vec<AdapterEvent>, AdapterError> {
        let state = self.state.lock();
        Self::ensure_session(&state, endpoint)?;
        let observed_at = Utc::now();
        Ok(addresses
            .iter()
            .filter_map(|address| {
                state.values.get(address).map(|value| AdapterEvent {
                    address: address.clone(),
                    value: value.clone(),
                    observed_at,
                })
            })
            .collect())
    }

    pub(crate) fn drain(&self, endpoint: &str) -> Result<Vec<AdapterEvent>, AdapterError> {
        let mut state = self.state.lock();
        Self::ensure_session(&state, endpoint)?;
        Ok(state.journal.drain(..).collect())
    }

    pub(crate) fn apply_write(
        &self,
        endpoint: &str,
        address: &PhysicalAddress,
        value: Value,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        Self::ensure_session(&state, endpoint)?;
        if let Some(reason) = &state.reject_writes {
            return Err(AdapterError::Rejected {
                address: address.to_string(),
                reason: reason.clone(),
            });
        }
        state.writes += 1;
        state.values.insert(address.clone(), value.clone());
        // the field layer echoes accepted writes back as a change
        state.journal.push_back(AdapterEvent {
            address: address.clone(),
            value,
            observed_at: Utc::now(),
        });
        Ok(())
    }

    fn ensure_session(state: &DeviceState, endpoint: &str) -> Result<(), AdapterError> {
        if state.link_up && state.session {
            Ok(())
        } else {
            Err(AdapterError::Disconnected {
                endpoint: endpoint.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changes_during_link_loss_are_not_journaled() {
        let device = SimulatedDevice::new();
        device.open_session("plc").unwrap();
        device.inject(PhysicalAddress::InputRegister(30001), json!(1));
        device.set_link(false);
        device.inject(PhysicalAddress::InputRegister(30001), json!(2));
        assert!(device.drain("plc").is_err());

        device.set_link(true);
        device.open_session("plc").unwrap();
        assert!(device.drain("plc").unwrap().is_empty());
        let full = device
            .read("plc", &[PhysicalAddress::InputRegister(30001)])
            .unwrap();
        assert_eq!(full[0].value, json!(2));
    }
}

//! ---
//! mes_section: "05-networking-external-interfaces"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Field connectivity, tag registry, and device adapters."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use indexmap::IndexMap;
use r_mes_common::{
    DataKind, MesError, MesResult, PhysicalAddress, Signal, SignalPriority, TagConfig,
};

/// Registered binding of one logical signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TagBinding {
    /// Logical signal name.
    pub name: String,
    /// Endpoint the signal is read from.
    pub endpoint: String,
    /// Physical location on the endpoint.
    pub address: PhysicalAddress,
    /// Declared data kind.
    pub kind: DataKind,
    /// Whether command writes are permitted.
    pub writable: bool,
    /// Shedding priority under persistence backpressure.
    pub priority: SignalPriority,
    /// Window after which an unconfirmed value turns `STALE`.
    pub staleness_window: Duration,
}

impl TagBinding {
    /// Fresh signal record for this binding, `STALE` until first read.
    pub fn unread_signal(&self) -> Signal {
        Signal::unread(&self.name, self.address.to_string(), self.kind)
    }
}

/// Static mapping from logical signal names to physical addresses.
///
/// Built once from configuration; lookups never mutate it.
#[derive(Debug, Clone, Default)]
pub struct TagRegistry {
    bindings: IndexMap<String, TagBinding>,
    by_address: HashMap<(String, PhysicalAddress), String>,
}

impl TagRegistry {
    /// Build the registry from the configured tags.
    pub fn from_config(tags: &[TagConfig], default_staleness: Duration) -> MesResult<Self> {
        let mut registry = Self::default();
        for tag in tags {
            registry.register(TagBinding {
                name: tag.name.clone(),
                endpoint: tag.endpoint.clone(),
                address: tag.address.clone(),
                kind: tag.kind,
                writable: tag.writable,
                priority: tag.priority,
                staleness_window: tag.staleness_window.unwrap_or(default_staleness),
            })?;
        }
        Ok(registry)
    }

    /// Add one binding. Names and `(endpoint, address)` pairs must be unique.
    pub fn register(&mut self, binding: TagBinding) -> MesResult<()> {
        if self.bindings.contains_key(&binding.name) {
            return Err(MesError::InvalidRequest(format!(
                "signal '{}' registered twice",
                binding.name
            )));
        }
        if binding.writable && !binding.address.space().is_writable() {
            return Err(MesError::InvalidRequest(format!(
                "signal '{}' cannot be writable at {}",
                binding.name, binding.address
            )));
        }
        let key = (binding.endpoint.clone(), binding.address.clone());
        if let Some(existing) = self.by_address.get(&key) {
            return Err(MesError::InvalidRequest(format!(
                "{} on '{}' already bound to '{}'",
                binding.address, binding.endpoint, existing
            )));
        }
        self.by_address.insert(key, binding.name.clone());
        self.bindings.insert(binding.name.clone(), binding);
        Ok(())
    }

    /// Physical address and data kind of a logical signal.
    pub fn resolve(&self, name: &str) -> MesResult<(PhysicalAddress, DataKind)> {
        self.binding(name)
            .map(|binding| (binding.address.clone(), binding.kind))
    }

    /// Full binding of a logical signal.
    pub fn binding(&self, name: &str) -> MesResult<&TagBinding> {
        self.bindings
            .get(name)
            .ok_or_else(|| MesError::UnknownSignal(name.to_owned()))
    }

    /// Every registered signal name, in registration order.
    pub fn all_signals(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    /// Reverse lookup used when decoding device updates.
    pub fn lookup(&self, endpoint: &str, address: &PhysicalAddress) -> Option<&TagBinding> {
        self.by_address
            .get(&(endpoint.to_owned(), address.clone()))
            .and_then(|name| self.bindings.get(name))
    }

    /// Bindings served by one endpoint.
    pub fn endpoint_bindings<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Iterator<Item = &'a TagBinding> + 'a {
        self.bindings
            .values()
            .filter(move |binding| binding.endpoint == endpoint)
    }

    /// Number of registered signals.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---

/// Result alias used by the engine-facing APIs.
pub type MesResult<T> = std::result::Result<T, MesError>;

/// Error taxonomy shared by the bridge, the state machines and the planning interface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MesError {
    /// Transient field-layer failure; recovered locally with backoff.
    #[error("connection error on endpoint '{endpoint}': {reason}")]
    Connection { endpoint: String, reason: String },
    /// Logical name not present in the tag registry.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),
    /// Conveyor line identifier not configured.
    #[error("invalid line: {0}")]
    InvalidLine(String),
    /// Operation not permitted from the order's current state.
    #[error("invalid transition for order {order_id}: {from} -> {attempted}")]
    InvalidTransition {
        order_id: String,
        from: String,
        attempted: String,
    },
    /// Business-rule block; the order stays where it is.
    #[error("insufficient material '{material}': required {required}, available {available}")]
    InsufficientMaterial {
        material: String,
        required: u64,
        available: u64,
    },
    /// Actuator command refused by the field layer. Never retried automatically.
    #[error("write to '{signal}' rejected: {reason}")]
    WriteRejected { signal: String, reason: String },
    /// Durable append failed; the producing transition did not happen.
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("unknown order: {0}")]
    UnknownOrder(String),
    #[error("unknown material: {0}")]
    UnknownMaterial(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A quality verdict is immutable once set.
    #[error("verdict already recorded for order {order_id} unit {unit}")]
    VerdictAlreadySet { order_id: String, unit: u32 },
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl MesError {
    /// Whether the failure is recovered by the network layer on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, MesError::Connection { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_subject() {
        let err = MesError::InsufficientMaterial {
            material: "steel-casing".into(),
            required: 10,
            available: 4,
        };
        assert_eq!(
            err.to_string(),
            "insufficient material 'steel-casing': required 10, available 4"
        );
        assert!(!err.is_transient());
        assert!(MesError::Connection {
            endpoint: "plc-1".into(),
            reason: "refused".into()
        }
        .is_transient());
    }
}

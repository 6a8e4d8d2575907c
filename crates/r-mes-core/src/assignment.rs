//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Exclusive line-to-order assignment."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use parking_lot::Mutex;
use r_mes_common::{LineId, MesError, MesResult, OrderId};

/// At most one order holds a conveyor line at a time.
///
/// Claims are compare-and-set: a claim only succeeds on an empty slot (or one
/// already held by the same order), and only the holder can release it.
#[derive(Debug, Default)]
pub struct LineAssignments {
    slots: BTreeMap<LineId, Mutex<Option<OrderId>>>,
}

impl LineAssignments {
    pub fn new(lines: impl IntoIterator<Item = LineId>) -> Self {
        Self {
            slots: lines
                .into_iter()
                .map(|line| (line, Mutex::new(None)))
                .collect(),
        }
    }

    /// Claim `line` for `order`. Returns `false` when another order holds it.
    pub fn try_assign(&self, line: &LineId, order: &OrderId) -> MesResult<bool> {
        let mut slot = self.slot(line)?.lock();
        match slot.as_ref() {
            Some(holder) => Ok(holder == order),
            None => {
                *slot = Some(order.clone());
                Ok(true)
            }
        }
    }

    /// Free `line` if `order` holds it.
    pub fn release(&self, line: &LineId, order: &OrderId) -> bool {
        let Ok(slot) = self.slot(line) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.as_ref() == Some(order) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self, line: &LineId) -> Option<OrderId> {
        self.slots.get(line).and_then(|slot| slot.lock().clone())
    }

    fn slot(&self, line: &LineId) -> MesResult<&Mutex<Option<OrderId>>> {
        self.slots
            .get(line)
            .ok_or_else(|| MesError::InvalidLine(line.to_string()))
    }
}

//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Material stock, reservations and consumption."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use r_mes_common::{InventoryItem, MaterialConfig, MesError, MesResult, OrderId};
use r_mes_persistence::{DomainEvent, InventoryAdjusted, InventoryLevel, NewEvent};

/// Why a stock level moved.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AdjustmentReason {
    Reserve,
    Consume,
    Release,
    Restock,
}

impl AdjustmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentReason::Reserve => "reserve",
            AdjustmentReason::Consume => "consume",
            AdjustmentReason::Release => "release",
            AdjustmentReason::Restock => "restock",
        }
    }
}

/// Stock levels of one material right after an adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryChange {
    pub item: InventoryItem,
    /// Signed change of the free quantity.
    pub delta: i64,
    pub reason: AdjustmentReason,
    pub order_id: Option<OrderId>,
    /// Per-material sequence, assigned under the item lock.
    pub sequence: u64,
}

impl InventoryChange {
    pub fn to_event(&self) -> NewEvent {
        NewEvent::new(
            self.sequence,
            DomainEvent::InventoryAdjusted(InventoryAdjusted {
                material: self.item.material.clone(),
                on_hand: self.item.on_hand,
                reserved: self.item.reserved,
                delta: self.delta,
                reason: self.reason.as_str().to_owned(),
                order_id: self.order_id.clone(),
            }),
        )
    }
}

#[derive(Debug)]
struct Slot {
    item: InventoryItem,
    auto_restock: Option<u64>,
    sequence: u64,
}

impl Slot {
    fn record(
        &mut self,
        delta: i64,
        reason: AdjustmentReason,
        order_id: Option<&OrderId>,
    ) -> InventoryChange {
        self.sequence += 1;
        InventoryChange {
            item: self.item.clone(),
            delta,
            reason,
            order_id: order_id.cloned(),
            sequence: self.sequence,
        }
    }
}

/// Shared material stock.
///
/// Each item has its own lock. Operations touching several items take the locks
/// in material-name order, so concurrent reservations from different lines
/// cannot deadlock and never observe a half-applied reservation.
#[derive(Debug, Default)]
pub struct Inventory {
    items: BTreeMap<String, Arc<Mutex<Slot>>>,
}

impl Inventory {
    pub fn from_config(materials: &IndexMap<String, MaterialConfig>) -> Self {
        let items = materials
            .iter()
            .map(|(material, config)| {
                let slot = Slot {
                    item: InventoryItem {
                        material: material.clone(),
                        on_hand: config.on_hand,
                        reserved: 0,
                        reorder_threshold: config.reorder_threshold,
                        per_unit: config.per_unit,
                    },
                    auto_restock: config.auto_restock,
                    sequence: 0,
                };
                (material.clone(), Arc::new(Mutex::new(slot)))
            })
            .collect();
        Self { items }
    }

    pub fn contains(&self, material: &str) -> bool {
        self.items.contains_key(material)
    }

    pub fn item(&self, material: &str) -> MesResult<InventoryItem> {
        self.slot(material).map(|slot| slot.lock().item.clone())
    }

    pub fn snapshot(&self) -> Vec<InventoryItem> {
        self.items
            .values()
            .map(|slot| slot.lock().item.clone())
            .collect()
    }

    pub fn auto_restock(&self, material: &str) -> Option<u64> {
        self.items
            .get(material)
            .and_then(|slot| slot.lock().auto_restock)
    }

    /// Reserve enough of every material for `units` units, or nothing at all.
    pub fn reserve(
        &self,
        order_id: &OrderId,
        materials: &[String],
        units: u32,
    ) -> MesResult<Vec<InventoryChange>> {
        let mut guards = self.lock_all(materials)?;
        for guard in guards.iter() {
            let required = guard.item.per_unit.saturating_mul(u64::from(units));
            if guard.item.on_hand < required {
                return Err(MesError::InsufficientMaterial {
                    material: guard.item.material.clone(),
                    required,
                    available: guard.item.on_hand,
                });
            }
        }
        Ok(guards
            .iter_mut()
            .map(|guard| {
                let quantity = guard.item.per_unit.saturating_mul(u64::from(units));
                guard.item.on_hand -= quantity;
                guard.item.reserved += quantity;
                guard.record(-(quantity as i64), AdjustmentReason::Reserve, Some(order_id))
            })
            .collect())
    }

    /// Draw the reserved material of `units` finished units.
    pub fn consume(
        &self,
        order_id: &OrderId,
        materials: &[String],
        units: u32,
    ) -> MesResult<Vec<InventoryChange>> {
        let mut guards = self.lock_all(materials)?;
        Ok(guards
            .iter_mut()
            .map(|guard| {
                let quantity = guard
                    .item
                    .per_unit
                    .saturating_mul(u64::from(units))
                    .min(guard.item.reserved);
                guard.item.reserved -= quantity;
                guard.record(0, AdjustmentReason::Consume, Some(order_id))
            })
            .collect())
    }

    /// Return the reservation of `units` unbuilt units to free stock.
    pub fn release(
        &self,
        order_id: &OrderId,
        materials: &[String],
        units: u32,
    ) -> MesResult<Vec<InventoryChange>> {
        let mut guards = self.lock_all(materials)?;
        Ok(guards
            .iter_mut()
            .map(|guard| {
                let quantity = guard
                    .item
                    .per_unit
                    .saturating_mul(u64::from(units))
                    .min(guard.item.reserved);
                guard.item.reserved -= quantity;
                guard.item.on_hand = guard.item.on_hand.saturating_add(quantity);
                guard.record(quantity as i64, AdjustmentReason::Release, Some(order_id))
            })
            .collect())
    }

    pub fn restock(&self, material: &str, quantity: u64) -> MesResult<InventoryChange> {
        if quantity == 0 {
            return Err(MesError::InvalidRequest(
                "restock quantity must be positive".into(),
            ));
        }
        let delta = i64::try_from(quantity).map_err(|_| {
            MesError::InvalidRequest(format!("restock quantity {quantity} is out of range"))
        })?;
        let slot = self.slot(material)?;
        let mut guard = slot.lock();
        guard.item.on_hand = guard.item.on_hand.checked_add(quantity).ok_or_else(|| {
            MesError::InvalidRequest(format!(
                "restocking {quantity} of '{material}' overflows the stock level"
            ))
        })?;
        Ok(guard.record(delta, AdjustmentReason::Restock, None))
    }

    /// Reset a material to levels read back from the event log.
    pub fn restore(&self, level: &InventoryLevel) {
        if let Some(slot) = self.items.get(&level.material) {
            let mut guard = slot.lock();
            guard.item.on_hand = level.on_hand;
            guard.item.reserved = level.reserved;
            guard.sequence = guard.sequence.max(level.sequence);
        }
    }

    fn slot(&self, material: &str) -> MesResult<&Arc<Mutex<Slot>>> {
        self.items
            .get(material)
            .ok_or_else(|| MesError::UnknownMaterial(material.to_owned()))
    }

    fn lock_all(&self, materials: &[String]) -> MesResult<Vec<MutexGuard<'_, Slot>>> {
        let mut names: Vec<&str> = materials.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        let slots = names
            .into_iter()
            .map(|name| self.slot(name))
            .collect::<MesResult<Vec<_>>>()?;
        Ok(slots.into_iter().map(|slot| slot.lock()).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn material(on_hand: u64, per_unit: u64) -> MaterialConfig {
        MaterialConfig {
            on_hand,
            reorder_threshold: 10,
            per_unit,
            auto_restock: None,
        }
    }

    fn inventory() -> Inventory {
        let mut materials = IndexMap::new();
        materials.insert("steel-casing".to_string(), material(100, 1));
        materials.insert("bolt".to_string(), material(30, 4));
        Inventory::from_config(&materials)
    }

    fn names(materials: &[&str]) -> Vec<String> {
        materials.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let inventory = inventory();
        let order = OrderId::from("PO_1");
        let err = inventory
            .reserve(&order, &names(&["steel-casing", "bolt"]), 10)
            .unwrap_err();
        assert_eq!(
            err,
            MesError::InsufficientMaterial {
                material: "bolt".into(),
                required: 40,
                available: 30,
            }
        );
        assert_eq!(inventory.item("steel-casing").unwrap().on_hand, 100);
        assert_eq!(inventory.item("steel-casing").unwrap().reserved, 0);

        let changes = inventory
            .reserve(&order, &names(&["steel-casing", "bolt"]), 5)
            .unwrap();
        assert_eq!(changes.len(), 2);
        let bolt = inventory.item("bolt").unwrap();
        assert_eq!((bolt.on_hand, bolt.reserved), (10, 20));
    }

    #[test]
    fn consume_and_release_settle_reservations() {
        let inventory = inventory();
        let order = OrderId::from("PO_1");
        let casing = names(&["steel-casing"]);
        inventory.reserve(&order, &casing, 10).unwrap();
        inventory.consume(&order, &casing, 4).unwrap();
        let released = inventory.release(&order, &casing, 6).unwrap();
        assert_eq!(released[0].delta, 6);
        let item = inventory.item("steel-casing").unwrap();
        assert_eq!((item.on_hand, item.reserved), (96, 0));
        assert_eq!(released[0].sequence, 3);
    }

    #[test]
    fn unknown_materials_are_rejected() {
        let inventory = inventory();
        assert!(matches!(
            inventory.reserve(&OrderId::from("PO_1"), &names(&["copper"]), 1),
            Err(MesError::UnknownMaterial(_))
        ));
        assert!(inventory.restock("bolt", 0).is_err());
    }

    #[test]
    fn restock_refuses_quantities_that_overflow() {
        let inventory = inventory();
        assert!(matches!(
            inventory.restock("steel-casing", u64::MAX),
            Err(MesError::InvalidRequest(_))
        ));
        assert_eq!(inventory.item("steel-casing").unwrap().on_hand, 100);

        let huge = i64::MAX as u64;
        let change = inventory.restock("steel-casing", huge).unwrap();
        assert_eq!(change.item.on_hand, huge + 100);
        assert_eq!(change.delta, i64::MAX);
        assert!(matches!(
            inventory.restock("steel-casing", huge),
            Err(MesError::InvalidRequest(_))
        ));
        assert_eq!(inventory.item("steel-casing").unwrap().on_hand, huge + 100);
    }

    #[test]
    fn concurrent_reservations_never_overdraw() {
        let inventory = Arc::new(inventory());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let inventory = inventory.clone();
                thread::spawn(move || {
                    let order = OrderId::new(format!("PO_{worker}"));
                    // opposite listing order on alternate threads
                    let materials = if worker % 2 == 0 {
                        names(&["steel-casing", "bolt"])
                    } else {
                        names(&["bolt", "steel-casing"])
                    };
                    inventory.reserve(&order, &materials, 2).is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        // 30 bolts at 8 per reservation
        assert_eq!(granted, 3);
        let bolt = inventory.item("bolt").unwrap();
        assert_eq!(bolt.on_hand + bolt.reserved, 30);
        let casing = inventory.item("steel-casing").unwrap();
        assert_eq!(casing.reserved, 6);
    }
}

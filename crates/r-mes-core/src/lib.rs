//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Production engine: order state machines, quality, inventory and alarms."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
//! Production side of R-MES. [`MesEngine`] runs one [`LineWorker`] per
//! conveyor line, each the sole owner of its orders, fed by the subscription
//! bridge and the planning interface.

pub mod alarms;
pub mod assignment;
pub mod engine;
pub mod inventory;
pub mod journal;
pub mod line;
pub mod order;
pub mod quality;

pub use alarms::{AlarmManager, AlarmMonitor};
pub use assignment::LineAssignments;
pub use engine::{MesEngine, OrderRequest, ProductionStatus, DEFAULT_PRIORITY};
pub use inventory::{AdjustmentReason, Inventory, InventoryChange};
pub use journal::EventJournal;
pub use line::{LineContext, LineHandle, LineStatus, LineWorker};
pub use order::{OrderSnapshot, ProductionOrder, Step};
pub use quality::QualityEvaluator;

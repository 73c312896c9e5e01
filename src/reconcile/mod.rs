//! Reconciliation: attach converted voice notes to their placeholders and
//! deliver them.
//!
//! ```text
//! Scheduler ──tick──► RunGuard ──► Reconciler::run_pass
//!                                    ├─ recover `awaiting` messages
//!                                    └─ pending placeholders
//!                                         ├─ artifact missing → attempt / give up
//!                                         └─ artifact present → resolve (CAS)
//!                                                                 └─ claim (CAS) → DeliveryAdapter
//! ```

pub mod pass;
pub mod scheduler;

pub use pass::{PassReport, ReconcileError, ReconcileSettings, Reconciler, Resolution, ScanMode};
pub use scheduler::{RunGuard, RunPermit, Scheduler, SchedulerHandle, TickOutcome};

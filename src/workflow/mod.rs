//! Ticket workflow
//!
//! The ticket state machine, the async execution coordinator and the
//! reconciliation that folds execution results back into tickets.

pub mod coordinator;
pub mod reconcile;
pub mod service;

pub use coordinator::{ExecutionCoordinator, ExecutionHandle};
pub use reconcile::{aggregate, ExecutionOutcome, Reconciler};
pub use service::{CheckReport, TicketService, TriggerOutcome};

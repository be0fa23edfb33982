//! External collaborators
//!
//! Narrow interfaces the ticket workflow talks to (approval and audit log,
//! notification delivery, deferred triggers) with in-process implementations.

pub mod audit;
pub mod notify;
pub mod scheduler;

pub use audit::{AuditAction, AuditEntry, AuditOutcome, AuditTrail, InMemoryAudit};
pub use notify::{LogNotifier, Notifier};
pub use scheduler::{Scheduler, TokioScheduler};

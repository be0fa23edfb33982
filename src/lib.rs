//! SQLFlow - SQL change-ticket engine
//!
//! Engineers submit SQL, the engine reviews it through a pluggable inspection
//! backend, routes it through approval and executes it against one or more
//! target databases, reconciling every execution back into the ticket.
//!
//! - `engine`: per-database check, query and execution over PostgreSQL
//! - `inspection`: interchangeable static-rule and dry-run backends
//! - `workflow`: the ticket state machine and execution coordinator
//! - `collaborators`: audit trail, notifications and timed triggers

pub mod collaborators;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod inspection;
pub mod review;
pub mod sql;
pub mod telemetry;
pub mod ticket;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use config::Settings;
pub use error::{ApiResult, AppError, InspectionError};
pub use review::{DatabaseResults, ErrorLevel, ResultSet, ReviewResult, ReviewSet, SyntaxType};
pub use ticket::{Actor, ChangeContent, ChangeTicket, ExecutionMode, SubmitRequest, TicketStatus};
pub use workflow::{TicketService, TriggerOutcome};

//! Ticket data models
//!
//! Defines the change ticket, its attached content and the actors that act on it.

use crate::review::SyntaxType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// Ticket status in the change workflow.
///
/// `submitted` is transient: a ticket is created directly in the state its
/// submission check decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Automatic check rejected the SQL
    AutoReviewFailed,
    /// Waiting for a reviewer
    ManualReviewing,
    /// Approved and ready for execution
    ReviewPassed,
    /// Execution deferred to a run time
    Scheduled,
    /// Execution in progress
    Executing,
    /// Every database executed cleanly
    Finished,
    /// At least one database failed
    Exception,
    /// Rejected or cancelled
    Aborted,
}

impl TicketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TicketStatus::Finished | TicketStatus::Exception | TicketStatus::Aborted
        )
    }

    pub fn can_review(self) -> bool {
        self == TicketStatus::ManualReviewing
    }

    pub fn can_execute(self) -> bool {
        self == TicketStatus::ReviewPassed
    }

    pub fn can_cancel(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::AutoReviewFailed => "auto_review_failed",
            TicketStatus::ManualReviewing => "manual_reviewing",
            TicketStatus::ReviewPassed => "review_passed",
            TicketStatus::Scheduled => "scheduled",
            TicketStatus::Executing => "executing",
            TicketStatus::Finished => "finished",
            TicketStatus::Exception => "exception",
            TicketStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an approved ticket is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run natively through the database driver, waited on by the caller
    Manual,
    /// Handed to the inspection backend and reconciled in the background
    #[default]
    Automatic,
    /// Applied out-of-band; the executor only confirms it
    External,
}

/// One submitted change request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeTicket {
    pub id: u64,
    pub title: String,
    pub submitter: String,
    /// Name of the target instance
    pub instance: String,
    /// Target databases, in submission order
    pub db_names: Vec<String>,
    pub sql: String,
    pub syntax_type: SyntaxType,
    pub status: TicketStatus,
    pub is_backup: bool,
    pub run_date_start: Option<DateTime<Utc>>,
    pub run_date_end: Option<DateTime<Utc>>,
    pub execution_mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Execution attempt currently or last in flight
    pub current_attempt: Option<Uuid>,
    /// Execution attempt whose outcome has been written back
    pub reconciled_attempt: Option<Uuid>,
}

impl ChangeTicket {
    /// Database used for instance-wide decisions such as read-only status
    pub fn first_db(&self) -> Option<&str> {
        self.db_names.first().map(String::as_str)
    }

    /// Whether `at` falls inside the executable window; an open bound allows anything
    pub fn in_run_window(&self, at: DateTime<Utc>) -> bool {
        self.run_date_start.map_or(true, |start| at >= start)
            && self.run_date_end.map_or(true, |end| at <= end)
    }

    /// Name of the deferred trigger for this ticket
    pub fn task_name(&self) -> String {
        schedule_task_name(self.id)
    }
}

pub fn schedule_task_name(ticket_id: u64) -> String {
    format!("sqlreview-{}", ticket_id)
}

/// Payload owned 1:1 by a ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeContent {
    pub ticket_id: u64,
    pub sql: String,
    /// Per-database check verdicts
    pub review_payload: serde_json::Value,
    /// Per-database execution outcome, filled in by reconciliation
    pub execute_payload: Option<serde_json::Value>,
}

/// Identity and capabilities of whoever acts on a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,
    pub display: String,
    pub can_review: bool,
    pub can_execute: bool,
}

impl Actor {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            display: username.clone(),
            username,
            can_review: false,
            can_execute: false,
        }
    }

    pub fn reviewer(mut self) -> Self {
        self.can_review = true;
        self
    }

    pub fn executor(mut self) -> Self {
        self.can_execute = true;
        self
    }

    /// Actor used for timed execution
    pub fn system() -> Self {
        Actor::new("system").executor()
    }
}

/// Request to submit a new ticket
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be 1-200 characters"))]
    pub title: String,

    #[validate(length(min = 1, message = "Instance is required"))]
    pub instance: String,

    #[validate(length(min = 1, message = "At least one database is required"))]
    pub db_names: Vec<String>,

    #[validate(length(min = 1, message = "SQL is required"))]
    pub sql: String,

    #[serde(default)]
    pub is_backup: bool,

    pub run_date_start: Option<DateTime<Utc>>,
    pub run_date_end: Option<DateTime<Utc>>,

    /// Extra recipients of the review request
    #[serde(default)]
    pub cc_list: Vec<String>,
}

/// Filter for listing tickets
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub submitter: Option<String>,
    pub instance: Option<String>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &ChangeTicket) -> bool {
        self.status.map_or(true, |s| ticket.status == s)
            && self.submitter.as_deref().map_or(true, |s| ticket.submitter == s)
            && self.instance.as_deref().map_or(true, |i| ticket.instance == i)
    }
}

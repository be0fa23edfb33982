//! Notifications

use crate::collaborators::AuditOutcome;
use crate::ticket::TicketStatus;
use async_trait::async_trait;
use tracing::info;

/// Receives lifecycle events worth telling people about
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_review_requested(&self, ticket_id: u64, cc_list: &[String]);

    async fn notify_review_decided(&self, ticket_id: u64, outcome: AuditOutcome);

    async fn notify_execution_finished(&self, ticket_id: u64, status: TicketStatus);
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_review_requested(&self, ticket_id: u64, cc_list: &[String]) {
        info!(ticket_id, cc = ?cc_list, "📨 Review requested");
    }

    async fn notify_review_decided(&self, ticket_id: u64, outcome: AuditOutcome) {
        info!(ticket_id, ?outcome, "📨 Review decided");
    }

    async fn notify_execution_finished(&self, ticket_id: u64, status: TicketStatus) {
        info!(ticket_id, %status, "📨 Execution finished");
    }
}

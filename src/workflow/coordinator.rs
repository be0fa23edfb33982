//! Async execution coordinator
//!
//! Runs an execution attempt as a background task, waits for it to end one
//! way or another, reconciles it exactly once and hands the final status to
//! whoever holds the `ExecutionHandle`.

use crate::error::AppError;
use crate::review::DatabaseResults;
use crate::ticket::TicketStatus;
use crate::workflow::reconcile::{ExecutionOutcome, Reconciler};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Resolves with the ticket's status once its attempt has been reconciled
#[derive(Debug)]
pub struct ExecutionHandle {
    pub ticket_id: u64,
    pub attempt: Uuid,
    rx: oneshot::Receiver<Result<TicketStatus, AppError>>,
}

impl ExecutionHandle {
    pub async fn wait(self) -> Result<TicketStatus, AppError> {
        self.rx
            .await
            .map_err(|_| AppError::Internal(format!("Execution of ticket {} was abandoned", self.ticket_id)))?
    }
}

#[derive(Clone)]
pub struct ExecutionCoordinator {
    reconciler: Arc<Reconciler>,
}

impl ExecutionCoordinator {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Spawn `work` for `attempt` of a ticket.
    ///
    /// A returned error or a panic inside `work` is reconciled as a crashed
    /// attempt so the ticket still reaches a terminal state.
    pub fn dispatch<F>(&self, ticket_id: u64, attempt: Uuid, work: F) -> ExecutionHandle
    where
        F: Future<Output = Result<DatabaseResults, AppError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reconciler = self.reconciler.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(work).await {
                Ok(Ok(results)) => ExecutionOutcome::Completed(results),
                Ok(Err(e)) => ExecutionOutcome::Crashed(e.to_string()),
                Err(join) if join.is_panic() => ExecutionOutcome::Crashed(panic_message(join.into_panic())),
                Err(join) => ExecutionOutcome::Crashed(join.to_string()),
            };
            if let ExecutionOutcome::Crashed(reason) = &outcome {
                error!(ticket_id, %attempt, "💥 Execution task failed: {}", reason);
            }

            let status = reconciler.reconcile(ticket_id, attempt, outcome).await;
            debug!(ticket_id, %attempt, "Attempt reconciled: {:?}", status);
            // the caller may have dropped its handle
            let _ = tx.send(status);
        });

        ExecutionHandle { ticket_id, attempt, rx }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("execution task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("execution task panicked: {}", message)
    } else {
        "execution task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        assert_eq!(
            panic_message(Box::new("boom")),
            "execution task panicked: boom"
        );
        assert_eq!(
            panic_message(Box::new("bad".to_string())),
            "execution task panicked: bad"
        );
        assert_eq!(panic_message(Box::new(7u8)), "execution task panicked");
    }
}

//! Deferred execution triggers

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fires a ticket id at a point in time
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register (or replace) the trigger called `task_name`
    async fn schedule_at(&self, task_name: &str, at: DateTime<Utc>, ticket_id: u64) -> Result<(), AppError>;

    /// Drop a trigger before it fires; false when nothing was pending
    async fn cancel(&self, task_name: &str) -> bool;
}

/// Scheduler backed by tokio timers; due ticket ids arrive on a channel
pub struct TokioScheduler {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    fired: mpsc::UnboundedSender<u64>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            fired,
        };
        (scheduler, rx)
    }

    /// Names of triggers that have not fired yet
    pub async fn pending(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule_at(&self, task_name: &str, at: DateTime<Utc>, ticket_id: u64) -> Result<(), AppError> {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let name = task_name.to_string();
        let tasks = self.tasks.clone();
        let fired = self.fired.clone();

        // held until the handle is registered, so a zero-delay task cannot
        // remove itself before it is inserted
        let mut guard = self.tasks.lock().await;
        let task = {
            let name = name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tasks.lock().await.remove(&name);
                if fired.send(ticket_id).is_err() {
                    warn!("Scheduler receiver dropped, trigger {} lost", name);
                }
            })
        };
        if let Some(previous) = guard.insert(name.clone(), task) {
            previous.abort();
        }
        debug!("⏰ Scheduled {} for ticket {} in {:?}", name, ticket_id, delay);
        Ok(())
    }

    async fn cancel(&self, task_name: &str) -> bool {
        match self.tasks.lock().await.remove(task_name) {
            Some(task) => {
                task.abort();
                debug!("Cancelled trigger {}", task_name);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test(start_paused = true)]
    async fn test_trigger_fires_ticket_id() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler
            .schedule_at("sqlreview-7", Utc::now() + ChronoDuration::seconds(30), 7)
            .await
            .unwrap();
        assert_eq!(scheduler.pending().await, vec!["sqlreview-7".to_string()]);

        assert_eq!(rx.recv().await, Some(7));
        assert!(scheduler.pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trigger_never_fires() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler
            .schedule_at("sqlreview-8", Utc::now() + ChronoDuration::seconds(30), 8)
            .await
            .unwrap();
        assert!(scheduler.cancel("sqlreview-8").await);
        assert!(!scheduler.cancel("sqlreview-8").await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_time_fires_immediately() {
        let (scheduler, mut rx) = TokioScheduler::new();
        scheduler
            .schedule_at("sqlreview-9", Utc::now() - ChronoDuration::seconds(5), 9)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_trigger() {
        let (scheduler, mut rx) = TokioScheduler::new();
        let at = Utc::now() + ChronoDuration::seconds(10);
        scheduler.schedule_at("sqlreview-1", at, 1).await.unwrap();
        scheduler.schedule_at("sqlreview-1", at, 1).await.unwrap();

        assert_eq!(rx.recv().await, Some(1));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }
}

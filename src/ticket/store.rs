//! Ticket storage
//!
//! In-memory store. Every mutation of a ticket goes through
//! [`TicketStore::transition`], which holds that ticket's lock for the whole
//! read-modify-write, so approval, cancellation and execution reconciliation
//! on the same ticket never interleave.

use crate::error::AppError;
use crate::ticket::{ChangeContent, ChangeTicket, TicketFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
struct TicketRecord {
    ticket: ChangeTicket,
    content: ChangeContent,
}

/// Thread-safe ticket store
pub struct TicketStore {
    next_id: AtomicU64,
    tickets: RwLock<HashMap<u64, Arc<Mutex<TicketRecord>>>>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tickets: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a new ticket with its content, assigning the id
    pub async fn create(&self, mut ticket: ChangeTicket, mut content: ChangeContent) -> ChangeTicket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ticket.id = id;
        content.ticket_id = id;

        let record = TicketRecord {
            ticket: ticket.clone(),
            content,
        };
        self.tickets
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(record)));
        ticket
    }

    async fn record(&self, id: u64) -> Result<Arc<Mutex<TicketRecord>>, AppError> {
        self.tickets
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Ticket {} not found", id)))
    }

    /// Get a ticket by ID
    pub async fn get(&self, id: u64) -> Result<ChangeTicket, AppError> {
        let record = self.record(id).await?;
        let guard = record.lock().await;
        Ok(guard.ticket.clone())
    }

    /// Get the content attached to a ticket
    pub async fn content(&self, id: u64) -> Result<ChangeContent, AppError> {
        let record = self.record(id).await?;
        let guard = record.lock().await;
        Ok(guard.content.clone())
    }

    /// List tickets matching `filter`, oldest first
    pub async fn list(&self, filter: &TicketFilter) -> Vec<ChangeTicket> {
        let records: Vec<_> = self.tickets.read().await.values().cloned().collect();
        let mut tickets = Vec::with_capacity(records.len());
        for record in records {
            let guard = record.lock().await;
            if filter.matches(&guard.ticket) {
                tickets.push(guard.ticket.clone());
            }
        }
        tickets.sort_by_key(|t| t.id);
        tickets
    }

    /// Apply `change` to a ticket and its content as one unit.
    ///
    /// The closure works on copies; they are written back only when it
    /// returns `Ok`, so a rejected transition leaves the ticket untouched.
    pub async fn transition<T, F>(&self, id: u64, change: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut ChangeTicket, &mut ChangeContent) -> Result<T, AppError>,
    {
        let record = self.record(id).await?;
        let mut guard = record.lock().await;

        let mut ticket = guard.ticket.clone();
        let mut content = guard.content.clone();
        let value = change(&mut ticket, &mut content)?;

        guard.ticket = ticket;
        guard.content = content;
        Ok(value)
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

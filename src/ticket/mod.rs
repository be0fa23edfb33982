//! Change tickets
//!
//! The ticket data model and its store.

pub mod models;
pub mod store;

pub use models::*;
pub use store::TicketStore;

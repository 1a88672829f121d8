//! Infrastructure layer: storage, workflows and the ledger service.
//!
//! - [`store`]: unit-of-work ports plus in-memory and Postgres stores
//! - [`workflows`]: one workflow per ledger operation
//! - [`service`]: `LedgerService`, the surface the transport layer calls
//! - [`chat`]: live per-stand chat rooms
//! - [`config`]: `LedgerConfig` loading

pub mod chat;
pub mod config;
pub mod service;
pub mod store;
pub mod workflows;

pub use chat::ChatRooms;
pub use config::LedgerConfig;
pub use service::{LedgerService, PaymentConfirmation};
pub use store::{InMemoryLedgerStore, LedgerStore, Pagination, PostgresLedgerStore, UnitOfWork};

#[cfg(test)]
mod integration_tests;

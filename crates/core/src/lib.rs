//! `kermesse-core`: shared building blocks of the token ledger.
//!
//! Identifiers, the error taxonomy and optimistic-concurrency versions.
//! No infrastructure concerns live here.

pub mod error;
pub mod id;
pub mod version;

pub use error::{Denial, LedgerError, LedgerResult, Resource};
pub use id::{KermesseId, MessageId, StandId, StockId, TransactionId, UserId};
pub use version::ExpectedVersion;

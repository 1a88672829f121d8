//! Ledger workflows.
//!
//! A workflow is the decision logic of one ledger operation. It runs entirely
//! inside the [`UnitOfWork`] it is handed: every read, guard and write goes
//! through the unit, and the workflow never commits. `LedgerService` owns the
//! unit's lifecycle (begin, commit or rollback, conflict retry, timeout) and
//! publishes the workflow's notifications once the commit succeeded.
//!
//! Workflows are plain values holding their inputs, so the service can run
//! the same workflow again after a `Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kermesse_core::LedgerResult;
use kermesse_ledger::LedgerEvent;

use crate::store::UnitOfWork;

pub mod chat;
pub mod points;
pub mod purchase;
pub mod top_up;
pub mod transfer;
pub mod validation;

pub use chat::PostMessageWorkflow;
pub use points::PointAttributionWorkflow;
pub use purchase::{PurchaseOutcome, PurchaseWorkflow};
pub use top_up::TopUpWorkflow;
pub use transfer::TransferWorkflow;
pub use validation::{Decision, ValidationWorkflow};

#[async_trait]
pub trait Workflow: Send + Sync {
    type Output: Send;

    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Guards, checks and writes. Must not commit.
    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<Self::Output>;

    /// Notifications describing a committed run.
    fn events(&self, output: &Self::Output, committed_at: DateTime<Utc>) -> Vec<LedgerEvent>;
}

//! Storage ports of the ledger.
//!
//! Every workflow runs inside one [`UnitOfWork`]: reads, checks and writes go
//! through the unit, and nothing becomes visible to other units until
//! [`UnitOfWork::commit`] succeeds. A unit that is rolled back, or simply
//! dropped (e.g. because the caller's future was cancelled), leaves no trace.
//!
//! The component traits mirror the ledger's collaborators:
//!
//! - [`AccountStore`]: token balances and activity points
//! - [`InventoryStore`]: stands, stock items and per-stand aggregates
//! - [`KermesseStore`]: kermesse rows and their `tokens_sold` aggregate
//! - [`TransactionLedger`]: `TokenTransaction` rows and their status machine
//! - [`ParticipationGuard`]: roster queries (no side effects)
//! - [`ChatStore`]: stand chat persistence (outside the consistency model)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, LedgerResult, StandId, StockId, TransactionId, UserId};
use kermesse_ledger::{
    Account, ChatMessage, Kermesse, NewChatMessage, NewTransaction, Party, Stand, StockItem,
    TokenTransaction, TransactionStatus,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

#[async_trait]
pub trait AccountStore: Send {
    /// Fails `NotFound` for unknown users.
    async fn account(&mut self, user_id: UserId) -> LedgerResult<Account>;

    /// Resolve the role first; fails `InvalidUserRole` for roles without a balance.
    async fn balance(&mut self, user_id: UserId) -> LedgerResult<i64> {
        self.account(user_id).await?.tokens()
    }

    /// Apply a signed delta and return the new balance.
    ///
    /// Fails `InsufficientTokens` (and changes nothing) if the balance would
    /// go negative.
    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> LedgerResult<i64>;

    /// Add points to a student and return the new total.
    async fn add_points(&mut self, student_id: UserId, points: i64) -> LedgerResult<i64>;

    /// Students linked to `parent_id`.
    async fn children(&mut self, parent_id: UserId) -> LedgerResult<Vec<Account>>;
}

#[async_trait]
pub trait InventoryStore: Send {
    async fn stand(&mut self, stand_id: StandId) -> LedgerResult<Stand>;

    /// Fails `NotFound` if the item does not exist or is sold by another stand.
    async fn stock_item(&mut self, stand_id: StandId, stock_id: StockId) -> LedgerResult<StockItem>;

    async fn stock_items(&mut self, stand_id: StandId) -> LedgerResult<Vec<StockItem>>;

    /// Apply a signed quantity change and return the new quantity.
    ///
    /// No-op for activity stands; fails `InsufficientStock` if the quantity
    /// would go negative.
    async fn adjust_stock(&mut self, stand_id: StandId, stock_id: StockId, delta: i64) -> LedgerResult<i64>;

    async fn record_stand_revenue(&mut self, stand_id: StandId, amount: i64) -> LedgerResult<i64>;

    async fn record_points_given(&mut self, stand_id: StandId, points: i64) -> LedgerResult<i64>;
}

#[async_trait]
pub trait KermesseStore: Send {
    async fn kermesse(&mut self, kermesse_id: KermesseId) -> LedgerResult<Kermesse>;

    async fn add_tokens_sold(&mut self, kermesse_id: KermesseId, amount: i64) -> LedgerResult<i64>;
}

#[async_trait]
pub trait TransactionLedger: Send {
    /// Assign id and timestamps and persist with the requested initial status.
    async fn record(&mut self, transaction: NewTransaction, now: DateTime<Utc>) -> LedgerResult<TokenTransaction>;

    /// Fails `NotFound` for unknown ids.
    async fn transaction(&mut self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction>;

    /// Fails `InvalidTransactionStatus` if the edge is not legal for the kind.
    async fn set_status(
        &mut self,
        transaction_id: TransactionId,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<TokenTransaction>;

    /// Transactions where any of `parties` is sender or recipient, oldest first.
    async fn list_involving(
        &mut self,
        parties: &[Party],
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<Vec<TokenTransaction>>;
}

/// Roster queries.
///
/// All three fail `NotFound` when the kermesse (or stand) does not exist and
/// otherwise answer a plain boolean: an unknown user is simply not a member.
#[async_trait]
pub trait ParticipationGuard: Send {
    /// Organizers are checked against the organizer roster, everyone else
    /// against the participant roster.
    async fn is_participant(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool>;

    async fn is_organizer(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool>;

    async fn is_stand_holder(&mut self, user_id: UserId, stand_id: StandId) -> LedgerResult<bool>;
}

#[async_trait]
pub trait ChatStore: Send {
    async fn save_message(&mut self, message: NewChatMessage, now: DateTime<Utc>) -> LedgerResult<ChatMessage>;

    /// Messages of one stand's room, oldest first.
    async fn list_messages(
        &mut self,
        kermesse_id: KermesseId,
        stand_id: StandId,
        page: Pagination,
    ) -> LedgerResult<Vec<ChatMessage>>;
}

/// One atomic, serializable set of reads and writes.
///
/// After `commit` or `rollback` the unit is spent; further calls fail with a
/// storage error.
#[async_trait]
pub trait UnitOfWork:
    AccountStore + InventoryStore + KermesseStore + TransactionLedger + ParticipationGuard + ChatStore + Send
{
    /// Publish every buffered effect atomically, or fail `Conflict` if a row
    /// read by this unit changed since.
    async fn commit(&mut self) -> LedgerResult<()>;

    async fn rollback(&mut self) -> LedgerResult<()>;
}

/// Factory of units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        (**self).begin().await
    }
}

/// Offset pagination for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(500),
            offset: offset.unwrap_or(0),
        }
    }
}

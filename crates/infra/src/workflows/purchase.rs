//! Vendor purchase: a buyer spends tokens at a stand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use kermesse_core::{Denial, KermesseId, LedgerError, LedgerResult, StandId, StockId, UserId};
use kermesse_ledger::{
    LedgerEvent, NewTransaction, Party, PurchaseCompleted, TokenTransaction, TransactionKind,
    TransactionStatus,
};

use crate::store::UnitOfWork;

use super::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseWorkflow {
    pub buyer_id: UserId,
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub stock_id: StockId,
    pub quantity: i64,
}

/// The recorded `Spend` and the buyer's balance after paying for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    pub transaction: TokenTransaction,
    pub remaining_tokens: i64,
}

#[async_trait]
impl Workflow for PurchaseWorkflow {
    type Output = PurchaseOutcome;

    fn name(&self) -> &'static str {
        "purchase"
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<PurchaseOutcome> {
        if self.quantity <= 0 {
            return Err(LedgerError::invalid_transaction("quantity must be positive"));
        }

        if !uow.is_participant(self.kermesse_id, self.buyer_id).await? {
            debug!(buyer_id = %self.buyer_id, kermesse_id = %self.kermesse_id, "buyer is not a participant");
            return Err(LedgerError::PermissionDenied(Denial::NotParticipant));
        }

        let stand = uow.stand(self.stand_id).await?;
        stand.ensure_in(self.kermesse_id)?;

        let item = uow.stock_item(self.stand_id, self.stock_id).await?;
        item.ensure_available(stand.kind, self.quantity)?;
        let total_cost = item.cost_of(self.quantity)?;

        let buyer = uow.account(self.buyer_id).await?;
        let from = buyer.as_party()?;
        let balance = buyer.tokens()?;
        if balance < total_cost {
            return Err(LedgerError::InsufficientTokens {
                available: balance,
                required: total_cost,
            });
        }

        let transaction = uow
            .record(
                NewTransaction {
                    kermesse_id: Some(self.kermesse_id),
                    from,
                    to: Party::Stand(self.stand_id),
                    amount: total_cost,
                    kind: TransactionKind::Spend,
                    stand_id: Some(self.stand_id),
                    status: TransactionStatus::Completed,
                },
                now,
            )
            .await?;
        let remaining_tokens = uow.adjust_balance(self.buyer_id, -total_cost).await?;
        uow.record_stand_revenue(self.stand_id, total_cost).await?;
        uow.adjust_stock(self.stand_id, self.stock_id, -self.quantity).await?;

        Ok(PurchaseOutcome {
            transaction,
            remaining_tokens,
        })
    }

    fn events(&self, output: &PurchaseOutcome, committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        vec![LedgerEvent::PurchaseCompleted(PurchaseCompleted {
            transaction_id: output.transaction.id,
            kermesse_id: self.kermesse_id,
            stand_id: self.stand_id,
            stock_id: self.stock_id,
            buyer_id: self.buyer_id,
            quantity: self.quantity,
            total_cost: output.transaction.amount,
            occurred_at: committed_at,
        })]
    }
}

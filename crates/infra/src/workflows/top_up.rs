//! Token purchase by a parent (top-up).
//!
//! The external payment has already been confirmed when this runs. Whether the
//! tokens reach the parent now or after an organizer's validation is decided
//! by the deployment's [`TopUpPolicy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use kermesse_core::{Denial, KermesseId, LedgerError, LedgerResult, UserId};
use kermesse_ledger::{
    LedgerEvent, NewTransaction, Party, Role, TokenTransaction, TokensPurchased, TopUpPolicy,
    TransactionKind,
};

use crate::store::UnitOfWork;

use super::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopUpWorkflow {
    pub parent_id: UserId,
    pub kermesse_id: KermesseId,
    pub amount: i64,
    pub policy: TopUpPolicy,
}

#[async_trait]
impl Workflow for TopUpWorkflow {
    type Output = TokenTransaction;

    fn name(&self) -> &'static str {
        "top_up"
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        if self.amount <= 0 {
            return Err(LedgerError::invalid_transaction("amount must be positive"));
        }

        if !uow.is_participant(self.kermesse_id, self.parent_id).await? {
            debug!(parent_id = %self.parent_id, kermesse_id = %self.kermesse_id, "parent is not a participant");
            return Err(LedgerError::PermissionDenied(Denial::NotParticipant));
        }

        let parent = uow.account(self.parent_id).await?;
        if parent.role() != Role::Parent {
            return Err(LedgerError::InvalidUserRole(parent.role().to_string()));
        }

        let transaction = uow
            .record(
                NewTransaction {
                    kermesse_id: Some(self.kermesse_id),
                    from: Party::Parent(self.parent_id),
                    to: Party::Kermesse(self.kermesse_id),
                    amount: self.amount,
                    kind: TransactionKind::Purchase,
                    stand_id: None,
                    status: self.policy.initial_status(),
                },
                now,
            )
            .await?;

        if self.policy == TopUpPolicy::DirectCredit {
            uow.adjust_balance(self.parent_id, self.amount).await?;
            uow.add_tokens_sold(self.kermesse_id, self.amount).await?;
        }

        Ok(transaction)
    }

    fn events(&self, output: &TokenTransaction, committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        vec![LedgerEvent::TokensPurchased(TokensPurchased {
            transaction_id: output.id,
            kermesse_id: self.kermesse_id,
            parent_id: self.parent_id,
            amount: self.amount,
            credited: self.policy == TopUpPolicy::DirectCredit,
            occurred_at: committed_at,
        })]
    }
}

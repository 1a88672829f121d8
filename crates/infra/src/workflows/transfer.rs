//! Parent to child token transfer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use kermesse_core::{Denial, KermesseId, LedgerError, LedgerResult, UserId};
use kermesse_ledger::{
    LedgerEvent, NewTransaction, Party, Role, TokenTransaction, TokensTransferred,
    TransactionKind, TransactionStatus,
};

use crate::store::UnitOfWork;

use super::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferWorkflow {
    pub parent_id: UserId,
    pub student_id: UserId,
    pub amount: i64,
    /// Required when `requires_participation` is set.
    pub kermesse_id: Option<KermesseId>,
    pub requires_participation: bool,
}

#[async_trait]
impl Workflow for TransferWorkflow {
    type Output = TokenTransaction;

    fn name(&self) -> &'static str {
        "transfer"
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        if self.amount <= 0 {
            return Err(LedgerError::invalid_transaction("amount must be positive"));
        }
        if self.parent_id == self.student_id {
            return Err(LedgerError::invalid_transaction("cannot transfer tokens to yourself"));
        }

        let parent = uow.account(self.parent_id).await?;
        if parent.role() != Role::Parent {
            return Err(LedgerError::InvalidUserRole(parent.role().to_string()));
        }
        let balance = parent.tokens()?;
        if balance < self.amount {
            return Err(LedgerError::InsufficientTokens {
                available: balance,
                required: self.amount,
            });
        }

        let student = uow.account(self.student_id).await?;
        if student.role() != Role::Student || student.parent_id() != Some(self.parent_id) {
            return Err(LedgerError::NotParentOfStudent);
        }

        if self.requires_participation {
            let kermesse_id = self
                .kermesse_id
                .ok_or_else(|| LedgerError::invalid_transaction("transfers must name a kermesse"))?;
            for user_id in [self.parent_id, self.student_id] {
                if !uow.is_participant(kermesse_id, user_id).await? {
                    debug!(user_id = %user_id, kermesse_id = %kermesse_id, "transfer party is not a participant");
                    return Err(LedgerError::PermissionDenied(Denial::NotParticipant));
                }
            }
        }

        let transaction = uow
            .record(
                NewTransaction {
                    kermesse_id: self.kermesse_id,
                    from: Party::Parent(self.parent_id),
                    to: Party::Student(self.student_id),
                    amount: self.amount,
                    kind: TransactionKind::Distribution,
                    stand_id: None,
                    status: TransactionStatus::Completed,
                },
                now,
            )
            .await?;
        uow.adjust_balance(self.parent_id, -self.amount).await?;
        uow.adjust_balance(self.student_id, self.amount).await?;

        Ok(transaction)
    }

    fn events(&self, output: &TokenTransaction, committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        vec![LedgerEvent::TokensTransferred(TokensTransferred {
            transaction_id: output.id,
            kermesse_id: self.kermesse_id,
            parent_id: self.parent_id,
            student_id: self.student_id,
            amount: self.amount,
            occurred_at: committed_at,
        })]
    }
}

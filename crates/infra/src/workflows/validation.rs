//! Organizer decision on a pending top-up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kermesse_core::{Denial, LedgerError, LedgerResult, TransactionId, UserId};
use kermesse_ledger::{
    LedgerEvent, TokenTransaction, TopUpRejected, TopUpValidated, TransactionKind,
    TransactionStatus,
};

use crate::store::UnitOfWork;

use super::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Validate,
    Reject,
}

impl Decision {
    fn target(self) -> TransactionStatus {
        match self {
            Decision::Validate => TransactionStatus::Validated,
            Decision::Reject => TransactionStatus::Rejected,
        }
    }
}

/// Validating credits the parent and the kermesse's `tokens_sold`; rejecting
/// only closes the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationWorkflow {
    pub transaction_id: TransactionId,
    pub organizer_id: UserId,
    pub decision: Decision,
}

#[async_trait]
impl Workflow for ValidationWorkflow {
    type Output = TokenTransaction;

    fn name(&self) -> &'static str {
        match self.decision {
            Decision::Validate => "validate_top_up",
            Decision::Reject => "reject_top_up",
        }
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        let pending = uow.transaction(self.transaction_id).await?;
        let target = self.decision.target();
        let status_error = || LedgerError::InvalidTransactionStatus {
            kind: pending.kind.to_string(),
            from: pending.status.to_string(),
            to: target.to_string(),
        };
        // Only top-ups are decided by organizers; transfers may carry no kermesse.
        if pending.kind != TransactionKind::Purchase {
            return Err(status_error());
        }
        let kermesse_id = pending
            .kermesse_id
            .ok_or_else(|| LedgerError::invalid_transaction("top-up is not attached to a kermesse"))?;

        if !uow.is_organizer(kermesse_id, self.organizer_id).await? {
            debug!(organizer_id = %self.organizer_id, kermesse_id = %kermesse_id, "caller is not an organizer");
            return Err(LedgerError::PermissionDenied(Denial::NotOrganizer));
        }

        if pending.status != TransactionStatus::Pending {
            return Err(status_error());
        }

        let decided = uow.set_status(self.transaction_id, target, now).await?;

        if self.decision == Decision::Validate {
            let parent_id = pending
                .from
                .user_id()
                .ok_or_else(|| LedgerError::invalid_transaction("top-up was not paid by a user"))?;
            uow.adjust_balance(parent_id, pending.amount).await?;
            uow.add_tokens_sold(kermesse_id, pending.amount).await?;
        }

        Ok(decided)
    }

    fn events(&self, output: &TokenTransaction, committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        let Some(kermesse_id) = output.kermesse_id else {
            return Vec::new();
        };
        match (self.decision, output.from.user_id()) {
            (Decision::Validate, Some(parent_id)) => vec![LedgerEvent::TopUpValidated(TopUpValidated {
                transaction_id: output.id,
                kermesse_id,
                organizer_id: self.organizer_id,
                parent_id,
                amount: output.amount,
                occurred_at: committed_at,
            })],
            (Decision::Reject, _) => vec![LedgerEvent::TopUpRejected(TopUpRejected {
                transaction_id: output.id,
                kermesse_id,
                organizer_id: self.organizer_id,
                occurred_at: committed_at,
            })],
            (Decision::Validate, None) => Vec::new(),
        }
    }
}

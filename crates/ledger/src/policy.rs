use core::str::FromStr;

use serde::{Deserialize, Serialize};

use kermesse_core::LedgerError;

use crate::transaction::TransactionStatus;

/// How a recorded top-up reaches the parent's balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopUpPolicy {
    /// Recorded `Pending`; an organizer validates it before anything is credited.
    #[default]
    PendingValidation,
    /// Recorded `Completed` and credited in the same unit of work.
    DirectCredit,
}

impl TopUpPolicy {
    pub fn initial_status(self) -> TransactionStatus {
        match self {
            TopUpPolicy::PendingValidation => TransactionStatus::Pending,
            TopUpPolicy::DirectCredit => TransactionStatus::Completed,
        }
    }
}

impl FromStr for TopUpPolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_validation" => Ok(TopUpPolicy::PendingValidation),
            "direct_credit" => Ok(TopUpPolicy::DirectCredit),
            other => Err(LedgerError::invalid_transaction(format!("unknown top-up policy '{other}'"))),
        }
    }
}

/// Deployment-level business rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPolicy {
    pub top_up: TopUpPolicy,
    /// Parent and child must both be on the kermesse roster to transfer.
    pub transfer_requires_participation: bool,
}

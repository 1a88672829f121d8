use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, LedgerError, LedgerResult, StandId, TransactionId, UserId};

/// One side of a token movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Party {
    Parent(UserId),
    Student(UserId),
    Stand(StandId),
    Kermesse(KermesseId),
}

impl Party {
    pub fn type_name(&self) -> &'static str {
        match self {
            Party::Parent(_) => "parent",
            Party::Student(_) => "student",
            Party::Stand(_) => "stand",
            Party::Kermesse(_) => "kermesse",
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        match self {
            Party::Parent(id) | Party::Student(id) => *id.as_uuid(),
            Party::Stand(id) => *id.as_uuid(),
            Party::Kermesse(id) => *id.as_uuid(),
        }
    }

    /// Rebuild a party from its persisted `(type, id)` pair.
    pub fn from_parts(type_name: &str, id: uuid::Uuid) -> LedgerResult<Self> {
        match type_name {
            "parent" => Ok(Party::Parent(UserId::from_uuid(id))),
            "student" => Ok(Party::Student(UserId::from_uuid(id))),
            "stand" => Ok(Party::Stand(StandId::from_uuid(id))),
            "kermesse" => Ok(Party::Kermesse(KermesseId::from_uuid(id))),
            other => Err(LedgerError::invalid_transaction(format!("unknown party type '{other}'"))),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Party::Parent(id) | Party::Student(id) => Some(*id),
            Party::Stand(_) | Party::Kermesse(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Parent buys tokens from the kermesse (top-up).
    Purchase,
    /// Parent hands tokens to their child.
    Distribution,
    /// Participant pays a stand.
    Spend,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Purchase => "Purchase",
            TransactionKind::Distribution => "Distribution",
            TransactionKind::Spend => "Spend",
        }
    }

    pub fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "Purchase" => Ok(TransactionKind::Purchase),
            "Distribution" => Ok(TransactionKind::Distribution),
            "Spend" => Ok(TransactionKind::Spend),
            other => Err(LedgerError::invalid_transaction(format!("unknown transaction type '{other}'"))),
        }
    }

    /// Statuses a new transaction of this kind may be recorded with.
    pub fn allows_initial(self, status: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match self {
            TransactionKind::Purchase => matches!(status, Pending | Completed),
            TransactionKind::Distribution => matches!(status, Completed),
            TransactionKind::Spend => matches!(status, Completed | Pending),
        }
    }

    /// Legal status edges for this kind. Everything not listed is refused.
    pub fn can_transition(self, from: TransactionStatus, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match self {
            TransactionKind::Purchase => from == Pending && matches!(to, Validated | Rejected),
            TransactionKind::Spend => from == Pending && matches!(to, Approved | Rejected),
            TransactionKind::Distribution => false,
        }
    }
}

impl core::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Validated,
    Rejected,
    Completed,
    Approved,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Validated => "Validated",
            TransactionStatus::Rejected => "Rejected",
            TransactionStatus::Completed => "Completed",
            TransactionStatus::Approved => "Approved",
        }
    }

    pub fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "Pending" => Ok(TransactionStatus::Pending),
            "Validated" => Ok(TransactionStatus::Validated),
            "Rejected" => Ok(TransactionStatus::Rejected),
            "Completed" => Ok(TransactionStatus::Completed),
            "Approved" => Ok(TransactionStatus::Approved),
            other => Err(LedgerError::invalid_transaction(format!("unknown transaction status '{other}'"))),
        }
    }
}

impl core::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction before the ledger assigns its id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub kermesse_id: Option<KermesseId>,
    pub from: Party,
    pub to: Party,
    pub amount: i64,
    pub kind: TransactionKind,
    pub stand_id: Option<StandId>,
    pub status: TransactionStatus,
}

impl NewTransaction {
    pub fn validate(&self) -> LedgerResult<()> {
        if self.from == self.to {
            return Err(LedgerError::invalid_transaction("sender and recipient must differ"));
        }
        if self.amount <= 0 {
            return Err(LedgerError::invalid_transaction("amount must be positive"));
        }
        if !self.kind.allows_initial(self.status) {
            return Err(LedgerError::InvalidTransactionStatus {
                kind: self.kind.to_string(),
                from: "new".to_string(),
                to: self.status.to_string(),
            });
        }
        if self.kind == TransactionKind::Spend {
            match (self.to, self.stand_id) {
                (Party::Stand(to), Some(stand)) if to == stand => {}
                _ => return Err(LedgerError::invalid_transaction("spend must be paid to its stand")),
            }
        }
        Ok(())
    }

    /// Assign identity and timestamps. Fails if the transaction is malformed.
    pub fn into_recorded(self, id: TransactionId, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        self.validate()?;
        Ok(TokenTransaction {
            id,
            kermesse_id: self.kermesse_id,
            from: self.from,
            to: self.to,
            amount: self.amount,
            kind: self.kind,
            stand_id: self.stand_id,
            status: self.status,
            created_at: now,
            updated_at: now,
        })
    }
}

/// A recorded movement of value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: TransactionId,
    /// `None` for transfers recorded outside any kermesse.
    pub kermesse_id: Option<KermesseId>,
    pub from: Party,
    pub to: Party,
    pub amount: i64,
    pub kind: TransactionKind,
    pub stand_id: Option<StandId>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenTransaction {
    /// Move to `to` if the kind's state machine allows it.
    pub fn transition(&mut self, to: TransactionStatus, now: DateTime<Utc>) -> LedgerResult<()> {
        if !self.kind.can_transition(self.status, to) {
            return Err(LedgerError::InvalidTransactionStatus {
                kind: self.kind.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn involves(&self, party: &Party) -> bool {
        self.from == *party || self.to == *party
    }
}

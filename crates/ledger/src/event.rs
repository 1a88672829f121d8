use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, StandId, StockId, TransactionId, UserId};
use kermesse_events::{Event, EventEnvelope};

/// Event: TokensPurchased (top-up recorded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensPurchased {
    pub transaction_id: TransactionId,
    pub kermesse_id: KermesseId,
    pub parent_id: UserId,
    pub amount: i64,
    /// True when the parent's balance was credited immediately.
    pub credited: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TopUpValidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpValidated {
    pub transaction_id: TransactionId,
    pub kermesse_id: KermesseId,
    pub organizer_id: UserId,
    pub parent_id: UserId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TopUpRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpRejected {
    pub transaction_id: TransactionId,
    pub kermesse_id: KermesseId,
    pub organizer_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TokensTransferred (parent to child).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensTransferred {
    pub transaction_id: TransactionId,
    pub kermesse_id: Option<KermesseId>,
    pub parent_id: UserId,
    pub student_id: UserId,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseCompleted (spend at a stand).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCompleted {
    pub transaction_id: TransactionId,
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub stock_id: StockId,
    pub buyer_id: UserId,
    pub quantity: i64,
    pub total_cost: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PointsAttributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsAttributed {
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub student_id: UserId,
    pub points: i64,
    pub total_points: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    TokensPurchased(TokensPurchased),
    TopUpValidated(TopUpValidated),
    TopUpRejected(TopUpRejected),
    TokensTransferred(TokensTransferred),
    PurchaseCompleted(PurchaseCompleted),
    PointsAttributed(PointsAttributed),
}

impl LedgerEvent {
    pub fn kermesse_id(&self) -> Option<KermesseId> {
        match self {
            LedgerEvent::TokensPurchased(e) => Some(e.kermesse_id),
            LedgerEvent::TopUpValidated(e) => Some(e.kermesse_id),
            LedgerEvent::TopUpRejected(e) => Some(e.kermesse_id),
            LedgerEvent::TokensTransferred(e) => e.kermesse_id,
            LedgerEvent::PurchaseCompleted(e) => Some(e.kermesse_id),
            LedgerEvent::PointsAttributed(e) => Some(e.kermesse_id),
        }
    }

    /// Wrap into an envelope at position `sequence_number` of the publisher's stream.
    pub fn into_envelope(self, sequence_number: u64) -> EventEnvelope<LedgerEvent> {
        EventEnvelope::new(
            uuid::Uuid::now_v7(),
            self.kermesse_id(),
            self.event_type(),
            sequence_number,
            self,
        )
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::TokensPurchased(_) => "ledger.top_up.recorded",
            LedgerEvent::TopUpValidated(_) => "ledger.top_up.validated",
            LedgerEvent::TopUpRejected(_) => "ledger.top_up.rejected",
            LedgerEvent::TokensTransferred(_) => "ledger.transfer.completed",
            LedgerEvent::PurchaseCompleted(_) => "ledger.purchase.completed",
            LedgerEvent::PointsAttributed(_) => "ledger.points.attributed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::TokensPurchased(e) => e.occurred_at,
            LedgerEvent::TopUpValidated(e) => e.occurred_at,
            LedgerEvent::TopUpRejected(e) => e.occurred_at,
            LedgerEvent::TokensTransferred(e) => e.occurred_at,
            LedgerEvent::PurchaseCompleted(e) => e.occurred_at,
            LedgerEvent::PointsAttributed(e) => e.occurred_at,
        }
    }
}

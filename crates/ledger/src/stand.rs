use core::str::FromStr;

use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, LedgerError, LedgerResult, StandId, StockId, UserId};

/// What a stand offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandKind {
    Food,
    Drink,
    Activity,
}

impl StandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StandKind::Food => "food",
            StandKind::Drink => "drink",
            StandKind::Activity => "activity",
        }
    }

    /// Activities have unlimited capacity; food and drink sell finite stock.
    pub fn tracks_stock(self) -> bool {
        !matches!(self, StandKind::Activity)
    }
}

impl FromStr for StandKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "food" => Ok(StandKind::Food),
            "drink" => Ok(StandKind::Drink),
            "activity" => Ok(StandKind::Activity),
            other => Err(LedgerError::invalid_transaction(format!("unknown stand type '{other}'"))),
        }
    }
}

/// A vendor or activity booth with its cumulative aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stand {
    pub id: StandId,
    pub kermesse_id: KermesseId,
    pub name: String,
    pub kind: StandKind,
    /// Cumulative tokens spent at this stand.
    pub tokens_spent: i64,
    /// Cumulative points handed out (activity stands only).
    pub points_given: i64,
}

impl Stand {
    pub fn new(id: StandId, kermesse_id: KermesseId, name: impl Into<String>, kind: StandKind) -> Self {
        Self {
            id,
            kermesse_id,
            name: name.into(),
            kind,
            tokens_spent: 0,
            points_given: 0,
        }
    }

    pub fn ensure_in(&self, kermesse_id: KermesseId) -> LedgerResult<()> {
        if self.kermesse_id != kermesse_id {
            return Err(LedgerError::StandNotInKermesse);
        }
        Ok(())
    }

    pub fn ensure_activity(&self) -> LedgerResult<()> {
        if self.kind != StandKind::Activity {
            return Err(LedgerError::NotActivityStand);
        }
        Ok(())
    }

    pub fn record_spend(&mut self, amount: i64) -> LedgerResult<i64> {
        if amount <= 0 {
            return Err(LedgerError::invalid_transaction("amount must be positive"));
        }
        self.tokens_spent = self
            .tokens_spent
            .checked_add(amount)
            .ok_or_else(|| LedgerError::invalid_transaction("tokens spent overflow"))?;
        Ok(self.tokens_spent)
    }

    pub fn record_points(&mut self, points: i64) -> LedgerResult<i64> {
        self.ensure_activity()?;
        if points <= 0 {
            return Err(LedgerError::invalid_transaction("points must be positive"));
        }
        self.points_given = self
            .points_given
            .checked_add(points)
            .ok_or_else(|| LedgerError::invalid_transaction("points given overflow"))?;
        Ok(self.points_given)
    }
}

/// A priced good (or activity slot) sold at a stand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub id: StockId,
    pub stand_id: StandId,
    pub item_name: String,
    pub quantity: i64,
    pub token_cost: i64,
}

impl StockItem {
    pub fn new(
        id: StockId,
        stand_id: StandId,
        item_name: impl Into<String>,
        quantity: i64,
        token_cost: i64,
    ) -> LedgerResult<Self> {
        if quantity < 0 {
            return Err(LedgerError::invalid_transaction("quantity cannot be negative"));
        }
        if token_cost <= 0 {
            return Err(LedgerError::invalid_transaction("token cost must be positive"));
        }
        Ok(Self {
            id,
            stand_id,
            item_name: item_name.into(),
            quantity,
            token_cost,
        })
    }

    /// Total price of `quantity` units.
    pub fn cost_of(&self, quantity: i64) -> LedgerResult<i64> {
        if quantity <= 0 {
            return Err(LedgerError::invalid_transaction("quantity must be positive"));
        }
        self.token_cost
            .checked_mul(quantity)
            .ok_or_else(|| LedgerError::invalid_transaction("total cost overflow"))
    }

    /// Check that `requested` units can be sold. Activities never run out.
    pub fn ensure_available(&self, kind: StandKind, requested: i64) -> LedgerResult<()> {
        if kind.tracks_stock() && self.quantity < requested {
            return Err(LedgerError::InsufficientStock {
                available: self.quantity,
                requested,
            });
        }
        Ok(())
    }

    /// Apply a signed quantity change and return the new quantity.
    ///
    /// No-op for activity stands. A change that would leave the quantity
    /// negative fails and leaves the item untouched.
    pub fn adjust(&mut self, kind: StandKind, delta: i64) -> LedgerResult<i64> {
        if !kind.tracks_stock() {
            return Ok(self.quantity);
        }
        let next = self
            .quantity
            .checked_add(delta)
            .ok_or_else(|| LedgerError::invalid_transaction("quantity overflow"))?;
        if next < 0 {
            let requested = delta
                .checked_neg()
                .ok_or_else(|| LedgerError::invalid_transaction("quantity change out of range"))?;
            return Err(LedgerError::InsufficientStock {
                available: self.quantity,
                requested,
            });
        }
        self.quantity = next;
        Ok(next)
    }
}

/// Result of awarding activity points to a student. Not persisted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointAttributionResult {
    pub student_id: UserId,
    pub points_added: i64,
    pub total_points: i64,
}

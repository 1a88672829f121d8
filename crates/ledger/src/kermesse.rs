use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, LedgerError, LedgerResult};

/// A school fair. Rosters (organizers, participants) are kept by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kermesse {
    pub id: KermesseId,
    pub name: String,
    /// Cumulative tokens credited to parents through validated top-ups.
    pub tokens_sold: i64,
}

impl Kermesse {
    pub fn new(id: KermesseId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tokens_sold: 0,
        }
    }

    pub fn record_tokens_sold(&mut self, amount: i64) -> LedgerResult<i64> {
        if amount <= 0 {
            return Err(LedgerError::invalid_transaction("amount must be positive"));
        }
        self.tokens_sold = self
            .tokens_sold
            .checked_add(amount)
            .ok_or_else(|| LedgerError::invalid_transaction("tokens sold overflow"))?;
        Ok(self.tokens_sold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_sold_only_grows() {
        let mut kermesse = Kermesse::new(KermesseId::new(), "Spring fair");
        assert_eq!(kermesse.record_tokens_sold(50), Ok(50));
        assert_eq!(kermesse.record_tokens_sold(25), Ok(75));
        assert!(kermesse.record_tokens_sold(-5).is_err());
        assert_eq!(kermesse.tokens_sold, 75);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kermesse_core::{KermesseId, LedgerError, LedgerResult, MessageId, StandId, UserId};

/// A message posted in a stand's chat room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatMessage {
    pub kermesse_id: KermesseId,
    pub stand_id: StandId,
    pub sender_id: UserId,
    pub body: String,
}

impl NewChatMessage {
    pub fn into_message(self, id: MessageId, now: DateTime<Utc>) -> LedgerResult<ChatMessage> {
        let body = self.body.trim();
        if body.is_empty() {
            return Err(LedgerError::invalid_transaction("message body is empty"));
        }
        Ok(ChatMessage {
            id,
            kermesse_id: self.kermesse_id,
            stand_id: self.stand_id,
            sender_id: self.sender_id,
            body: body.to_string(),
            sent_at: now,
        })
    }
}

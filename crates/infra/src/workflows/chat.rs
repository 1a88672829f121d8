//! Posting to a stand's chat room.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use kermesse_core::{Denial, LedgerError, LedgerResult};
use kermesse_ledger::{ChatMessage, LedgerEvent, NewChatMessage};

use crate::store::UnitOfWork;

use super::Workflow;

/// Organizers of the kermesse and the stand's holder may post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMessageWorkflow {
    pub message: NewChatMessage,
}

#[async_trait]
impl Workflow for PostMessageWorkflow {
    type Output = ChatMessage;

    fn name(&self) -> &'static str {
        "post_message"
    }

    async fn run(&self, uow: &mut dyn UnitOfWork, now: DateTime<Utc>) -> LedgerResult<ChatMessage> {
        let NewChatMessage {
            kermesse_id,
            stand_id,
            sender_id,
            ..
        } = self.message;

        uow.stand(stand_id).await?.ensure_in(kermesse_id)?;

        let allowed = uow.is_organizer(kermesse_id, sender_id).await?
            || uow.is_stand_holder(sender_id, stand_id).await?;
        if !allowed {
            debug!(sender_id = %sender_id, stand_id = %stand_id, "sender may not post in this room");
            return Err(LedgerError::PermissionDenied(Denial::NotStandHolder));
        }

        uow.save_message(self.message.clone(), now).await
    }

    fn events(&self, _output: &ChatMessage, _committed_at: DateTime<Utc>) -> Vec<LedgerEvent> {
        Vec::new()
    }
}

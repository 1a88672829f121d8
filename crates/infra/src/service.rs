//! Ledger service: the operations exposed to the transport layer.
//!
//! ## Execution Flow
//!
//! ```text
//! operation(args)
//!   ↓
//! 1. Build the workflow value from the arguments and configured policy
//!   ↓
//! 2. Begin a unit of work on the store
//!   ↓
//! 3. Run the workflow (guards, checks, writes) inside the unit
//!   ↓
//! 4. Commit, or roll back on any workflow error
//!   ↓  Conflict? start again from 2, up to `max_conflict_retries` times
//! 5. Publish the workflow's notifications on the bus
//! ```
//!
//! Steps 2 to 4 run under the optional operation timeout. A timed-out
//! operation drops its unit of work, which discards everything it buffered,
//! and fails with `Timeout`.
//!
//! Publication happens strictly after the commit and is best-effort: a bus
//! failure is logged and never undoes committed ledger state.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use kermesse_core::{
    KermesseId, LedgerError, LedgerResult, StandId, StockId, TransactionId, UserId,
};
use kermesse_events::{Event, EventBus, EventEnvelope};
use kermesse_ledger::{
    Account, ChatMessage, Kermesse, LedgerEvent, NewChatMessage, Party, PointAttributionResult,
    Role, Stand, StockItem, TokenTransaction,
};

use crate::chat::ChatRooms;
use crate::config::LedgerConfig;
use crate::store::{
    AccountStore, ChatStore, InventoryStore, KermesseStore, LedgerStore, Pagination, TransactionLedger,
    UnitOfWork,
};
use crate::workflows::{
    Decision, PointAttributionWorkflow, PostMessageWorkflow, PurchaseOutcome, PurchaseWorkflow,
    TopUpWorkflow, TransferWorkflow, ValidationWorkflow, Workflow,
};

/// Proof of an external payment, issued by the payment provider before the
/// top-up is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub reference: String,
    pub amount: i64,
}

#[derive(Debug)]
pub struct LedgerService<S, B> {
    store: S,
    bus: B,
    config: LedgerConfig,
    sequence: AtomicU64,
    chat: ChatRooms,
}

impl<S, B> LedgerService<S, B> {
    pub fn new(store: S, bus: B, config: LedgerConfig) -> Self {
        Self {
            store,
            bus,
            config,
            sequence: AtomicU64::new(0),
            chat: ChatRooms::new(),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Live per-stand chat rooms fed by [`LedgerService::save_message`].
    pub fn chat_rooms(&self) -> &ChatRooms {
        &self.chat
    }
}

impl<S, B> LedgerService<S, B>
where
    S: LedgerStore,
    B: EventBus<EventEnvelope<LedgerEvent>>,
{
    // Write operations

    #[instrument(skip_all, fields(buyer_id = %buyer_id, kermesse_id = %kermesse_id, stand_id = %stand_id, stock_id = %stock_id), err)]
    pub async fn create_purchase(
        &self,
        buyer_id: UserId,
        kermesse_id: KermesseId,
        stand_id: StandId,
        stock_id: StockId,
        quantity: i64,
    ) -> LedgerResult<PurchaseOutcome> {
        let outcome = self
            .execute(PurchaseWorkflow {
                buyer_id,
                kermesse_id,
                stand_id,
                stock_id,
                quantity,
            })
            .await?;
        info!(
            transaction_id = %outcome.transaction.id,
            total_cost = outcome.transaction.amount,
            remaining_tokens = outcome.remaining_tokens,
            "purchase committed"
        );
        Ok(outcome)
    }

    #[instrument(skip_all, fields(parent_id = %parent_id, kermesse_id = %kermesse_id, payment_ref = %payment.reference), err)]
    pub async fn create_top_up(
        &self,
        parent_id: UserId,
        kermesse_id: KermesseId,
        amount: i64,
        payment: PaymentConfirmation,
    ) -> LedgerResult<TokenTransaction> {
        if payment.reference.trim().is_empty() {
            return Err(LedgerError::invalid_transaction("payment reference is required"));
        }
        if payment.amount != amount {
            warn!(paid = payment.amount, requested = amount, "payment does not cover the top-up");
            return Err(LedgerError::invalid_transaction(format!(
                "payment of {} does not match top-up of {}",
                payment.amount, amount
            )));
        }

        let transaction = self
            .execute(TopUpWorkflow {
                parent_id,
                kermesse_id,
                amount,
                policy: self.config.policy().top_up,
            })
            .await?;
        info!(transaction_id = %transaction.id, status = %transaction.status, amount, "top-up recorded");
        Ok(transaction)
    }

    #[instrument(skip_all, fields(transaction_id = %transaction_id, organizer_id = %organizer_id), err)]
    pub async fn validate_top_up(
        &self,
        transaction_id: TransactionId,
        organizer_id: UserId,
    ) -> LedgerResult<TokenTransaction> {
        let transaction = self
            .execute(ValidationWorkflow {
                transaction_id,
                organizer_id,
                decision: Decision::Validate,
            })
            .await?;
        info!(amount = transaction.amount, "top-up validated");
        Ok(transaction)
    }

    #[instrument(skip_all, fields(transaction_id = %transaction_id, organizer_id = %organizer_id), err)]
    pub async fn reject_top_up(
        &self,
        transaction_id: TransactionId,
        organizer_id: UserId,
    ) -> LedgerResult<TokenTransaction> {
        let transaction = self
            .execute(ValidationWorkflow {
                transaction_id,
                organizer_id,
                decision: Decision::Reject,
            })
            .await?;
        info!("top-up rejected");
        Ok(transaction)
    }

    /// `kermesse_id` scopes the transfer; it is mandatory when the deployment
    /// requires both parties to participate.
    #[instrument(skip_all, fields(parent_id = %parent_id, student_id = %student_id), err)]
    pub async fn create_transfer(
        &self,
        parent_id: UserId,
        student_id: UserId,
        amount: i64,
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<TokenTransaction> {
        let transaction = self
            .execute(TransferWorkflow {
                parent_id,
                student_id,
                amount,
                kermesse_id,
                requires_participation: self.config.policy().transfer_requires_participation,
            })
            .await?;
        info!(transaction_id = %transaction.id, amount, "transfer committed");
        Ok(transaction)
    }

    #[instrument(skip_all, fields(stand_holder_id = %stand_holder_id, kermesse_id = %kermesse_id, stand_id = %stand_id, student_id = %student_id), err)]
    pub async fn attribute_points(
        &self,
        stand_holder_id: UserId,
        kermesse_id: KermesseId,
        stand_id: StandId,
        student_id: UserId,
        points: i64,
    ) -> LedgerResult<PointAttributionResult> {
        let result = self
            .execute(PointAttributionWorkflow {
                stand_holder_id,
                kermesse_id,
                stand_id,
                student_id,
                points,
            })
            .await?;
        info!(points, total_points = result.total_points, "points attributed");
        Ok(result)
    }

    /// Persist a chat message, then push it to the stand's live room.
    #[instrument(skip_all, fields(kermesse_id = %message.kermesse_id, stand_id = %message.stand_id, sender_id = %message.sender_id), err)]
    pub async fn save_message(&self, message: NewChatMessage) -> LedgerResult<ChatMessage> {
        let saved = self.execute(PostMessageWorkflow { message }).await?;
        if let Err(err) = self.chat.broadcast(&saved) {
            warn!(message_id = %saved.id, error = %err, "chat broadcast failed");
        }
        Ok(saved)
    }

    // Read operations

    #[instrument(skip(self), err)]
    pub async fn get_transaction(&self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction> {
        let mut uow = self.store.begin().await?;
        let result = uow.transaction(transaction_id).await;
        self.finish_read(uow).await;
        result
    }

    /// Transactions involving any of the parent's children, oldest first.
    #[instrument(skip(self), err)]
    pub async fn list_children_transactions(
        &self,
        parent_id: UserId,
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<Vec<TokenTransaction>> {
        let mut uow = self.store.begin().await?;
        let result = children_transactions(uow.as_mut(), parent_id, kermesse_id).await;
        self.finish_read(uow).await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn get_balance(&self, user_id: UserId) -> LedgerResult<i64> {
        let mut uow = self.store.begin().await?;
        let result = uow.balance(user_id).await;
        self.finish_read(uow).await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn get_account(&self, user_id: UserId) -> LedgerResult<Account> {
        let mut uow = self.store.begin().await?;
        let result = uow.account(user_id).await;
        self.finish_read(uow).await;
        result
    }

    /// Stand with its `tokens_spent` and `points_given` aggregates.
    #[instrument(skip(self), err)]
    pub async fn get_stand(&self, stand_id: StandId) -> LedgerResult<Stand> {
        let mut uow = self.store.begin().await?;
        let result = uow.stand(stand_id).await;
        self.finish_read(uow).await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn list_stock(&self, stand_id: StandId) -> LedgerResult<Vec<StockItem>> {
        let mut uow = self.store.begin().await?;
        let result = uow.stock_items(stand_id).await;
        self.finish_read(uow).await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn get_kermesse(&self, kermesse_id: KermesseId) -> LedgerResult<Kermesse> {
        let mut uow = self.store.begin().await?;
        let result = uow.kermesse(kermesse_id).await;
        self.finish_read(uow).await;
        result
    }

    #[instrument(skip(self), err)]
    pub async fn list_messages(
        &self,
        kermesse_id: KermesseId,
        stand_id: StandId,
        page: Pagination,
    ) -> LedgerResult<Vec<ChatMessage>> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_messages(kermesse_id, stand_id, page).await;
        self.finish_read(uow).await;
        result
    }

    // Unit-of-work plumbing

    async fn execute<W: Workflow>(&self, workflow: W) -> LedgerResult<W::Output> {
        let attempts = self.run_with_retries(&workflow);
        let (output, committed_at) = match self.config.operation_timeout() {
            Some(limit) => tokio::time::timeout(limit, attempts).await.map_err(|_| {
                warn!(workflow = workflow.name(), timeout_ms = limit.as_millis() as u64, "operation timed out");
                LedgerError::Timeout
            })??,
            None => attempts.await?,
        };

        self.publish(workflow.events(&output, committed_at));
        Ok(output)
    }

    async fn run_with_retries<W: Workflow>(&self, workflow: &W) -> LedgerResult<(W::Output, DateTime<Utc>)> {
        let mut retries: u32 = 0;
        loop {
            match self.run_once(workflow).await {
                Err(err) if err.is_retryable() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    warn!(workflow = workflow.name(), retries, error = %err, "conflict, retrying unit of work");
                }
                result => return result,
            }
        }
    }

    async fn run_once<W: Workflow>(&self, workflow: &W) -> LedgerResult<(W::Output, DateTime<Utc>)> {
        let mut uow = self.store.begin().await?;
        let now = Utc::now();
        match workflow.run(uow.as_mut(), now).await {
            Ok(output) => {
                uow.commit().await?;
                Ok((output, now))
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(workflow = workflow.name(), error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn finish_read(&self, mut uow: Box<dyn UnitOfWork>) {
        if let Err(err) = uow.rollback().await {
            warn!(error = %err, "failed to release read unit of work");
        }
    }

    fn publish(&self, events: Vec<LedgerEvent>) {
        for event in events {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let event_type = event.event_type();
            if let Err(err) = self.bus.publish(event.into_envelope(sequence)) {
                warn!(event_type, error = ?err, "failed to publish ledger event");
            }
        }
    }
}

async fn children_transactions(
    uow: &mut dyn UnitOfWork,
    parent_id: UserId,
    kermesse_id: Option<KermesseId>,
) -> LedgerResult<Vec<TokenTransaction>> {
    let parent = uow.account(parent_id).await?;
    if parent.role() != Role::Parent {
        return Err(LedgerError::InvalidUserRole(parent.role().to_string()));
    }
    let parties: Vec<Party> = uow
        .children(parent_id)
        .await?
        .iter()
        .map(|child| Party::Student(child.user_id))
        .collect();
    uow.list_involving(&parties, kermesse_id).await
}

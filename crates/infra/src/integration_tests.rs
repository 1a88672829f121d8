//! Integration tests for the full ledger pipeline.
//!
//! Tests: LedgerService → Workflow → UnitOfWork → InMemoryLedgerStore → EventBus
//!
//! Verifies:
//! - The fair scenarios end to end (transfer, purchase, top-up, points)
//! - Failed operations leave balances and stock untouched
//! - Concurrent purchases never oversell and never overdraw
//! - Notifications are published only after a commit
//! - A unit aborted at commit (timeout, storage failure) leaves no partial effect

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kermesse_core::{
    Denial, KermesseId, LedgerError, LedgerResult, StandId, StockId, TransactionId, UserId,
};
use kermesse_events::{EventBus, EventEnvelope, InMemoryEventBus};
use kermesse_ledger::{
    Account, ChatMessage, Kermesse, LedgerEvent, NewChatMessage, NewTransaction, Party, Stand,
    StandKind, StockItem, TokenTransaction, TopUpPolicy, TransactionKind, TransactionStatus,
};

use crate::config::LedgerConfig;
use crate::service::{LedgerService, PaymentConfirmation};
use crate::store::{
    AccountStore, ChatStore, InMemoryLedgerStore, InventoryStore, KermesseStore, LedgerStore,
    Pagination, ParticipationGuard, TransactionLedger, UnitOfWork,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<LedgerEvent>>>;
type Service<S = InMemoryLedgerStore> = LedgerService<S, Bus>;

struct Fair {
    store: InMemoryLedgerStore,
    bus: Bus,
    service: Arc<Service>,
    kermesse: KermesseId,
    organizer: UserId,
    parent: UserId,
    child: UserId,
    food_holder: UserId,
    food_stand: StandId,
    crepe: StockId,
    activity_holder: UserId,
    activity_stand: StandId,
    dart_round: StockId,
}

impl Fair {
    fn enrol_student(&self, tokens: i64) -> UserId {
        let student = UserId::new();
        self.store
            .add_account(Account::student(student, "Student", None).with_tokens(tokens))
            .unwrap();
        self.store.add_participant(self.kermesse, student).unwrap();
        student
    }

    fn add_stock(&self, quantity: i64, token_cost: i64) -> StockId {
        let stock = StockId::new();
        self.store
            .add_stock_item(StockItem::new(stock, self.food_stand, "Lemonade", quantity, token_cost).unwrap())
            .unwrap();
        stock
    }

    fn payment(amount: i64) -> PaymentConfirmation {
        PaymentConfirmation {
            reference: "pi_test_123".to_string(),
            amount,
        }
    }
}

/// Parent with 100 tokens, their child with 20, a food stand selling 10
/// crepes at 5 tokens and an activity stand.
fn fair(config: LedgerConfig) -> Fair {
    kermesse_observability::init_test();

    let store = InMemoryLedgerStore::new();
    let kermesse = KermesseId::new();
    let organizer = UserId::new();
    let parent = UserId::new();
    let child = UserId::new();
    let food_holder = UserId::new();
    let food_stand = StandId::new();
    let crepe = StockId::new();
    let activity_holder = UserId::new();
    let activity_stand = StandId::new();
    let dart_round = StockId::new();

    store.add_kermesse(Kermesse::new(kermesse, "Spring fair")).unwrap();
    store.add_stand(Stand::new(food_stand, kermesse, "Crepes", StandKind::Food)).unwrap();
    store.add_stand(Stand::new(activity_stand, kermesse, "Darts", StandKind::Activity)).unwrap();
    store
        .add_stock_item(StockItem::new(crepe, food_stand, "Crepe", 10, 5).unwrap())
        .unwrap();
    store
        .add_stock_item(StockItem::new(dart_round, activity_stand, "Round of darts", 0, 2).unwrap())
        .unwrap();

    store.add_account(Account::organizer(organizer, "Organizer")).unwrap();
    store.add_account(Account::parent(parent, "Parent").with_tokens(100)).unwrap();
    store
        .add_account(Account::student(child, "Child", Some(parent)).with_tokens(20))
        .unwrap();
    store
        .add_account(Account::stand_holder(food_holder, "Crepe maker", Some(food_stand)))
        .unwrap();
    store
        .add_account(Account::stand_holder(activity_holder, "Darts keeper", Some(activity_stand)))
        .unwrap();

    store.add_organizer(kermesse, organizer).unwrap();
    for user in [parent, child, food_holder, activity_holder] {
        store.add_participant(kermesse, user).unwrap();
    }

    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let service = Arc::new(LedgerService::new(store.clone(), bus.clone(), config));

    Fair {
        store,
        bus,
        service,
        kermesse,
        organizer,
        parent,
        child,
        food_holder,
        food_stand,
        crepe,
        activity_holder,
        activity_stand,
        dart_round,
    }
}

// Scenarios

#[tokio::test]
async fn parent_transfers_tokens_to_their_child() {
    let f = fair(LedgerConfig::default());

    let tx = f.service.create_transfer(f.parent, f.child, 30, Some(f.kermesse)).await.unwrap();

    assert_eq!(tx.kind, TransactionKind::Distribution);
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.from, Party::Parent(f.parent));
    assert_eq!(tx.to, Party::Student(f.child));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 70);
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 50);
}

#[tokio::test]
async fn purchase_debits_buyer_and_consumes_stock() {
    let f = fair(LedgerConfig::default());

    let outcome = f
        .service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 3)
        .await
        .unwrap();

    assert_eq!(outcome.transaction.amount, 15);
    assert_eq!(outcome.transaction.kind, TransactionKind::Spend);
    assert_eq!(outcome.transaction.stand_id, Some(f.food_stand));
    assert_eq!(outcome.remaining_tokens, 5);
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 5);
    assert_eq!(f.service.list_stock(f.food_stand).await.unwrap()[0].quantity, 7);
    assert_eq!(f.service.get_stand(f.food_stand).await.unwrap().tokens_spent, 15);
    assert_eq!(
        f.service.get_transaction(outcome.transaction.id).await.unwrap(),
        outcome.transaction
    );
}

#[tokio::test]
async fn oversized_purchase_changes_nothing() {
    let f = fair(LedgerConfig::default());

    let err = f
        .service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 11)
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::InsufficientStock { available: 10, requested: 11 });
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 20);
    assert_eq!(f.service.list_stock(f.food_stand).await.unwrap()[0].quantity, 10);
    assert_eq!(f.service.get_stand(f.food_stand).await.unwrap().tokens_spent, 0);
    assert!(f.service.list_children_transactions(f.parent, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn organizer_validates_a_pending_top_up_once() {
    let f = fair(LedgerConfig::default());

    let pending = f
        .service
        .create_top_up(f.parent, f.kermesse, 50, Fair::payment(50))
        .await
        .unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.to, Party::Kermesse(f.kermesse));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 100);

    let validated = f.service.validate_top_up(pending.id, f.organizer).await.unwrap();
    assert_eq!(validated.status, TransactionStatus::Validated);
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 150);
    assert_eq!(f.service.get_kermesse(f.kermesse).await.unwrap().tokens_sold, 50);

    let err = f.service.validate_top_up(pending.id, f.organizer).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransactionStatus { .. }));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 150);
    assert_eq!(f.service.get_kermesse(f.kermesse).await.unwrap().tokens_sold, 50);
}

#[tokio::test]
async fn activity_stand_awards_points_to_participants_only() {
    let f = fair(LedgerConfig::default());

    let result = f
        .service
        .attribute_points(f.activity_holder, f.kermesse, f.activity_stand, f.child, 10)
        .await
        .unwrap();
    assert_eq!(result.points_added, 10);
    assert_eq!(result.total_points, 10);
    assert_eq!(f.service.get_account(f.child).await.unwrap().points().unwrap(), 10);
    assert_eq!(f.service.get_stand(f.activity_stand).await.unwrap().points_given, 10);

    let outsider = UserId::new();
    f.store.add_account(Account::student(outsider, "Visitor", None)).unwrap();
    let err = f
        .service
        .attribute_points(f.activity_holder, f.kermesse, f.activity_stand, outsider, 10)
        .await
        .unwrap_err();
    assert_eq!(err, LedgerError::PermissionDenied(Denial::NotParticipant));
    assert_eq!(f.service.get_stand(f.activity_stand).await.unwrap().points_given, 10);
}

// Supplementary operations

#[tokio::test]
async fn rejected_top_up_credits_nothing_and_stays_closed() {
    let f = fair(LedgerConfig::default());
    let pending = f
        .service
        .create_top_up(f.parent, f.kermesse, 40, Fair::payment(40))
        .await
        .unwrap();

    let rejected = f.service.reject_top_up(pending.id, f.organizer).await.unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);

    let err = f.service.validate_top_up(pending.id, f.organizer).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransactionStatus { .. }));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 100);
    assert_eq!(f.service.get_kermesse(f.kermesse).await.unwrap().tokens_sold, 0);
}

#[tokio::test]
async fn direct_credit_policy_completes_top_ups_immediately() {
    let f = fair(LedgerConfig {
        top_up_policy: TopUpPolicy::DirectCredit,
        ..LedgerConfig::default()
    });

    let tx = f
        .service
        .create_top_up(f.parent, f.kermesse, 50, Fair::payment(50))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 150);
    assert_eq!(f.service.get_kermesse(f.kermesse).await.unwrap().tokens_sold, 50);
    let err = f.service.validate_top_up(tx.id, f.organizer).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransactionStatus { .. }));
}

#[tokio::test]
async fn top_up_must_match_the_confirmed_payment() {
    let f = fair(LedgerConfig::default());

    let err = f
        .service
        .create_top_up(f.parent, f.kermesse, 50, Fair::payment(40))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidTransaction(_)));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 100);
}

#[tokio::test]
async fn only_organizers_validate_top_ups() {
    let f = fair(LedgerConfig::default());
    let pending = f
        .service
        .create_top_up(f.parent, f.kermesse, 50, Fair::payment(50))
        .await
        .unwrap();

    let err = f.service.validate_top_up(pending.id, f.food_holder).await.unwrap_err();
    assert_eq!(err, LedgerError::PermissionDenied(Denial::NotOrganizer));

    let err = f.service.validate_top_up(TransactionId::new(), f.organizer).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn participation_policy_gates_transfers() {
    let f = fair(LedgerConfig {
        transfer_requires_participation: true,
        ..LedgerConfig::default()
    });

    f.service.create_transfer(f.parent, f.child, 10, Some(f.kermesse)).await.unwrap();

    let err = f.service.create_transfer(f.parent, f.child, 10, None).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransaction(_)));
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 90);
}

#[tokio::test]
async fn transfer_rejects_overdraft_and_strangers() {
    let f = fair(LedgerConfig::default());

    let err = f.service.create_transfer(f.parent, f.child, 101, None).await.unwrap_err();
    assert_eq!(err, LedgerError::InsufficientTokens { available: 100, required: 101 });

    let other = f.enrol_student(0);
    let err = f.service.create_transfer(f.parent, other, 10, None).await.unwrap_err();
    assert_eq!(err, LedgerError::NotParentOfStudent);
    assert_eq!(f.service.get_balance(f.parent).await.unwrap(), 100);
}

#[tokio::test]
async fn activity_purchases_never_run_out() {
    let f = fair(LedgerConfig::default());

    for _ in 0..3 {
        f.service
            .create_purchase(f.child, f.kermesse, f.activity_stand, f.dart_round, 2)
            .await
            .unwrap();
    }

    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 8);
    assert_eq!(f.service.get_stand(f.activity_stand).await.unwrap().tokens_spent, 12);
    assert_eq!(f.service.list_stock(f.activity_stand).await.unwrap()[0].quantity, 0);
}

#[tokio::test]
async fn parents_list_their_childrens_transactions() {
    let f = fair(LedgerConfig::default());
    let transfer = f.service.create_transfer(f.parent, f.child, 30, Some(f.kermesse)).await.unwrap();
    let purchase = f
        .service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 1)
        .await
        .unwrap();
    // A stranger's purchase is not listed.
    let other = f.enrol_student(10);
    f.service
        .create_purchase(other, f.kermesse, f.food_stand, f.crepe, 1)
        .await
        .unwrap();

    let listed = f.service.list_children_transactions(f.parent, Some(f.kermesse)).await.unwrap();
    let ids: Vec<TransactionId> = listed.iter().map(|tx| tx.id).collect();
    assert_eq!(ids, vec![transfer.id, purchase.transaction.id]);

    let other_fair = KermesseId::new();
    f.store.add_kermesse(Kermesse::new(other_fair, "Autumn fair")).unwrap();
    assert!(f.service.list_children_transactions(f.parent, Some(other_fair)).await.unwrap().is_empty());

    let err = f.service.list_children_transactions(f.child, None).await.unwrap_err();
    assert_eq!(err, LedgerError::InvalidUserRole("student".to_string()));
}

// Notifications

#[tokio::test]
async fn notifications_follow_commits_only() {
    let f = fair(LedgerConfig::default());
    let subscription = f.bus.subscribe();

    let outcome = f
        .service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 2)
        .await
        .unwrap();
    f.service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 50)
        .await
        .unwrap_err();
    f.service.create_transfer(f.parent, f.child, 5, None).await.unwrap();

    let envelopes = subscription.drain();
    assert_eq!(envelopes.len(), 2);

    assert_eq!(envelopes[0].event_type(), "ledger.purchase.completed");
    assert_eq!(envelopes[0].sequence_number(), 0);
    assert_eq!(envelopes[0].kermesse_id(), Some(f.kermesse));
    match envelopes[0].payload() {
        LedgerEvent::PurchaseCompleted(event) => {
            assert_eq!(event.transaction_id, outcome.transaction.id);
            assert_eq!(event.quantity, 2);
            assert_eq!(event.total_cost, 10);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(envelopes[1].event_type(), "ledger.transfer.completed");
    assert_eq!(envelopes[1].sequence_number(), 1);
    assert_eq!(envelopes[1].kermesse_id(), None);
}

// Chat

#[tokio::test]
async fn stand_chat_is_limited_to_holders_and_organizers() {
    let f = fair(LedgerConfig::default());
    let room = f.service.chat_rooms().join(f.food_stand).unwrap();

    let message = |sender: UserId, body: &str| NewChatMessage {
        kermesse_id: f.kermesse,
        stand_id: f.food_stand,
        sender_id: sender,
        body: body.to_string(),
    };

    let saved = f.service.save_message(message(f.food_holder, "  Crepes are ready  ")).await.unwrap();
    assert_eq!(saved.body, "Crepes are ready");
    f.service.save_message(message(f.organizer, "Closing at six")).await.unwrap();

    let err = f.service.save_message(message(f.parent, "Hello")).await.unwrap_err();
    assert_eq!(err, LedgerError::PermissionDenied(Denial::NotStandHolder));

    let err = f.service.save_message(message(f.activity_holder, "Wrong room")).await.unwrap_err();
    assert_eq!(err, LedgerError::PermissionDenied(Denial::NotStandHolder));

    let history = f
        .service
        .list_messages(f.kermesse, f.food_stand, Pagination::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, saved.id);

    let second_page = f
        .service
        .list_messages(f.kermesse, f.food_stand, Pagination::new(Some(1), Some(1)))
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].body, "Closing at six");

    assert_eq!(room.drain().len(), 2);
}

// Concurrency

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_item_is_sold_exactly_once() {
    let f = fair(LedgerConfig::default());
    let last = f.add_stock(1, 3);
    let buyers = [f.enrol_student(10), f.enrol_student(10)];

    let handles: Vec<_> = buyers
        .iter()
        .map(|&buyer| {
            let service = Arc::clone(&f.service);
            let (kermesse, stand) = (f.kermesse, f.food_stand);
            tokio::spawn(async move { service.create_purchase(buyer, kermesse, stand, last, 1).await })
        })
        .collect();

    let mut sold = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => sold += 1,
            Err(LedgerError::InsufficientStock { available: 0, requested: 1 }) => refused += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((sold, refused), (1, 1));

    let stock = f.service.list_stock(f.food_stand).await.unwrap();
    assert_eq!(stock.iter().find(|item| item.id == last).unwrap().quantity, 0);
    let mut balances = Vec::new();
    for buyer in buyers {
        balances.push(f.service.get_balance(buyer).await.unwrap());
    }
    balances.sort();
    assert_eq!(balances, vec![7, 10]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crowded_stand_never_oversells() {
    // Each buyer can lose at most one race per competing sale.
    let f = fair(LedgerConfig {
        max_conflict_retries: 20,
        ..LedgerConfig::default()
    });
    let lemonade = f.add_stock(10, 5);
    let buyers: Vec<UserId> = (0..20).map(|_| f.enrol_student(5)).collect();

    let handles: Vec<_> = buyers
        .iter()
        .map(|&buyer| {
            let service = Arc::clone(&f.service);
            let (kermesse, stand) = (f.kermesse, f.food_stand);
            tokio::spawn(async move { service.create_purchase(buyer, kermesse, stand, lemonade, 1).await })
        })
        .collect();

    let mut sold = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => sold += 1,
            Err(LedgerError::InsufficientStock { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(sold, 10);

    let stock = f.service.list_stock(f.food_stand).await.unwrap();
    assert_eq!(stock.iter().find(|item| item.id == lemonade).unwrap().quantity, 0);
    assert_eq!(f.service.get_stand(f.food_stand).await.unwrap().tokens_spent, 50);

    let mut spent = 0;
    for buyer in &buyers {
        spent += 5 - f.service.get_balance(*buyer).await.unwrap();
    }
    assert_eq!(spent, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_spending_never_overdraws() {
    let f = fair(LedgerConfig {
        max_conflict_retries: 20,
        ..LedgerConfig::default()
    });
    // 20 tokens buy at most four 5-token crepes.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&f.service);
            let (child, kermesse, stand, crepe) = (f.child, f.kermesse, f.food_stand, f.crepe);
            tokio::spawn(async move { service.create_purchase(child, kermesse, stand, crepe, 1).await })
        })
        .collect();

    let mut sold = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => sold += 1,
            Err(LedgerError::InsufficientTokens { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(sold, 4);
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 0);
    assert_eq!(f.service.list_stock(f.food_stand).await.unwrap()[0].quantity, 6);
}

// Timeouts

/// Store whose units of work take a while to open.
struct SlowStore {
    inner: InMemoryLedgerStore,
    delay: Duration,
}

#[async_trait]
impl LedgerStore for SlowStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        tokio::time::sleep(self.delay).await;
        self.inner.begin().await
    }
}

#[tokio::test]
async fn slow_operations_time_out_without_effects() {
    let f = fair(LedgerConfig::default());
    let config = LedgerConfig {
        operation_timeout_ms: Some(20),
        ..LedgerConfig::default()
    };
    let slow: Service<SlowStore> = LedgerService::new(
        SlowStore {
            inner: f.store.clone(),
            delay: Duration::from_millis(500),
        },
        f.bus.clone(),
        config,
    );

    let err = slow
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 1)
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::Timeout);
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 20);
    assert_eq!(f.service.list_stock(f.food_stand).await.unwrap()[0].quantity, 10);
}

// Aborted commits

#[derive(Debug, Clone, Copy)]
enum CommitFault {
    /// Commit hangs longer than any reasonable operation timeout.
    Stall(Duration),
    /// Commit fails as if the connection dropped.
    ConnectionLost,
}

/// Store whose units run normally but misbehave at commit time, after the
/// workflow has buffered all of its writes.
struct FaultyCommitStore {
    inner: InMemoryLedgerStore,
    fault: CommitFault,
    reached_commit: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerStore for FaultyCommitStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(FaultyCommitUnit {
            inner: self.inner.begin().await?,
            fault: self.fault,
            reached_commit: self.reached_commit.clone(),
        }))
    }
}

struct FaultyCommitUnit {
    inner: Box<dyn UnitOfWork>,
    fault: CommitFault,
    reached_commit: Arc<AtomicBool>,
}

#[async_trait]
impl AccountStore for FaultyCommitUnit {
    async fn account(&mut self, user_id: UserId) -> LedgerResult<Account> {
        self.inner.account(user_id).await
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> LedgerResult<i64> {
        self.inner.adjust_balance(user_id, delta).await
    }

    async fn add_points(&mut self, student_id: UserId, points: i64) -> LedgerResult<i64> {
        self.inner.add_points(student_id, points).await
    }

    async fn children(&mut self, parent_id: UserId) -> LedgerResult<Vec<Account>> {
        self.inner.children(parent_id).await
    }
}

#[async_trait]
impl InventoryStore for FaultyCommitUnit {
    async fn stand(&mut self, stand_id: StandId) -> LedgerResult<Stand> {
        self.inner.stand(stand_id).await
    }

    async fn stock_item(&mut self, stand_id: StandId, stock_id: StockId) -> LedgerResult<StockItem> {
        self.inner.stock_item(stand_id, stock_id).await
    }

    async fn stock_items(&mut self, stand_id: StandId) -> LedgerResult<Vec<StockItem>> {
        self.inner.stock_items(stand_id).await
    }

    async fn adjust_stock(&mut self, stand_id: StandId, stock_id: StockId, delta: i64) -> LedgerResult<i64> {
        self.inner.adjust_stock(stand_id, stock_id, delta).await
    }

    async fn record_stand_revenue(&mut self, stand_id: StandId, amount: i64) -> LedgerResult<i64> {
        self.inner.record_stand_revenue(stand_id, amount).await
    }

    async fn record_points_given(&mut self, stand_id: StandId, points: i64) -> LedgerResult<i64> {
        self.inner.record_points_given(stand_id, points).await
    }
}

#[async_trait]
impl KermesseStore for FaultyCommitUnit {
    async fn kermesse(&mut self, kermesse_id: KermesseId) -> LedgerResult<Kermesse> {
        self.inner.kermesse(kermesse_id).await
    }

    async fn add_tokens_sold(&mut self, kermesse_id: KermesseId, amount: i64) -> LedgerResult<i64> {
        self.inner.add_tokens_sold(kermesse_id, amount).await
    }
}

#[async_trait]
impl TransactionLedger for FaultyCommitUnit {
    async fn record(&mut self, transaction: NewTransaction, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        self.inner.record(transaction, now).await
    }

    async fn transaction(&mut self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction> {
        self.inner.transaction(transaction_id).await
    }

    async fn set_status(
        &mut self,
        transaction_id: TransactionId,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<TokenTransaction> {
        self.inner.set_status(transaction_id, status, now).await
    }

    async fn list_involving(
        &mut self,
        parties: &[Party],
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<Vec<TokenTransaction>> {
        self.inner.list_involving(parties, kermesse_id).await
    }
}

#[async_trait]
impl ParticipationGuard for FaultyCommitUnit {
    async fn is_participant(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.inner.is_participant(kermesse_id, user_id).await
    }

    async fn is_organizer(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.inner.is_organizer(kermesse_id, user_id).await
    }

    async fn is_stand_holder(&mut self, user_id: UserId, stand_id: StandId) -> LedgerResult<bool> {
        self.inner.is_stand_holder(user_id, stand_id).await
    }
}

#[async_trait]
impl ChatStore for FaultyCommitUnit {
    async fn save_message(&mut self, message: NewChatMessage, now: DateTime<Utc>) -> LedgerResult<ChatMessage> {
        self.inner.save_message(message, now).await
    }

    async fn list_messages(
        &mut self,
        kermesse_id: KermesseId,
        stand_id: StandId,
        page: Pagination,
    ) -> LedgerResult<Vec<ChatMessage>> {
        self.inner.list_messages(kermesse_id, stand_id, page).await
    }
}

#[async_trait]
impl UnitOfWork for FaultyCommitUnit {
    async fn commit(&mut self) -> LedgerResult<()> {
        self.reached_commit.store(true, Ordering::SeqCst);
        match self.fault {
            CommitFault::Stall(delay) => {
                tokio::time::sleep(delay).await;
                self.inner.commit().await
            }
            CommitFault::ConnectionLost => Err(LedgerError::Storage("connection reset by peer".to_string())),
        }
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        self.inner.rollback().await
    }
}

fn faulty_service(f: &Fair, fault: CommitFault, config: LedgerConfig) -> (Service<FaultyCommitStore>, Arc<AtomicBool>) {
    let reached_commit = Arc::new(AtomicBool::new(false));
    let service = LedgerService::new(
        FaultyCommitStore {
            inner: f.store.clone(),
            fault,
            reached_commit: reached_commit.clone(),
        },
        f.bus.clone(),
        config,
    );
    (service, reached_commit)
}

async fn assert_purchase_left_no_trace(f: &Fair) {
    assert_eq!(f.service.get_balance(f.child).await.unwrap(), 20);
    assert_eq!(f.service.list_stock(f.food_stand).await.unwrap()[0].quantity, 10);
    assert_eq!(f.service.get_stand(f.food_stand).await.unwrap().tokens_spent, 0);
    assert!(f.service.list_children_transactions(f.parent, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_during_commit_discards_buffered_purchase() {
    let f = fair(LedgerConfig::default());
    let subscription = f.bus.subscribe();
    let config = LedgerConfig {
        operation_timeout_ms: Some(50),
        ..LedgerConfig::default()
    };
    let (stalled, reached_commit) = faulty_service(&f, CommitFault::Stall(Duration::from_secs(5)), config);

    let err = stalled
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 3)
        .await
        .unwrap_err();

    assert_eq!(err, LedgerError::Timeout);
    assert!(reached_commit.load(Ordering::SeqCst));
    assert_purchase_left_no_trace(&f).await;
    assert!(subscription.try_recv().is_err());
}

#[tokio::test]
async fn storage_failure_at_commit_aborts_the_whole_purchase() {
    let f = fair(LedgerConfig::default());
    let subscription = f.bus.subscribe();
    let (broken, reached_commit) = faulty_service(&f, CommitFault::ConnectionLost, LedgerConfig::default());

    let err = broken
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 3)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Storage(_)));
    assert!(!err.is_retryable());
    assert!(reached_commit.load(Ordering::SeqCst));
    assert_purchase_left_no_trace(&f).await;
    assert!(subscription.try_recv().is_err());

    // The store itself is still healthy.
    f.service
        .create_purchase(f.child, f.kermesse, f.food_stand, f.crepe, 3)
        .await
        .unwrap();
    assert_eq!(f.service.get_stand(f.food_stand).await.unwrap().tokens_spent, 15);
}

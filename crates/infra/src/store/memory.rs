//! In-memory ledger store with optimistic concurrency control.
//!
//! Every row carries a version. A unit of work copies the rows it touches
//! into a private working set, remembering the version it saw, and buffers
//! its writes there. `commit()` takes the write lock, checks that every row
//! it read is still at the version it saw and only then installs the writes
//! (bumping versions). Otherwise it fails with `Conflict` and nothing is
//! applied. Interleavings that would oversell stock or overdraw a balance
//! therefore cannot both commit.
//!
//! Rosters and stand ownership are seeded, never written by the ledger, so
//! they are read straight from the shared tables.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kermesse_core::{
    ExpectedVersion, KermesseId, LedgerError, LedgerResult, MessageId, Resource, StandId, StockId,
    TransactionId, UserId,
};
use kermesse_ledger::{
    Account, ChatMessage, Kermesse, NewChatMessage, NewTransaction, Party, Role, Stand, StockItem,
    TokenTransaction, TransactionStatus,
};

use super::{
    AccountStore, ChatStore, InventoryStore, KermesseStore, LedgerStore, Pagination,
    ParticipationGuard, TransactionLedger, UnitOfWork,
};

#[derive(Debug, Clone)]
struct Row<V> {
    version: u64,
    value: V,
}

type Table<K, V> = HashMap<K, Row<V>>;

#[derive(Debug, Default)]
struct Tables {
    accounts: Table<UserId, Account>,
    kermesses: Table<KermesseId, Kermesse>,
    stands: Table<StandId, Stand>,
    stock: Table<StockId, StockItem>,
    transactions: Table<TransactionId, TokenTransaction>,
    participants: HashMap<KermesseId, HashSet<UserId>>,
    organizers: HashMap<KermesseId, HashSet<UserId>>,
    messages: Vec<ChatMessage>,
}

fn poisoned() -> LedgerError {
    LedgerError::storage("ledger store lock poisoned")
}

fn read(shared: &RwLock<Tables>) -> LedgerResult<RwLockReadGuard<'_, Tables>> {
    shared.read().map_err(|_| poisoned())
}

fn insert_row<K: Eq + Hash, V>(table: &mut Table<K, V>, key: K, value: V) {
    match table.entry(key) {
        Entry::Occupied(mut row) => {
            let row = row.get_mut();
            row.version += 1;
            row.value = value;
        }
        Entry::Vacant(slot) => {
            slot.insert(Row { version: 1, value });
        }
    }
}

/// Shared, thread-safe ledger state.
///
/// Cloning is cheap and yields a handle to the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding: the profile/kermesse CRUD that lives outside the ledger.

    pub fn add_account(&self, account: Account) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        insert_row(&mut tables.accounts, account.user_id, account);
        Ok(())
    }

    pub fn add_kermesse(&self, kermesse: Kermesse) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        insert_row(&mut tables.kermesses, kermesse.id, kermesse);
        Ok(())
    }

    pub fn add_participant(&self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if !tables.kermesses.contains_key(&kermesse_id) {
            return Err(LedgerError::NotFound(Resource::Kermesse(kermesse_id)));
        }
        tables.participants.entry(kermesse_id).or_default().insert(user_id);
        Ok(())
    }

    pub fn add_organizer(&self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if !tables.kermesses.contains_key(&kermesse_id) {
            return Err(LedgerError::NotFound(Resource::Kermesse(kermesse_id)));
        }
        tables.organizers.entry(kermesse_id).or_default().insert(user_id);
        Ok(())
    }

    pub fn add_stand(&self, stand: Stand) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if !tables.kermesses.contains_key(&stand.kermesse_id) {
            return Err(LedgerError::NotFound(Resource::Kermesse(stand.kermesse_id)));
        }
        insert_row(&mut tables.stands, stand.id, stand);
        Ok(())
    }

    pub fn add_stock_item(&self, item: StockItem) -> LedgerResult<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if !tables.stands.contains_key(&item.stand_id) {
            return Err(LedgerError::NotFound(Resource::Stand(item.stand_id)));
        }
        insert_row(&mut tables.stock, item.id, item);
        Ok(())
    }

    /// Open a unit of work without boxing it.
    pub fn unit_of_work(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            shared: Arc::clone(&self.tables),
            accounts: Working::default(),
            kermesses: Working::default(),
            stands: Working::default(),
            stock: Working::default(),
            transactions: Working::default(),
            messages: Vec::new(),
            finished: false,
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(self.unit_of_work()))
    }
}

/// A row as seen (and possibly modified) by one unit of work.
#[derive(Debug)]
struct Slot<V> {
    /// Version when first read; `0` if the row did not exist.
    read_version: u64,
    value: Option<V>,
    dirty: bool,
}

impl<V> Slot<V> {
    fn get(&self, missing: Resource) -> LedgerResult<&V> {
        self.value.as_ref().ok_or(LedgerError::NotFound(missing))
    }

    fn edit(&mut self, missing: Resource) -> LedgerResult<&mut V> {
        let value = self.value.as_mut().ok_or(LedgerError::NotFound(missing))?;
        self.dirty = true;
        Ok(value)
    }
}

#[derive(Debug)]
struct Working<K, V> {
    slots: HashMap<K, Slot<V>>,
}

impl<K, V> Default for Working<K, V> {
    fn default() -> Self {
        Self { slots: HashMap::new() }
    }
}

impl<K, V> Working<K, V>
where
    K: Copy + Eq + Hash,
    V: Clone,
{
    fn slot(&mut self, table: &Table<K, V>, key: K) -> &mut Slot<V> {
        match self.slots.entry(key) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let seen = match table.get(&key) {
                    Some(row) => Slot {
                        read_version: row.version,
                        value: Some(row.value.clone()),
                        dirty: false,
                    },
                    None => Slot {
                        read_version: 0,
                        value: None,
                        dirty: false,
                    },
                };
                slot.insert(seen)
            }
        }
    }

    fn create(&mut self, key: K, value: V) {
        self.slots.insert(
            key,
            Slot {
                read_version: 0,
                value: Some(value),
                dirty: true,
            },
        );
    }

    fn validate(&self, table: &Table<K, V>) -> LedgerResult<()> {
        for (key, slot) in &self.slots {
            let current = table.get(key).map(|row| row.version).unwrap_or(0);
            ExpectedVersion::Exact(slot.read_version).check(current)?;
        }
        Ok(())
    }

    fn apply(&mut self, table: &mut Table<K, V>) {
        for (key, slot) in self.slots.drain() {
            if !slot.dirty {
                continue;
            }
            if let Some(value) = slot.value {
                table.insert(
                    key,
                    Row {
                        version: slot.read_version + 1,
                        value,
                    },
                );
            }
        }
    }
}

/// Unit of work over an [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    shared: Arc<RwLock<Tables>>,
    accounts: Working<UserId, Account>,
    kermesses: Working<KermesseId, Kermesse>,
    stands: Working<StandId, Stand>,
    stock: Working<StockId, StockItem>,
    transactions: Working<TransactionId, TokenTransaction>,
    messages: Vec<ChatMessage>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    fn ensure_open(&self) -> LedgerResult<()> {
        if self.finished {
            return Err(LedgerError::storage("unit of work already finished"));
        }
        Ok(())
    }

    /// Whether the unit has buffered any write.
    pub fn is_dirty(&self) -> bool {
        fn any<K, V>(working: &Working<K, V>) -> bool {
            working.slots.values().any(|slot| slot.dirty)
        }
        any(&self.accounts)
            || any(&self.kermesses)
            || any(&self.stands)
            || any(&self.stock)
            || any(&self.transactions)
            || !self.messages.is_empty()
    }
}

#[async_trait]
impl AccountStore for InMemoryUnitOfWork {
    async fn account(&mut self, user_id: UserId) -> LedgerResult<Account> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.accounts.slot(&tables.accounts, user_id);
        slot.get(Resource::User(user_id)).cloned()
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> LedgerResult<i64> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.accounts.slot(&tables.accounts, user_id);
        // Validate on a copy so a refused delta leaves the slot clean.
        let mut account = slot.get(Resource::User(user_id))?.clone();
        let balance = account.adjust_tokens(delta)?;
        *slot.edit(Resource::User(user_id))? = account;
        Ok(balance)
    }

    async fn add_points(&mut self, student_id: UserId, points: i64) -> LedgerResult<i64> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.accounts.slot(&tables.accounts, student_id);
        let mut account = slot.get(Resource::User(student_id))?.clone();
        let total = account.add_points(points)?;
        *slot.edit(Resource::User(student_id))? = account;
        Ok(total)
    }

    async fn children(&mut self, parent_id: UserId) -> LedgerResult<Vec<Account>> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let mut children: Vec<Account> = tables
            .accounts
            .values()
            .filter(|row| row.value.parent_id() == Some(parent_id))
            .map(|row| row.value.clone())
            .collect();
        children.sort_by_key(|account| account.user_id);
        Ok(children)
    }
}

#[async_trait]
impl InventoryStore for InMemoryUnitOfWork {
    async fn stand(&mut self, stand_id: StandId) -> LedgerResult<Stand> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.stands.slot(&tables.stands, stand_id);
        slot.get(Resource::Stand(stand_id)).cloned()
    }

    async fn stock_item(&mut self, stand_id: StandId, stock_id: StockId) -> LedgerResult<StockItem> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.stock.slot(&tables.stock, stock_id);
        let item = slot.get(Resource::StockItem(stock_id))?;
        if item.stand_id != stand_id {
            return Err(LedgerError::NotFound(Resource::StockItem(stock_id)));
        }
        Ok(item.clone())
    }

    async fn stock_items(&mut self, stand_id: StandId) -> LedgerResult<Vec<StockItem>> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        if !tables.stands.contains_key(&stand_id) {
            return Err(LedgerError::NotFound(Resource::Stand(stand_id)));
        }
        let mut items: Vec<StockItem> = tables
            .stock
            .values()
            .filter(|row| row.value.stand_id == stand_id)
            .map(|row| row.value.clone())
            .collect();
        items.sort_by(|a, b| a.item_name.cmp(&b.item_name));
        Ok(items)
    }

    async fn adjust_stock(&mut self, stand_id: StandId, stock_id: StockId, delta: i64) -> LedgerResult<i64> {
        let kind = self.stand(stand_id).await?.kind;
        let current = self.stock_item(stand_id, stock_id).await?;

        let mut item = current;
        let quantity = item.adjust(kind, delta)?;
        if kind.tracks_stock() {
            let tables = read(&self.shared)?;
            *self.stock.slot(&tables.stock, stock_id).edit(Resource::StockItem(stock_id))? = item;
        }
        Ok(quantity)
    }

    async fn record_stand_revenue(&mut self, stand_id: StandId, amount: i64) -> LedgerResult<i64> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.stands.slot(&tables.stands, stand_id);
        let mut stand = slot.get(Resource::Stand(stand_id))?.clone();
        let total = stand.record_spend(amount)?;
        *slot.edit(Resource::Stand(stand_id))? = stand;
        Ok(total)
    }

    async fn record_points_given(&mut self, stand_id: StandId, points: i64) -> LedgerResult<i64> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.stands.slot(&tables.stands, stand_id);
        let mut stand = slot.get(Resource::Stand(stand_id))?.clone();
        let total = stand.record_points(points)?;
        *slot.edit(Resource::Stand(stand_id))? = stand;
        Ok(total)
    }
}

#[async_trait]
impl KermesseStore for InMemoryUnitOfWork {
    async fn kermesse(&mut self, kermesse_id: KermesseId) -> LedgerResult<Kermesse> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.kermesses.slot(&tables.kermesses, kermesse_id);
        slot.get(Resource::Kermesse(kermesse_id)).cloned()
    }

    async fn add_tokens_sold(&mut self, kermesse_id: KermesseId, amount: i64) -> LedgerResult<i64> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.kermesses.slot(&tables.kermesses, kermesse_id);
        let mut kermesse = slot.get(Resource::Kermesse(kermesse_id))?.clone();
        let total = kermesse.record_tokens_sold(amount)?;
        *slot.edit(Resource::Kermesse(kermesse_id))? = kermesse;
        Ok(total)
    }
}

#[async_trait]
impl TransactionLedger for InMemoryUnitOfWork {
    async fn record(&mut self, transaction: NewTransaction, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        self.ensure_open()?;
        let recorded = transaction.into_recorded(TransactionId::new(), now)?;
        self.transactions.create(recorded.id, recorded.clone());
        Ok(recorded)
    }

    async fn transaction(&mut self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.transactions.slot(&tables.transactions, transaction_id);
        slot.get(Resource::Transaction(transaction_id)).cloned()
    }

    async fn set_status(
        &mut self,
        transaction_id: TransactionId,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<TokenTransaction> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let slot = self.transactions.slot(&tables.transactions, transaction_id);
        let mut transaction = slot.get(Resource::Transaction(transaction_id))?.clone();
        transaction.transition(status, now)?;
        *slot.edit(Resource::Transaction(transaction_id))? = transaction.clone();
        Ok(transaction)
    }

    async fn list_involving(
        &mut self,
        parties: &[Party],
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<Vec<TokenTransaction>> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        let mut found: Vec<TokenTransaction> = tables
            .transactions
            .values()
            .map(|row| &row.value)
            .filter(|tx| parties.iter().any(|party| tx.involves(party)))
            .filter(|tx| kermesse_id.is_none() || tx.kermesse_id == kermesse_id)
            .cloned()
            .collect();
        found.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(found)
    }
}

#[async_trait]
impl ParticipationGuard for InMemoryUnitOfWork {
    async fn is_participant(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        if !tables.kermesses.contains_key(&kermesse_id) {
            return Err(LedgerError::NotFound(Resource::Kermesse(kermesse_id)));
        }
        let roster = match tables.accounts.get(&user_id).map(|row| row.value.role()) {
            Some(Role::Organizer) => &tables.organizers,
            Some(_) => &tables.participants,
            None => return Ok(false),
        };
        Ok(roster
            .get(&kermesse_id)
            .is_some_and(|members| members.contains(&user_id)))
    }

    async fn is_organizer(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        if !tables.kermesses.contains_key(&kermesse_id) {
            return Err(LedgerError::NotFound(Resource::Kermesse(kermesse_id)));
        }
        let is_organizer = tables
            .accounts
            .get(&user_id)
            .is_some_and(|row| row.value.role() == Role::Organizer);
        Ok(is_organizer
            && tables
                .organizers
                .get(&kermesse_id)
                .is_some_and(|members| members.contains(&user_id)))
    }

    async fn is_stand_holder(&mut self, user_id: UserId, stand_id: StandId) -> LedgerResult<bool> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        if !tables.stands.contains_key(&stand_id) {
            return Err(LedgerError::NotFound(Resource::Stand(stand_id)));
        }
        Ok(tables
            .accounts
            .get(&user_id)
            .is_some_and(|row| row.value.stand_id() == Some(stand_id)))
    }
}

#[async_trait]
impl ChatStore for InMemoryUnitOfWork {
    async fn save_message(&mut self, message: NewChatMessage, now: DateTime<Utc>) -> LedgerResult<ChatMessage> {
        self.ensure_open()?;
        let saved = message.into_message(MessageId::new(), now)?;
        self.messages.push(saved.clone());
        Ok(saved)
    }

    async fn list_messages(
        &mut self,
        kermesse_id: KermesseId,
        stand_id: StandId,
        page: Pagination,
    ) -> LedgerResult<Vec<ChatMessage>> {
        self.ensure_open()?;
        let tables = read(&self.shared)?;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.kermesse_id == kermesse_id && m.stand_id == stand_id)
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn commit(&mut self) -> LedgerResult<()> {
        self.ensure_open()?;
        self.finished = true;

        let mut guard = self.shared.write().map_err(|_| poisoned())?;
        let tables = &mut *guard;

        self.accounts.validate(&tables.accounts)?;
        self.kermesses.validate(&tables.kermesses)?;
        self.stands.validate(&tables.stands)?;
        self.stock.validate(&tables.stock)?;
        self.transactions.validate(&tables.transactions)?;

        self.accounts.apply(&mut tables.accounts);
        self.kermesses.apply(&mut tables.kermesses);
        self.stands.apply(&mut tables.stands);
        self.stock.apply(&mut tables.stock);
        self.transactions.apply(&mut tables.transactions);
        tables.messages.append(&mut self.messages);
        Ok(())
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        self.ensure_open()?;
        self.finished = true;
        self.accounts.slots.clear();
        self.kermesses.slots.clear();
        self.stands.slots.clear();
        self.stock.slots.clear();
        self.transactions.slots.clear();
        self.messages.clear();
        Ok(())
    }
}

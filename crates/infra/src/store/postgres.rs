//! Postgres-backed ledger store.
//!
//! One SQL transaction per unit of work. Every row a workflow reads before
//! writing is loaded with `SELECT ... FOR UPDATE`, so concurrent units that
//! touch the same balance or stock item are serialized by the database and a
//! check made on a read still holds at commit. Dropping a unit without
//! committing rolls the SQL transaction back.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `LedgerError` |
//! |------------|---------------|---------------|
//! | serialization failure | `40001` | `Conflict` |
//! | deadlock detected | `40P01` | `Conflict` |
//! | unique violation | `23505` | `Conflict` |
//! | check violation | `23514` | `InvalidTransaction` |
//! | anything else | any | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use kermesse_core::{
    KermesseId, LedgerError, LedgerResult, MessageId, Resource, StandId, StockId, TransactionId,
    UserId,
};
use kermesse_ledger::{
    Account, ChatMessage, Kermesse, NewChatMessage, NewTransaction, Party, Profile, Role, Stand,
    StandKind, StockItem, TokenTransaction, TransactionKind, TransactionStatus,
};

use super::{
    AccountStore, ChatStore, InventoryStore, KermesseStore, LedgerStore, Pagination,
    ParticipationGuard, TransactionLedger, UnitOfWork,
};

/// Tables used by the ledger. Idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        user_id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        tokens BIGINT NOT NULL DEFAULT 0 CHECK (tokens >= 0),
        points BIGINT NOT NULL DEFAULT 0 CHECK (points >= 0),
        parent_id UUID NULL,
        stand_id UUID NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kermesses (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        tokens_sold BIGINT NOT NULL DEFAULT 0 CHECK (tokens_sold >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kermesse_participants (
        kermesse_id UUID NOT NULL REFERENCES kermesses (id),
        user_id UUID NOT NULL,
        PRIMARY KEY (kermesse_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kermesse_organizers (
        kermesse_id UUID NOT NULL REFERENCES kermesses (id),
        user_id UUID NOT NULL,
        PRIMARY KEY (kermesse_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stands (
        id UUID PRIMARY KEY,
        kermesse_id UUID NOT NULL REFERENCES kermesses (id),
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        tokens_spent BIGINT NOT NULL DEFAULT 0 CHECK (tokens_spent >= 0),
        points_given BIGINT NOT NULL DEFAULT 0 CHECK (points_given >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stock_items (
        id UUID PRIMARY KEY,
        stand_id UUID NOT NULL REFERENCES stands (id),
        item_name TEXT NOT NULL,
        quantity BIGINT NOT NULL CHECK (quantity >= 0),
        token_cost BIGINT NOT NULL CHECK (token_cost > 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS token_transactions (
        id UUID PRIMARY KEY,
        kermesse_id UUID NULL,
        from_type TEXT NOT NULL,
        from_id UUID NOT NULL,
        to_type TEXT NOT NULL,
        to_id UUID NOT NULL,
        amount BIGINT NOT NULL CHECK (amount > 0),
        kind TEXT NOT NULL,
        stand_id UUID NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CHECK (from_id <> to_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS token_transactions_parties
        ON token_transactions (from_id, to_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_messages (
        id UUID PRIMARY KEY,
        kermesse_id UUID NOT NULL,
        stand_id UUID NOT NULL,
        sender_id UUID NOT NULL,
        body TEXT NOT NULL,
        sent_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const TRANSACTION_COLUMNS: &str = "id, kermesse_id, from_type, from_id, to_type, to_id, amount, kind, stand_id, status, created_at, updated_at";

/// Postgres ledger store. `Send + Sync`; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> LedgerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresUnitOfWork { tx: Some(tx) }))
    }
}

/// Unit of work backed by one SQL transaction.
#[derive(Debug)]
pub struct PostgresUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresUnitOfWork {
    fn conn(&mut self) -> LedgerResult<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| LedgerError::storage("unit of work already finished"))
    }

    async fn lock_account(&mut self, user_id: UserId) -> LedgerResult<Account> {
        let conn = self.conn()?;
        let row = sqlx::query(
            r#"
            SELECT user_id, name, role, tokens, points, parent_id, stand_id
            FROM accounts
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_account", e))?
        .ok_or(LedgerError::NotFound(Resource::User(user_id)))?;

        AccountRow::from_row(&row).map_err(decode_error)?.try_into()
    }

    async fn save_balances(&mut self, account: &Account) -> LedgerResult<()> {
        let (tokens, points) = match account.profile {
            Profile::Student { tokens, points, .. } => (tokens, points),
            Profile::Parent { tokens } => (tokens, 0),
            Profile::StandHolder { .. } | Profile::Organizer => (0, 0),
        };
        let conn = self.conn()?;
        sqlx::query("UPDATE accounts SET tokens = $2, points = $3 WHERE user_id = $1")
            .bind(account.user_id.as_uuid())
            .bind(tokens)
            .bind(points)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_account", e))?;
        Ok(())
    }

    async fn lock_stand(&mut self, stand_id: StandId) -> LedgerResult<Stand> {
        let conn = self.conn()?;
        let row = sqlx::query(
            r#"
            SELECT id, kermesse_id, name, kind, tokens_spent, points_given
            FROM stands
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(stand_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_stand", e))?
        .ok_or(LedgerError::NotFound(Resource::Stand(stand_id)))?;

        StandRow::from_row(&row).map_err(decode_error)?.try_into()
    }

    async fn save_stand(&mut self, stand: &Stand) -> LedgerResult<()> {
        let conn = self.conn()?;
        sqlx::query("UPDATE stands SET tokens_spent = $2, points_given = $3 WHERE id = $1")
            .bind(stand.id.as_uuid())
            .bind(stand.tokens_spent)
            .bind(stand.points_given)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_stand", e))?;
        Ok(())
    }

    async fn lock_transaction(&mut self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM token_transactions WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(transaction_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_transaction", e))?
            .ok_or(LedgerError::NotFound(Resource::Transaction(transaction_id)))?;

        TransactionRow::from_row(&row).map_err(decode_error)?.try_into()
    }

    async fn kermesse_exists(&mut self, kermesse_id: KermesseId) -> LedgerResult<()> {
        let conn = self.conn()?;
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM kermesses WHERE id = $1) AS found")
            .bind(kermesse_id.as_uuid())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("kermesse_exists", e))?;
        let found: bool = row.try_get("found").map_err(decode_error)?;
        if !found {
            return Err(LedgerError::NotFound(Resource::Kermesse(kermesse_id)));
        }
        Ok(())
    }

    async fn role_of(&mut self, user_id: UserId) -> LedgerResult<Option<Role>> {
        let conn = self.conn()?;
        let row = sqlx::query("SELECT role FROM accounts WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_role", e))?;
        match row {
            Some(row) => {
                let role: String = row.try_get("role").map_err(decode_error)?;
                Ok(Some(role.parse()?))
            }
            None => Ok(None),
        }
    }

    async fn on_roster(&mut self, roster: Roster, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        let sql = match roster {
            Roster::Participants => {
                "SELECT EXISTS (SELECT 1 FROM kermesse_participants WHERE kermesse_id = $1 AND user_id = $2) AS found"
            }
            Roster::Organizers => {
                "SELECT EXISTS (SELECT 1 FROM kermesse_organizers WHERE kermesse_id = $1 AND user_id = $2) AS found"
            }
        };
        let conn = self.conn()?;
        let row = sqlx::query(sql)
            .bind(kermesse_id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("roster_lookup", e))?;
        row.try_get("found").map_err(decode_error)
    }
}

#[derive(Debug, Clone, Copy)]
enum Roster {
    Participants,
    Organizers,
}

#[async_trait]
impl AccountStore for PostgresUnitOfWork {
    async fn account(&mut self, user_id: UserId) -> LedgerResult<Account> {
        self.lock_account(user_id).await
    }

    async fn adjust_balance(&mut self, user_id: UserId, delta: i64) -> LedgerResult<i64> {
        let mut account = self.lock_account(user_id).await?;
        let balance = account.adjust_tokens(delta)?;
        self.save_balances(&account).await?;
        Ok(balance)
    }

    async fn add_points(&mut self, student_id: UserId, points: i64) -> LedgerResult<i64> {
        let mut account = self.lock_account(student_id).await?;
        let total = account.add_points(points)?;
        self.save_balances(&account).await?;
        Ok(total)
    }

    async fn children(&mut self, parent_id: UserId) -> LedgerResult<Vec<Account>> {
        let conn = self.conn()?;
        let rows = sqlx::query(
            r#"
            SELECT user_id, name, role, tokens, points, parent_id, stand_id
            FROM accounts
            WHERE parent_id = $1 AND role = 'student'
            ORDER BY user_id
            "#,
        )
        .bind(parent_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_children", e))?;

        rows.iter()
            .map(|row| AccountRow::from_row(row).map_err(decode_error)?.try_into())
            .collect()
    }
}

#[async_trait]
impl InventoryStore for PostgresUnitOfWork {
    async fn stand(&mut self, stand_id: StandId) -> LedgerResult<Stand> {
        self.lock_stand(stand_id).await
    }

    async fn stock_item(&mut self, stand_id: StandId, stock_id: StockId) -> LedgerResult<StockItem> {
        let conn = self.conn()?;
        let row = sqlx::query(
            r#"
            SELECT id, stand_id, item_name, quantity, token_cost
            FROM stock_items
            WHERE id = $1 AND stand_id = $2
            FOR UPDATE
            "#,
        )
        .bind(stock_id.as_uuid())
        .bind(stand_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_stock_item", e))?
        .ok_or(LedgerError::NotFound(Resource::StockItem(stock_id)))?;

        Ok(StockItemRow::from_row(&row).map_err(decode_error)?.into())
    }

    async fn stock_items(&mut self, stand_id: StandId) -> LedgerResult<Vec<StockItem>> {
        // Existence check; also takes the stand lock.
        self.lock_stand(stand_id).await?;
        let conn = self.conn()?;
        let rows = sqlx::query(
            r#"
            SELECT id, stand_id, item_name, quantity, token_cost
            FROM stock_items
            WHERE stand_id = $1
            ORDER BY item_name
            "#,
        )
        .bind(stand_id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_stock_items", e))?;

        rows.iter()
            .map(|row| Ok(StockItemRow::from_row(row).map_err(decode_error)?.into()))
            .collect()
    }

    async fn adjust_stock(&mut self, stand_id: StandId, stock_id: StockId, delta: i64) -> LedgerResult<i64> {
        let kind = self.lock_stand(stand_id).await?.kind;
        let mut item = self.stock_item(stand_id, stock_id).await?;
        let quantity = item.adjust(kind, delta)?;
        if kind.tracks_stock() {
            let conn = self.conn()?;
            sqlx::query("UPDATE stock_items SET quantity = $2 WHERE id = $1")
                .bind(stock_id.as_uuid())
                .bind(quantity)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("update_stock_item", e))?;
        }
        Ok(quantity)
    }

    async fn record_stand_revenue(&mut self, stand_id: StandId, amount: i64) -> LedgerResult<i64> {
        let mut stand = self.lock_stand(stand_id).await?;
        let total = stand.record_spend(amount)?;
        self.save_stand(&stand).await?;
        Ok(total)
    }

    async fn record_points_given(&mut self, stand_id: StandId, points: i64) -> LedgerResult<i64> {
        let mut stand = self.lock_stand(stand_id).await?;
        let total = stand.record_points(points)?;
        self.save_stand(&stand).await?;
        Ok(total)
    }
}

#[async_trait]
impl KermesseStore for PostgresUnitOfWork {
    async fn kermesse(&mut self, kermesse_id: KermesseId) -> LedgerResult<Kermesse> {
        let conn = self.conn()?;
        let row = sqlx::query("SELECT id, name, tokens_sold FROM kermesses WHERE id = $1 FOR UPDATE")
            .bind(kermesse_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_kermesse", e))?
            .ok_or(LedgerError::NotFound(Resource::Kermesse(kermesse_id)))?;

        let id: Uuid = row.try_get("id").map_err(decode_error)?;
        let mut kermesse = Kermesse::new(KermesseId::from_uuid(id), row.try_get::<String, _>("name").map_err(decode_error)?);
        kermesse.tokens_sold = row.try_get("tokens_sold").map_err(decode_error)?;
        Ok(kermesse)
    }

    async fn add_tokens_sold(&mut self, kermesse_id: KermesseId, amount: i64) -> LedgerResult<i64> {
        let mut kermesse = self.kermesse(kermesse_id).await?;
        let total = kermesse.record_tokens_sold(amount)?;
        let conn = self.conn()?;
        sqlx::query("UPDATE kermesses SET tokens_sold = $2 WHERE id = $1")
            .bind(kermesse_id.as_uuid())
            .bind(total)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_kermesse", e))?;
        Ok(total)
    }
}

#[async_trait]
impl TransactionLedger for PostgresUnitOfWork {
    #[instrument(
        skip(self, transaction),
        fields(kind = %transaction.kind, amount = transaction.amount, transaction_id = tracing::field::Empty),
        err
    )]
    async fn record(&mut self, transaction: NewTransaction, now: DateTime<Utc>) -> LedgerResult<TokenTransaction> {
        let recorded = transaction.into_recorded(TransactionId::new(), now)?;
        Span::current().record("transaction_id", tracing::field::display(recorded.id));

        let conn = self.conn()?;
        sqlx::query(
            r#"
            INSERT INTO token_transactions (
                id, kermesse_id, from_type, from_id, to_type, to_id,
                amount, kind, stand_id, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(recorded.id.as_uuid())
        .bind(recorded.kermesse_id.map(Uuid::from))
        .bind(recorded.from.type_name())
        .bind(recorded.from.id())
        .bind(recorded.to.type_name())
        .bind(recorded.to.id())
        .bind(recorded.amount)
        .bind(recorded.kind.as_str())
        .bind(recorded.stand_id.map(Uuid::from))
        .bind(recorded.status.as_str())
        .bind(recorded.created_at)
        .bind(recorded.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        Ok(recorded)
    }

    async fn transaction(&mut self, transaction_id: TransactionId) -> LedgerResult<TokenTransaction> {
        self.lock_transaction(transaction_id).await
    }

    async fn set_status(
        &mut self,
        transaction_id: TransactionId,
        status: TransactionStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<TokenTransaction> {
        let mut transaction = self.lock_transaction(transaction_id).await?;
        transaction.transition(status, now)?;

        let conn = self.conn()?;
        sqlx::query("UPDATE token_transactions SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(transaction_id.as_uuid())
            .bind(transaction.status.as_str())
            .bind(transaction.updated_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("update_transaction_status", e))?;
        Ok(transaction)
    }

    async fn list_involving(
        &mut self,
        parties: &[Party],
        kermesse_id: Option<KermesseId>,
    ) -> LedgerResult<Vec<TokenTransaction>> {
        if parties.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = parties.iter().map(Party::id).collect();
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM token_transactions
            WHERE (from_id = ANY($1) OR to_id = ANY($1))
              AND ($2::uuid IS NULL OR kermesse_id = $2)
            ORDER BY created_at ASC, id ASC
            "#
        );
        let conn = self.conn()?;
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .bind(kermesse_id.map(Uuid::from))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("list_transactions", e))?;

        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let tx: TokenTransaction = TransactionRow::from_row(row).map_err(decode_error)?.try_into()?;
            // Ids are matched without their type above.
            if parties.iter().any(|party| tx.involves(party)) {
                found.push(tx);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ParticipationGuard for PostgresUnitOfWork {
    async fn is_participant(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.kermesse_exists(kermesse_id).await?;
        let roster = match self.role_of(user_id).await? {
            Some(Role::Organizer) => Roster::Organizers,
            Some(_) => Roster::Participants,
            None => return Ok(false),
        };
        self.on_roster(roster, kermesse_id, user_id).await
    }

    async fn is_organizer(&mut self, kermesse_id: KermesseId, user_id: UserId) -> LedgerResult<bool> {
        self.kermesse_exists(kermesse_id).await?;
        if self.role_of(user_id).await? != Some(Role::Organizer) {
            return Ok(false);
        }
        self.on_roster(Roster::Organizers, kermesse_id, user_id).await
    }

    async fn is_stand_holder(&mut self, user_id: UserId, stand_id: StandId) -> LedgerResult<bool> {
        let conn = self.conn()?;
        let row = sqlx::query(
            r#"
            SELECT
                EXISTS (SELECT 1 FROM stands WHERE id = $2) AS stand_found,
                EXISTS (
                    SELECT 1 FROM accounts
                    WHERE user_id = $1 AND role = 'stand_holder' AND stand_id = $2
                ) AS holds
            "#,
        )
        .bind(user_id.as_uuid())
        .bind(stand_id.as_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("stand_holder_lookup", e))?;

        let stand_found: bool = row.try_get("stand_found").map_err(decode_error)?;
        if !stand_found {
            return Err(LedgerError::NotFound(Resource::Stand(stand_id)));
        }
        row.try_get("holds").map_err(decode_error)
    }
}

#[async_trait]
impl ChatStore for PostgresUnitOfWork {
    async fn save_message(&mut self, message: NewChatMessage, now: DateTime<Utc>) -> LedgerResult<ChatMessage> {
        let saved = message.into_message(MessageId::new(), now)?;
        let conn = self.conn()?;
        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, kermesse_id, stand_id, sender_id, body, sent_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(saved.id.as_uuid())
        .bind(saved.kermesse_id.as_uuid())
        .bind(saved.stand_id.as_uuid())
        .bind(saved.sender_id.as_uuid())
        .bind(&saved.body)
        .bind(saved.sent_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_chat_message", e))?;
        Ok(saved)
    }

    async fn list_messages(
        &mut self,
        kermesse_id: KermesseId,
        stand_id: StandId,
        page: Pagination,
    ) -> LedgerResult<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let rows = sqlx::query(
            r#"
            SELECT id, kermesse_id, stand_id, sender_id, body, sent_at
            FROM chat_messages
            WHERE kermesse_id = $1 AND stand_id = $2
            ORDER BY sent_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(kermesse_id.as_uuid())
        .bind(stand_id.as_uuid())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("list_chat_messages", e))?;

        rows.iter()
            .map(|row| {
                Ok(ChatMessage {
                    id: MessageId::from_uuid(row.try_get("id").map_err(decode_error)?),
                    kermesse_id: KermesseId::from_uuid(row.try_get("kermesse_id").map_err(decode_error)?),
                    stand_id: StandId::from_uuid(row.try_get("stand_id").map_err(decode_error)?),
                    sender_id: UserId::from_uuid(row.try_get("sender_id").map_err(decode_error)?),
                    body: row.try_get("body").map_err(decode_error)?,
                    sent_at: row.try_get("sent_at").map_err(decode_error)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn commit(&mut self) -> LedgerResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerError::storage("unit of work already finished"))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> LedgerResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| LedgerError::storage("unit of work already finished"))?;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to `LedgerError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, unique_violation
                Some("40001") | Some("40P01") | Some("23505") => LedgerError::Conflict(msg),
                Some("23514") => LedgerError::InvalidTransaction(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => LedgerError::storage(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => LedgerError::storage(format!("connection pool timed out in {operation}")),
        other => LedgerError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_error(err: sqlx::Error) -> LedgerError {
    LedgerError::storage(format!("failed to decode row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    user_id: Uuid,
    name: String,
    role: String,
    tokens: i64,
    points: i64,
    parent_id: Option<Uuid>,
    stand_id: Option<Uuid>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            role: row.try_get("role")?,
            tokens: row.try_get("tokens")?,
            points: row.try_get("points")?,
            parent_id: row.try_get("parent_id")?,
            stand_id: row.try_get("stand_id")?,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = LedgerError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let profile = match row.role.parse::<Role>()? {
            Role::Student => Profile::Student {
                tokens: row.tokens,
                points: row.points,
                parent_id: row.parent_id.map(UserId::from_uuid),
            },
            Role::Parent => Profile::Parent { tokens: row.tokens },
            Role::StandHolder => Profile::StandHolder {
                stand_id: row.stand_id.map(StandId::from_uuid),
            },
            Role::Organizer => Profile::Organizer,
        };
        Ok(Account {
            user_id: UserId::from_uuid(row.user_id),
            name: row.name,
            profile,
        })
    }
}

#[derive(Debug)]
struct StandRow {
    id: Uuid,
    kermesse_id: Uuid,
    name: String,
    kind: String,
    tokens_spent: i64,
    points_given: i64,
}

impl<'r> FromRow<'r, PgRow> for StandRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StandRow {
            id: row.try_get("id")?,
            kermesse_id: row.try_get("kermesse_id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            tokens_spent: row.try_get("tokens_spent")?,
            points_given: row.try_get("points_given")?,
        })
    }
}

impl TryFrom<StandRow> for Stand {
    type Error = LedgerError;

    fn try_from(row: StandRow) -> Result<Self, Self::Error> {
        let kind: StandKind = row.kind.parse()?;
        let mut stand = Stand::new(
            StandId::from_uuid(row.id),
            KermesseId::from_uuid(row.kermesse_id),
            row.name,
            kind,
        );
        stand.tokens_spent = row.tokens_spent;
        stand.points_given = row.points_given;
        Ok(stand)
    }
}

#[derive(Debug)]
struct StockItemRow {
    id: Uuid,
    stand_id: Uuid,
    item_name: String,
    quantity: i64,
    token_cost: i64,
}

impl<'r> FromRow<'r, PgRow> for StockItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StockItemRow {
            id: row.try_get("id")?,
            stand_id: row.try_get("stand_id")?,
            item_name: row.try_get("item_name")?,
            quantity: row.try_get("quantity")?,
            token_cost: row.try_get("token_cost")?,
        })
    }
}

impl From<StockItemRow> for StockItem {
    fn from(row: StockItemRow) -> Self {
        // Constraints on the table already guarantee the invariants `new` checks.
        StockItem {
            id: StockId::from_uuid(row.id),
            stand_id: StandId::from_uuid(row.stand_id),
            item_name: row.item_name,
            quantity: row.quantity,
            token_cost: row.token_cost,
        }
    }
}

#[derive(Debug)]
struct TransactionRow {
    id: Uuid,
    kermesse_id: Option<Uuid>,
    from_type: String,
    from_id: Uuid,
    to_type: String,
    to_id: Uuid,
    amount: i64,
    kind: String,
    stand_id: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for TransactionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TransactionRow {
            id: row.try_get("id")?,
            kermesse_id: row.try_get("kermesse_id")?,
            from_type: row.try_get("from_type")?,
            from_id: row.try_get("from_id")?,
            to_type: row.try_get("to_type")?,
            to_id: row.try_get("to_id")?,
            amount: row.try_get("amount")?,
            kind: row.try_get("kind")?,
            stand_id: row.try_get("stand_id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TransactionRow> for TokenTransaction {
    type Error = LedgerError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(TokenTransaction {
            id: TransactionId::from_uuid(row.id),
            kermesse_id: row.kermesse_id.map(KermesseId::from_uuid),
            from: Party::from_parts(&row.from_type, row.from_id)?,
            to: Party::from_parts(&row.to_type, row.to_id)?,
            amount: row.amount,
            kind: TransactionKind::parse(&row.kind)?,
            stand_id: row.stand_id.map(StandId::from_uuid),
            status: TransactionStatus::parse(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

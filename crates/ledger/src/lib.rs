//! `kermesse-ledger`: the token economy's domain model.
//!
//! Pure types and rules: accounts and their balances, stands and stock, the
//! transaction state machine and the notifications the ledger emits.
//! Storage and orchestration live in `kermesse-infra`.

pub mod account;
pub mod chat;
pub mod event;
pub mod kermesse;
pub mod policy;
pub mod stand;
pub mod transaction;

pub use account::{Account, Profile, Role};
pub use chat::{ChatMessage, NewChatMessage};
pub use event::{
    LedgerEvent, PointsAttributed, PurchaseCompleted, TokensPurchased, TokensTransferred,
    TopUpRejected, TopUpValidated,
};
pub use kermesse::Kermesse;
pub use policy::{LedgerPolicy, TopUpPolicy};
pub use stand::{PointAttributionResult, Stand, StandKind, StockItem};
pub use transaction::{NewTransaction, Party, TokenTransaction, TransactionKind, TransactionStatus};

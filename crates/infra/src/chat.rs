//! Live stand chat rooms.
//!
//! One in-memory bus per stand, created on first join. Messages are persisted
//! by the store before they are broadcast here; a room never holds history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kermesse_core::{LedgerError, LedgerResult, StandId};
use kermesse_events::{EventBus, InMemoryEventBus, Subscription};
use kermesse_ledger::ChatMessage;

type Room = Arc<InMemoryEventBus<ChatMessage>>;

/// Registry of per-stand chat rooms. `Send + Sync`; share it behind an `Arc`
/// or through `LedgerService::chat_rooms`.
#[derive(Debug, Default)]
pub struct ChatRooms {
    rooms: RwLock<HashMap<StandId, Room>>,
}

impl ChatRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a stand's room, opening it if needed.
    pub fn join(&self, stand_id: StandId) -> LedgerResult<Subscription<ChatMessage>> {
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;
        let room = rooms.entry(stand_id).or_default();
        Ok(room.subscribe())
    }

    /// Deliver to everyone in the message's room. Returns the number of live
    /// subscribers that received it (0 if nobody ever joined).
    pub fn broadcast(&self, message: &ChatMessage) -> LedgerResult<usize> {
        let room = {
            let rooms = self.rooms.read().map_err(|_| poisoned())?;
            match rooms.get(&message.stand_id) {
                Some(room) => Arc::clone(room),
                None => return Ok(0),
            }
        };
        room.publish(message.clone())
            .map_err(|e| LedgerError::storage(format!("chat broadcast failed: {e:?}")))?;
        Ok(room.subscriber_count())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().map(|rooms| rooms.len()).unwrap_or(0)
    }

    /// Drop rooms whose subscribers have all gone (as of their last broadcast).
    pub fn close_idle(&self) -> LedgerResult<usize> {
        let mut rooms = self.rooms.write().map_err(|_| poisoned())?;
        let before = rooms.len();
        rooms.retain(|_, room| room.subscriber_count() > 0);
        Ok(before - rooms.len())
    }
}

fn poisoned() -> LedgerError {
    LedgerError::storage("chat room registry lock poisoned")
}

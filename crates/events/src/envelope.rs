use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kermesse_core::KermesseId;

/// Envelope for a published event, carrying routing metadata.
///
/// Notes:
/// - `kermesse_id` scopes the event to one fair when it has one (transfers do not).
/// - `sequence_number` is monotonically increasing per publisher.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    kermesse_id: Option<KermesseId>,
    event_type: String,

    /// Position in the publisher's stream.
    sequence_number: u64,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        kermesse_id: Option<KermesseId>,
        event_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            kermesse_id,
            event_type: event_type.into(),
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn kermesse_id(&self) -> Option<KermesseId> {
        self.kermesse_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

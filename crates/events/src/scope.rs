use kermesse_core::KermesseId;

use crate::EventEnvelope;

/// Messages that belong to (at most) one kermesse.
///
/// Lets subscribers drop traffic for fairs they do not follow.
pub trait KermesseScoped {
    fn kermesse_id(&self) -> Option<KermesseId>;

    fn belongs_to(&self, kermesse_id: KermesseId) -> bool {
        self.kermesse_id() == Some(kermesse_id)
    }
}

impl<E> KermesseScoped for EventEnvelope<E> {
    fn kermesse_id(&self) -> Option<KermesseId> {
        EventEnvelope::kermesse_id(self)
    }
}

//! Persistent broadcast buffer.

use std::collections::HashMap;

use nerfhub_proto::{Envelope, SlotId};

/// Latest persistent message per slot, in first-insertion order.
///
/// Overwriting a slot keeps its original position, so a late joiner
/// receives slots in the order they were first created.
#[derive(Debug, Default)]
pub struct BroadcastBuffer {
    latest: HashMap<SlotId, Envelope>,
    order: Vec<SlotId>,
}

impl BroadcastBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `envelope` as the latest value of its slot.
    ///
    /// Returns `false` for transient envelopes, which are never buffered.
    pub fn update(&mut self, envelope: Envelope) -> bool {
        let Some(slot) = envelope.slot.clone() else {
            return false;
        };
        if self.latest.insert(slot.clone(), envelope).is_none() {
            self.order.push(slot);
        }
        true
    }

    /// Everything a newly connected client should receive, in slot order.
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.order
            .iter()
            .filter_map(|slot| self.latest.get(slot).cloned())
            .collect()
    }

    pub fn get(&self, slot: &SlotId) -> Option<&Envelope> {
        self.latest.get(slot)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use nerfhub_proto::ViewerMessage;

    use super::*;

    fn status(step: u64) -> ViewerMessage {
        ViewerMessage::StatusUpdate {
            eval_res: String::new(),
            step,
        }
    }

    #[test]
    fn transient_messages_are_not_kept() {
        let mut buffer = BroadcastBuffer::new();
        assert!(!buffer.update(Envelope::transient(status(1))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn overwrite_keeps_first_insertion_order() {
        let mut buffer = BroadcastBuffer::new();
        buffer.update(Envelope::persistent("a", status(1)));
        buffer.update(Envelope::persistent("b", status(2)));
        buffer.update(Envelope::persistent("a", status(3)));

        let snapshot = buffer.snapshot();
        assert_eq!(buffer.len(), 2);
        assert_eq!(
            snapshot,
            vec![
                Envelope::persistent("a", status(3)),
                Envelope::persistent("b", status(2)),
            ]
        );
        assert_eq!(
            buffer.get(&SlotId::from("a")).unwrap().message,
            status(3)
        );
    }
}

use crate::protocol::message::ControlMessage;
use crate::protocol::value::PropertyMap;
use crate::utils::clock::SimClock;

/// Mints outgoing samples for one sender direction.
///
/// Sequence numbers start at 0 and advance by one per message, wrapping only
/// on `u64` overflow. Timestamps come from a monotonic-anchored wall clock so
/// they never run backwards within a run.
#[derive(Debug)]
pub struct MessageFactory {
    next_seq: u64,
    clock: SimClock,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::with_clock(SimClock::new())
    }

    pub fn with_clock(clock: SimClock) -> Self {
        Self { next_seq: 0, clock }
    }

    pub fn create_sample(&mut self, payload: PropertyMap) -> ControlMessage {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        ControlMessage::sample(seq, self.clock.now(), payload)
    }

    /// Number of messages created since construction or the last reset.
    pub fn message_count(&self) -> u64 {
        self.next_seq
    }

    pub fn reset(&mut self) {
        self.next_seq = 0;
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

//! Sender-side retransmit handling.
//!
//! A bounded map from NAK'd ranges to their action state. A fresh NAK is
//! delayed (zero delay on unicast means it fires on the next process
//! pass), then the range is retransmitted out-of-band and the entry
//! lingers so duplicate NAKs racing the repair are absorbed rather than
//! amplified.

/// Action states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Delayed,
    Lingering,
}

#[derive(Debug, Clone, Copy)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: i32,
    state: State,
    deadline_ns: i64,
}

/// Outcome of offering a NAK to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakOutcome {
    /// A new retransmit action was scheduled.
    Scheduled,
    /// The range is already delayed or lingering; NAK dropped.
    Duplicate,
    /// No capacity; NAK dropped and counted by the caller.
    CapacityExceeded,
}

/// The bounded retransmit action map for one publication.
pub struct RetransmitHandler {
    actions: Vec<RetransmitAction>,
    max_retransmits: usize,
    delay_ns: i64,
    linger_ns: i64,
}

impl RetransmitHandler {
    pub fn new(max_retransmits: usize, delay_ns: i64, linger_ns: i64) -> Self {
        Self {
            actions: Vec::with_capacity(max_retransmits),
            max_retransmits,
            delay_ns,
            linger_ns,
        }
    }

    /// Offer a received NAK.
    pub fn on_nak(&mut self, term_id: i32, term_offset: i32, length: i32, now_ns: i64) -> NakOutcome {
        if self
            .actions
            .iter()
            .any(|a| a.term_id == term_id && a.term_offset == term_offset)
        {
            return NakOutcome::Duplicate;
        }
        if self.actions.len() >= self.max_retransmits {
            return NakOutcome::CapacityExceeded;
        }

        self.actions.push(RetransmitAction {
            term_id,
            term_offset,
            length,
            state: State::Delayed,
            deadline_ns: now_ns + self.delay_ns,
        });
        NakOutcome::Scheduled
    }

    /// Advance timers; `retransmit(term_id, term_offset, length)` is
    /// invoked for each action whose delay has expired. Returns the number
    /// of retransmissions triggered.
    pub fn process(&mut self, now_ns: i64, mut retransmit: impl FnMut(i32, i32, i32)) -> usize {
        let mut sent = 0;

        for action in &mut self.actions {
            if action.state == State::Delayed && now_ns >= action.deadline_ns {
                retransmit(action.term_id, action.term_offset, action.length);
                action.state = State::Lingering;
                action.deadline_ns = now_ns + self.linger_ns;
                sent += 1;
            }
        }

        self.actions
            .retain(|a| !(a.state == State::Lingering && now_ns >= a.deadline_ns));
        sent
    }

    pub fn pending(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nak_is_delayed_then_retransmitted_then_lingers() {
        let mut handler = RetransmitHandler::new(4, 100, 1000);
        assert_eq!(handler.on_nak(5, 4096, 256, 0), NakOutcome::Scheduled);

        let mut sent = Vec::new();
        assert_eq!(handler.process(50, |t, o, l| sent.push((t, o, l))), 0);
        assert_eq!(handler.process(100, |t, o, l| sent.push((t, o, l))), 1);
        assert_eq!(sent, vec![(5, 4096, 256)]);

        // While lingering, repeats of the same NAK are absorbed.
        assert_eq!(handler.on_nak(5, 4096, 256, 200), NakOutcome::Duplicate);
        assert_eq!(handler.process(500, |_, _, _| panic!("no retransmit")), 0);

        // After linger the range may be NAK'd afresh.
        handler.process(1100, |_, _, _| {});
        assert_eq!(handler.pending(), 0);
        assert_eq!(handler.on_nak(5, 4096, 256, 1200), NakOutcome::Scheduled);
    }

    #[test]
    fn duplicate_nak_while_delayed_is_dropped() {
        let mut handler = RetransmitHandler::new(4, 1000, 1000);
        assert_eq!(handler.on_nak(1, 0, 64, 0), NakOutcome::Scheduled);
        assert_eq!(handler.on_nak(1, 0, 64, 10), NakOutcome::Duplicate);
        assert_eq!(handler.pending(), 1);
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let mut handler = RetransmitHandler::new(2, 0, 1000);
        assert_eq!(handler.on_nak(1, 0, 64, 0), NakOutcome::Scheduled);
        assert_eq!(handler.on_nak(1, 64, 64, 0), NakOutcome::Scheduled);
        assert_eq!(handler.on_nak(1, 128, 64, 0), NakOutcome::CapacityExceeded);
    }

    #[test]
    fn zero_delay_fires_on_next_process() {
        let mut handler = RetransmitHandler::new(4, 0, 100);
        handler.on_nak(2, 32, 96, 500);
        let mut sent = 0;
        handler.process(500, |_, _, _| sent += 1);
        assert_eq!(sent, 1);
    }
}

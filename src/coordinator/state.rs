//! Coordinator state guarded by the single session lock
//!
//! Every method here runs with the lock held and returns the observability
//! events it produced; callers publish them after releasing the lock.

use super::output::{OutputItem, OutputQueue};
use super::turn::{Applied, DiscardReason, TurnArena, TurnState};
use super::{CoordinatorEvent, SessionState};
use crate::messages::{CorrelationId, ResponseEvent};
use tracing::{debug, trace};

/// Terminal turns kept around for late replies and handle lookups
const RETAINED_TURNS: usize = 32;

/// Next step for a drain consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DrainStep {
    Chunk(String),
    Wait,
    Done,
}

#[derive(Debug)]
pub(crate) struct CoordinatorState {
    pub(crate) arena: TurnArena,
    pub(crate) queue: OutputQueue,
    session: SessionState,
    /// Turn whose fallback output waits on the reconnect outcome
    fallback_open: Option<u64>,
    closed: bool,
}

impl CoordinatorState {
    pub(crate) fn new() -> Self {
        Self {
            arena: TurnArena::new(),
            queue: OutputQueue::new(),
            session: SessionState::Idle,
            fallback_open: None,
            closed: false,
        }
    }

    pub(crate) fn session(&self) -> SessionState {
        self.session
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_session(&mut self, state: SessionState) -> Option<CoordinatorEvent> {
        if self.session == state {
            return None;
        }
        debug!(from = ?self.session, to = ?state, "session state changed");
        self.session = state;
        Some(CoordinatorEvent::SessionStateChanged(state))
    }

    /// Create a turn; everything older loses its right to speak
    pub(crate) fn begin_turn(
        &mut self,
        correlation: CorrelationId,
        utterance: String,
    ) -> (u64, Vec<CoordinatorEvent>) {
        let mut events = Vec::new();
        self.fallback_open = None;

        // Finalized output still waiting in the queue is superseded as well
        let mut queued: Vec<u64> = Vec::new();
        while let Some(seq) = self.queue.front_seq() {
            self.queue.remove_turn(seq);
            queued.push(seq);
        }
        for seq in queued {
            if self.arena.discard(seq, DiscardReason::Superseded, true) {
                events.push(CoordinatorEvent::TurnDiscarded {
                    seq,
                    reason: DiscardReason::Superseded,
                });
            }
        }

        let (seq, superseded) = self.arena.create(correlation, utterance);
        events.extend(superseded.into_iter().map(|old| CoordinatorEvent::TurnDiscarded {
            seq: old,
            reason: DiscardReason::Superseded,
        }));
        events.push(CoordinatorEvent::TurnStarted { seq });
        self.arena.prune(RETAINED_TURNS);

        debug!(seq, "turn started");
        (seq, events)
    }

    pub(crate) fn mark_sent(&mut self, seq: u64) -> bool {
        self.arena.mark_sent(seq)
    }

    /// Route one normalized response event to its turn
    pub(crate) fn apply(
        &mut self,
        correlation: &CorrelationId,
        event: ResponseEvent,
    ) -> Vec<CoordinatorEvent> {
        let Some(seq) = self.arena.seq_for(correlation) else {
            trace!(%correlation, "response for unknown turn");
            return Vec::new();
        };

        let applied = match event {
            ResponseEvent::Chunk(text) => self.arena.append(seq, text),
            ResponseEvent::Final | ResponseEvent::Empty => self.arena.finalize(seq),
        };

        match applied {
            Applied::Appended => Vec::new(),
            Applied::Finalized { chunks } => {
                let count = chunks.len();
                if self.arena.is_live(seq) {
                    self.queue.push_turn(seq, chunks);
                    debug!(seq, chunks = count, "turn finalized and queued");
                } else {
                    debug!(seq, "turn finalized after losing live status");
                }
                vec![CoordinatorEvent::TurnFinalized { seq, chunks: count }]
            }
            Applied::Ignored => {
                trace!(seq, state = ?self.arena.state(seq), "late response for terminal turn");
                Vec::new()
            }
        }
    }

    /// User started speaking: silence the live turn and flush the queue
    pub(crate) fn interrupt(&mut self) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        if let Some(seq) = self.arena.clear_live() {
            let unspoken = self.queue.contains_turn(seq);
            if self.arena.discard(seq, DiscardReason::Interrupted, unspoken) {
                debug!(seq, "turn interrupted");
                events.push(CoordinatorEvent::TurnDiscarded {
                    seq,
                    reason: DiscardReason::Interrupted,
                });
            }
        }
        self.queue.clear();
        self.fallback_open = None;
        events
    }

    /// Transport failed: drop in-flight turns, speak `fallback` for the live one
    ///
    /// The live turn's output stays open until [`Self::reconnected`] or
    /// [`Self::backend_unavailable`] settles it.
    pub(crate) fn connection_lost(&mut self, fallback: &str) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        for seq in self.arena.in_flight() {
            if self.arena.discard(seq, DiscardReason::ConnectionLost, false) {
                events.push(CoordinatorEvent::TurnDiscarded {
                    seq,
                    reason: DiscardReason::ConnectionLost,
                });
                if self.arena.is_live(seq) {
                    events.extend(self.queue_phrase(seq, fallback));
                    self.fallback_open = Some(seq);
                }
            }
        }
        events
    }

    pub(crate) fn reconnected(&mut self) {
        if let Some(seq) = self.fallback_open.take() {
            self.queue.push_end(seq);
        }
    }

    /// Reconnects ran out: follow the open fallback with `phrase`
    pub(crate) fn backend_unavailable(&mut self, phrase: &str) -> Vec<CoordinatorEvent> {
        let Some(seq) = self.fallback_open.take() else {
            return Vec::new();
        };
        let events = self.queue_phrase(seq, phrase).into_iter().collect();
        self.queue.push_end(seq);
        events
    }

    /// A single turn could not be sent at all
    pub(crate) fn fail_turn(&mut self, seq: u64, fallback: &str) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        if self.arena.discard(seq, DiscardReason::ConnectionLost, false) {
            events.push(CoordinatorEvent::TurnDiscarded {
                seq,
                reason: DiscardReason::ConnectionLost,
            });
            if self.arena.is_live(seq) {
                events.extend(self.queue_phrase(seq, fallback));
                self.queue.push_end(seq);
            }
        }
        events
    }

    fn queue_phrase(&mut self, seq: u64, phrase: &str) -> Option<CoordinatorEvent> {
        if phrase.is_empty() {
            return None;
        }
        self.queue.push_chunks(seq, [phrase.to_string()]);
        Some(CoordinatorEvent::Fallback(phrase.to_string()))
    }

    /// Discard everything and stop all drains
    pub(crate) fn shutdown(&mut self) -> Vec<CoordinatorEvent> {
        let events = self
            .arena
            .discard_active(DiscardReason::Shutdown)
            .into_iter()
            .map(|seq| CoordinatorEvent::TurnDiscarded {
                seq,
                reason: DiscardReason::Shutdown,
            })
            .collect();
        self.arena.clear_live();
        self.queue.clear();
        self.fallback_open = None;
        self.closed = true;
        events
    }

    /// Turn a drain should follow when started now
    pub(crate) fn drain_target(&self) -> Option<u64> {
        self.arena.live().or_else(|| self.queue.front_seq())
    }

    pub(crate) fn drain_step(&mut self, seq: u64) -> DrainStep {
        match self.queue.pop_for(seq) {
            Some(OutputItem::Chunk(text)) => return DrainStep::Chunk(text),
            Some(OutputItem::End) => return DrainStep::Done,
            None => {}
        }
        if self.closed {
            return DrainStep::Done;
        }
        if self.fallback_open == Some(seq) {
            return DrainStep::Wait;
        }
        match self.arena.state(seq) {
            Some(TurnState::Created | TurnState::Sent | TurnState::Streaming) => DrainStep::Wait,
            // Terminal with nothing left to say, or pruned
            _ => DrainStep::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(state: &mut CoordinatorState, seq: u64) -> (Vec<String>, DrainStep) {
        let mut chunks = Vec::new();
        loop {
            match state.drain_step(seq) {
                DrainStep::Chunk(text) => chunks.push(text),
                other => return (chunks, other),
            }
        }
    }

    fn sent_turn(state: &mut CoordinatorState, id: &str) -> u64 {
        let (seq, _) = state.begin_turn(id.into(), id.to_string());
        state.mark_sent(seq);
        seq
    }

    #[test]
    fn test_single_turn_flow() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");
        assert_eq!(state.drain_step(seq), DrainStep::Wait);

        state.apply(&"c1".into(), ResponseEvent::Chunk("It's sunny".into()));
        assert_eq!(state.drain_step(seq), DrainStep::Wait);
        let events = state.apply(&"c1".into(), ResponseEvent::Final);
        assert_eq!(events, vec![CoordinatorEvent::TurnFinalized { seq, chunks: 1 }]);

        let (chunks, end) = drain_all(&mut state, seq);
        assert_eq!(chunks, vec!["It's sunny".to_string()]);
        assert_eq!(end, DrainStep::Done);
    }

    #[test]
    fn test_only_latest_of_many_reaches_queue() {
        let mut state = CoordinatorState::new();
        let seqs: Vec<u64> = (0..5).map(|i| sent_turn(&mut state, &format!("c{}", i))).collect();

        // Replies arrive oldest first, all after the last turn was created
        for i in 0..5 {
            let id: CorrelationId = format!("c{}", i).into();
            state.apply(&id, ResponseEvent::Chunk(format!("answer {}", i)));
            state.apply(&id, ResponseEvent::Final);
        }

        for seq in &seqs[..4] {
            assert_eq!(state.arena.state(*seq), Some(TurnState::Discarded));
        }
        let (chunks, _) = drain_all(&mut state, seqs[4]);
        assert_eq!(chunks, vec!["answer 4".to_string()]);
    }

    #[test]
    fn test_new_turn_removes_unspoken_output() {
        let mut state = CoordinatorState::new();
        let first = sent_turn(&mut state, "c1");
        state.apply(&"c1".into(), ResponseEvent::Chunk("old".into()));
        state.apply(&"c1".into(), ResponseEvent::Final);

        let (_, events) = state.begin_turn("c2".into(), "next".into());
        assert!(events.contains(&CoordinatorEvent::TurnDiscarded {
            seq: first,
            reason: DiscardReason::Superseded
        }));
        assert!(!state.queue.contains_turn(first));
        assert_eq!(state.drain_step(first), DrainStep::Done);
    }

    #[test]
    fn test_interrupt_is_idempotent() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");

        let events = state.interrupt();
        assert_eq!(events.len(), 1);
        assert!(state.interrupt().is_empty());
        assert_eq!(state.arena.state(seq), Some(TurnState::Discarded));

        // Late reply goes nowhere
        state.apply(&"c1".into(), ResponseEvent::Chunk("late".into()));
        state.apply(&"c1".into(), ResponseEvent::Final);
        assert!(state.queue.is_empty());
        assert_eq!(state.drain_target(), None);
    }

    #[test]
    fn test_empty_reply_finalizes_silently() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");
        state.apply(&"c1".into(), ResponseEvent::Empty);
        assert_eq!(state.arena.state(seq), Some(TurnState::Finalized));
        let (chunks, end) = drain_all(&mut state, seq);
        assert!(chunks.is_empty());
        assert_eq!(end, DrainStep::Done);
    }

    #[test]
    fn test_connection_lost_queues_fallback() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");
        state.apply(&"c1".into(), ResponseEvent::Chunk("partial".into()));

        let events = state.connection_lost("trouble connecting");
        assert!(events.contains(&CoordinatorEvent::Fallback("trouble connecting".into())));
        let (chunks, end) = drain_all(&mut state, seq);
        assert_eq!(chunks, vec!["trouble connecting".to_string()]);
        // Output stays open while reconnecting
        assert_eq!(end, DrainStep::Wait);

        state.reconnected();
        assert_eq!(state.drain_step(seq), DrainStep::Done);
        assert!(state.backend_unavailable("unavailable").is_empty());
    }

    #[test]
    fn test_exhausted_reconnect_speaks_unavailable_after_fallback() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");
        state.connection_lost("trouble connecting");

        let events = state.backend_unavailable("unavailable");
        assert_eq!(events, vec![CoordinatorEvent::Fallback("unavailable".into())]);
        let (chunks, end) = drain_all(&mut state, seq);
        assert_eq!(
            chunks,
            vec!["trouble connecting".to_string(), "unavailable".to_string()]
        );
        assert_eq!(end, DrainStep::Done);
    }

    #[test]
    fn test_new_turn_closes_open_fallback() {
        let mut state = CoordinatorState::new();
        let first = sent_turn(&mut state, "c1");
        state.connection_lost("trouble connecting");

        sent_turn(&mut state, "c2");
        assert_eq!(state.drain_step(first), DrainStep::Done);
        assert!(state.backend_unavailable("unavailable").is_empty());
    }

    #[test]
    fn test_shutdown_ends_waiting_drains() {
        let mut state = CoordinatorState::new();
        let seq = sent_turn(&mut state, "c1");
        state.shutdown();
        assert!(state.is_closed());
        assert_eq!(state.drain_step(seq), DrainStep::Done);
    }

    #[test]
    fn test_session_state_change_reported_once() {
        let mut state = CoordinatorState::new();
        assert!(state.set_session(SessionState::Connecting).is_some());
        assert!(state.set_session(SessionState::Connecting).is_none());
        assert_eq!(state.session(), SessionState::Connecting);
    }
}

//! Turns and the arena that owns them
//!
//! Turns are indexed by sequence number. A single `live` cursor names the
//! only turn allowed to reach the output queue; every other non-terminal turn
//! is discarded the moment a newer one is created.

use crate::messages::CorrelationId;
use std::collections::{BTreeMap, HashMap};

/// Per-turn lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// Constructed, request not yet written
    Created,
    /// Request in flight
    Sent,
    /// At least one chunk received
    Streaming,
    /// Terminal; buffer is immutable
    Finalized,
    /// Terminal; output suppressed
    Discarded,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Finalized | TurnState::Discarded)
    }
}

/// Why a turn was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// A newer utterance arrived
    Superseded,
    /// The speech pipeline signalled that the user started talking
    Interrupted,
    /// Transport failed while the request was in flight
    ConnectionLost,
    /// Coordinator shut down
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub seq: u64,
    pub correlation: CorrelationId,
    pub utterance: String,
    pub state: TurnState,
    /// Append-only until terminal
    pub buffer: Vec<String>,
    pub discard_reason: Option<DiscardReason>,
}

impl Turn {
    fn new(seq: u64, correlation: CorrelationId, utterance: String) -> Self {
        Self {
            seq,
            correlation,
            utterance,
            state: TurnState::Created,
            buffer: Vec::new(),
            discard_reason: None,
        }
    }
}

/// Outcome of applying a response event to a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Chunk appended
    Appended,
    /// Turn finalized; `chunks` is its buffer
    Finalized { chunks: Vec<String> },
    /// Turn unknown or already terminal
    Ignored,
}

/// Turn storage with a "highest live sequence" cursor
#[derive(Debug, Default)]
pub struct TurnArena {
    turns: BTreeMap<u64, Turn>,
    by_correlation: HashMap<CorrelationId, u64>,
    next_seq: u64,
    live: Option<u64>,
}

impl TurnArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the next turn and make it live
    ///
    /// Returns the new sequence number and the turns it superseded.
    pub fn create(&mut self, correlation: CorrelationId, utterance: String) -> (u64, Vec<u64>) {
        let superseded = self.discard_active(DiscardReason::Superseded);

        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_correlation.insert(correlation.clone(), seq);
        self.turns.insert(seq, Turn::new(seq, correlation, utterance));
        self.live = Some(seq);
        (seq, superseded)
    }

    /// Discard every non-terminal turn
    pub fn discard_active(&mut self, reason: DiscardReason) -> Vec<u64> {
        let mut discarded = Vec::new();
        for turn in self.turns.values_mut() {
            if !turn.state.is_terminal() {
                turn.state = TurnState::Discarded;
                turn.discard_reason = Some(reason);
                turn.buffer.clear();
                discarded.push(turn.seq);
            }
        }
        discarded
    }

    /// Discard one turn; no-op when it is already terminal
    ///
    /// A finalized turn is discarded only when `unspoken` is true, i.e. its
    /// output is still waiting in the queue.
    pub fn discard(&mut self, seq: u64, reason: DiscardReason, unspoken: bool) -> bool {
        let Some(turn) = self.turns.get_mut(&seq) else {
            return false;
        };
        let discardable = match turn.state {
            TurnState::Discarded => false,
            TurnState::Finalized => unspoken,
            _ => true,
        };
        if discardable {
            turn.state = TurnState::Discarded;
            turn.discard_reason = Some(reason);
            turn.buffer.clear();
        }
        discardable
    }

    pub fn mark_sent(&mut self, seq: u64) -> bool {
        match self.turns.get_mut(&seq) {
            Some(turn) if turn.state == TurnState::Created => {
                turn.state = TurnState::Sent;
                true
            }
            _ => false,
        }
    }

    pub fn append(&mut self, seq: u64, chunk: String) -> Applied {
        match self.turns.get_mut(&seq) {
            Some(turn) if !turn.state.is_terminal() => {
                turn.buffer.push(chunk);
                turn.state = TurnState::Streaming;
                Applied::Appended
            }
            _ => Applied::Ignored,
        }
    }

    pub fn finalize(&mut self, seq: u64) -> Applied {
        match self.turns.get_mut(&seq) {
            Some(turn) if !turn.state.is_terminal() => {
                turn.state = TurnState::Finalized;
                Applied::Finalized {
                    chunks: turn.buffer.clone(),
                }
            }
            _ => Applied::Ignored,
        }
    }

    pub fn seq_for(&self, correlation: &CorrelationId) -> Option<u64> {
        self.by_correlation.get(correlation).copied()
    }

    pub fn get(&self, seq: u64) -> Option<&Turn> {
        self.turns.get(&seq)
    }

    pub fn state(&self, seq: u64) -> Option<TurnState> {
        self.turns.get(&seq).map(|turn| turn.state)
    }

    pub fn live(&self) -> Option<u64> {
        self.live
    }

    pub fn is_live(&self, seq: u64) -> bool {
        self.live == Some(seq)
    }

    pub fn clear_live(&mut self) -> Option<u64> {
        self.live.take()
    }

    /// Non-terminal turns, oldest first
    pub fn in_flight(&self) -> Vec<u64> {
        self.turns
            .values()
            .filter(|turn| !turn.state.is_terminal())
            .map(|turn| turn.seq)
            .collect()
    }

    /// Drop terminal turns older than `keep` entries behind the newest
    ///
    /// The correlation index goes with them; late replies for pruned turns
    /// are then indistinguishable from unknown ones and dropped the same way.
    pub fn prune(&mut self, keep: usize) {
        let terminal: Vec<u64> = self
            .turns
            .values()
            .filter(|turn| turn.state.is_terminal() && Some(turn.seq) != self.live)
            .map(|turn| turn.seq)
            .collect();
        if terminal.len() <= keep {
            return;
        }
        for seq in &terminal[..terminal.len() - keep] {
            if let Some(turn) = self.turns.remove(seq) {
                self.by_correlation.remove(&turn.correlation);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

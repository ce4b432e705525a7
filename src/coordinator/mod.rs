//! Turn coordinator
//!
//! Owns the mapping from conversational turns to backend requests and exposes
//! one output stream to the speech pipeline. The latest utterance always wins:
//! once a newer turn exists, nothing belonging to an older one is spoken.
//!
//! ```text
//! submit_utterance ──► arena (seq, live cursor) ──► Job ──► SessionWorker ──► Backend
//!                                 ▲                                  │
//!                                 └──── apply(Normalized) ◄──────────┘
//! drain_output ◄── OutputQueue ◄── finalize (live turn only)
//! ```

pub mod config;
pub mod output;
mod session;
mod state;
pub mod turn;

pub use config::{CoordinatorConfig, FallbackPhrases, KeepaliveConfig, ReconnectPolicy};
pub use turn::{DiscardReason, TurnState};

use crate::backend::{Backend, BackendInfo};
use crate::messages::CorrelationId;
use crate::prompts::VoicePrompt;
use crate::{Result, TalkbackError};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use session::{Job, SessionWorker};
use state::{CoordinatorState, DrainStep};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Connection status of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No utterance submitted yet
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; the next utterance starts a fresh cycle
    Unavailable,
}

/// Events emitted by the coordinator for observers
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    TurnStarted {
        seq: u64,
    },
    TurnFinalized {
        seq: u64,
        chunks: usize,
    },
    TurnDiscarded {
        seq: u64,
        reason: DiscardReason,
    },
    /// Out-of-band tool activity reported by the backend
    ToolExecution {
        seq: Option<u64>,
        tool: String,
        args: Value,
    },
    SessionStateChanged(SessionState),
    /// A fallback phrase was queued for speaking
    Fallback(String),
    Shutdown,
}

/// Static facts about the session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub backend: BackendInfo,
    pub created_at: DateTime<Utc>,
}

/// State shared by the coordinator, the session worker, and drains
pub(crate) struct Shared {
    pub(crate) state: Mutex<CoordinatorState>,
    notify: Notify,
    events: Sender<CoordinatorEvent>,
    /// Used to evict the oldest event when observers fall behind
    backlog: Receiver<CoordinatorEvent>,
}

impl Shared {
    fn new(events: Sender<CoordinatorEvent>, backlog: Receiver<CoordinatorEvent>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::new()),
            notify: Notify::new(),
            events,
            backlog,
        }
    }

    /// Emit events and wake every drain
    ///
    /// A full channel keeps the most recent events.
    pub(crate) fn publish(&self, events: Vec<CoordinatorEvent>) {
        for event in events {
            let mut pending = event;
            while let Err(TrySendError::Full(event)) = self.events.try_send(pending) {
                if let Ok(stale) = self.backlog.try_recv() {
                    trace!(event = ?stale, "event channel full, dropping oldest event");
                }
                pending = event;
            }
        }
        self.notify.notify_waiters();
    }
}

/// Handle to one submitted turn
#[derive(Clone)]
pub struct TurnHandle {
    seq: u64,
    correlation: CorrelationId,
    shared: Arc<Shared>,
}

impl TurnHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation
    }

    /// Current state; `None` once the turn has been pruned
    pub fn state(&self) -> Option<TurnState> {
        self.shared.state.lock().arena.state(self.seq)
    }

    pub fn discard_reason(&self) -> Option<DiscardReason> {
        self.shared
            .state
            .lock()
            .arena
            .get(self.seq)
            .and_then(|turn| turn.discard_reason)
    }
}

impl fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnHandle")
            .field("seq", &self.seq)
            .field("correlation", &self.correlation)
            .finish()
    }
}

/// Backend response coordinator for one session
pub struct Coordinator {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
    events: Receiver<CoordinatorEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    voice_prompt: VoicePrompt,
    info: SessionInfo,
}

impl Coordinator {
    /// Start a session on the current tokio runtime
    ///
    /// Nothing is connected yet; the first utterance opens the backend.
    pub fn start(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            TalkbackError::Coordinator("coordinator must be started inside a tokio runtime".into())
        })?;

        let backend = Backend::from_config(&config.backend, &config.voice_prompt.system_prompt);
        let info = SessionInfo {
            backend: backend.info(),
            created_at: Utc::now(),
        };

        let (event_tx, event_rx) = crossbeam_channel::bounded(config.event_buffer_size);
        let shared = Arc::new(Shared::new(event_tx, event_rx.clone()));
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let voice_prompt = config.voice_prompt.clone();

        let worker = SessionWorker::new(Arc::clone(&shared), backend, config, job_rx, cancel.clone());
        let worker = runtime.spawn(worker.run());

        info!(backend = %info.backend, "coordinator started");

        Ok(Self {
            shared,
            jobs: job_tx,
            events: event_rx,
            cancel,
            worker: Some(worker),
            voice_prompt,
            info,
        })
    }

    /// Begin a new turn for `text`
    ///
    /// Never blocks on the backend: the turn is created and every older turn
    /// discarded before this returns; the request is sent by the session task.
    pub fn submit_utterance(&self, text: &str) -> TurnHandle {
        let correlation = CorrelationId::generate();
        let message = self.voice_prompt.format(text);

        let (seq, events) = self
            .shared
            .state
            .lock()
            .begin_turn(correlation.clone(), text.trim().to_string());
        self.shared.publish(events);

        let job = Job::Send {
            seq,
            correlation: correlation.clone(),
            message,
        };
        if self.jobs.send(job).is_err() {
            warn!(seq, "session worker stopped, turn cannot be sent");
            let fallback = TalkbackError::Coordinator(String::new()).user_message();
            let events = self.shared.state.lock().fail_turn(seq, &fallback);
            self.shared.publish(events);
        }

        TurnHandle {
            seq,
            correlation,
            shared: Arc::clone(&self.shared),
        }
    }

    /// The user started speaking; fire and forget, idempotent
    pub fn signal_interruption(&self) {
        let events = self.shared.state.lock().interrupt();
        if !events.is_empty() {
            debug!("interruption discarded the live turn");
        }
        self.shared.publish(events);
    }

    /// Speakable chunks for the current turn
    ///
    /// Follows the live turn at call time (or whatever is queued). Ends after
    /// the turn's last chunk, or as soon as the turn is discarded.
    pub fn drain_output(&self) -> impl Stream<Item = String> + Send + 'static {
        let target = self.shared.state.lock().drain_target();
        drain(Arc::clone(&self.shared), target)
    }

    /// Drain the output of one specific turn
    pub fn drain_turn(&self, turn: &TurnHandle) -> impl Stream<Item = String> + Send + 'static {
        drain(Arc::clone(&self.shared), Some(turn.seq))
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<CoordinatorEvent> {
        self.events.try_recv().ok()
    }

    /// Receive an event (blocking)
    pub fn recv_event(&self) -> Option<CoordinatorEvent> {
        self.events.recv().ok()
    }

    /// Receive an event, waiting at most `timeout` (blocking)
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<CoordinatorEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Event receiver for observers on other threads
    pub fn event_receiver(&self) -> Receiver<CoordinatorEvent> {
        self.events.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.state.lock().session()
    }

    pub fn session(&self) -> &SessionInfo {
        &self.info
    }

    /// Stop the session task, close the transport, and end every drain
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "session worker ended abnormally");
            }
        }

        let mut events = self.shared.state.lock().shutdown();
        events.push(CoordinatorEvent::Shutdown);
        self.shared.publish(events);
        info!("coordinator shut down");
    }
}

fn drain(shared: Arc<Shared>, target: Option<u64>) -> impl Stream<Item = String> + Send + 'static {
    async_stream::stream! {
        if let Some(seq) = target {
            loop {
                // Register before checking so a publish in between is not lost
                let notified = shared.notify.notified();
                let step = shared.state.lock().drain_step(seq);
                match step {
                    DrainStep::Chunk(text) => yield text,
                    DrainStep::Done => break,
                    DrainStep::Wait => notified.await,
                }
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        let closed = self.shared.state.lock().is_closed();
        if !closed {
            let events = self.shared.state.lock().shutdown();
            self.shared.publish(events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendConfig, SubprocessConfig};
    use futures::StreamExt;

    /// A backend that can never be reached
    fn unreachable_config() -> CoordinatorConfig {
        CoordinatorConfig::new(BackendConfig::Subprocess(SubprocessConfig::new(
            "/nonexistent/talkback-test-agent",
        )))
        .with_reconnect(1, 5)
    }

    #[test]
    fn test_full_event_channel_keeps_newest() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let shared = Shared::new(tx, rx.clone());
        shared.publish((1..=3).map(|seq| CoordinatorEvent::TurnStarted { seq }).collect());

        let kept: Vec<CoordinatorEvent> = rx.try_iter().collect();
        assert_eq!(
            kept,
            vec![
                CoordinatorEvent::TurnStarted { seq: 2 },
                CoordinatorEvent::TurnStarted { seq: 3 },
            ]
        );
    }

    #[test]
    fn test_start_requires_runtime() {
        let err = Coordinator::start(CoordinatorConfig::default()).err();
        assert!(matches!(err, Some(TalkbackError::Coordinator(_))));
    }

    #[tokio::test]
    async fn test_submit_returns_immediately() {
        let coordinator = Coordinator::start(unreachable_config()).unwrap();
        let first = coordinator.submit_utterance("Weather?");
        let second = coordinator.submit_utterance("Tell me a joke");

        assert_eq!(first.seq() + 1, second.seq());
        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(first.state(), Some(TurnState::Discarded));
        assert_eq!(first.discard_reason(), Some(DiscardReason::Superseded));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_speaks_unavailable_phrase() {
        let config = unreachable_config();
        let phrase = config.fallback.unavailable.clone();
        let coordinator = Coordinator::start(config).unwrap();

        let turn = coordinator.submit_utterance("hello");
        let spoken: Vec<String> = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.drain_output().collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        assert_eq!(spoken, vec![phrase]);
        assert_eq!(turn.discard_reason(), Some(DiscardReason::ConnectionLost));
        assert_eq!(coordinator.session_state(), SessionState::Unavailable);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_without_turn_is_empty() {
        let coordinator = Coordinator::start(unreachable_config()).unwrap();
        let spoken: Vec<String> = coordinator.drain_output().collect().await;
        assert!(spoken.is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_emits_event() {
        let coordinator = Coordinator::start(unreachable_config()).unwrap();
        let events = coordinator.event_receiver();
        coordinator.shutdown().await;

        let all: Vec<CoordinatorEvent> = events.try_iter().collect();
        assert_eq!(all.last(), Some(&CoordinatorEvent::Shutdown));
    }
}

//! Session worker
//!
//! One task per session owns the backend. It sends queued turns, consumes the
//! transport's inbound messages, runs the keep-alive probe and the optional
//! silence sweep, and drives reconnects. Coordinator state is only touched
//! through the shared lock.

use super::config::CoordinatorConfig;
use super::{CoordinatorEvent, SessionState, Shared};
use crate::backend::Backend;
use crate::messages::{CorrelationId, Normalized, TransportEvent};
use crate::{Result, TalkbackError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work handed from the coordinator to the session task
#[derive(Debug)]
pub(crate) enum Job {
    Send {
        seq: u64,
        correlation: CorrelationId,
        message: String,
    },
}

pub(crate) struct SessionWorker {
    shared: Arc<Shared>,
    backend: Backend,
    config: CoordinatorConfig,
    jobs: UnboundedReceiver<Job>,
    inbound: Option<UnboundedReceiver<TransportEvent>>,
    cancel: CancellationToken,
}

impl SessionWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        backend: Backend,
        config: CoordinatorConfig,
        jobs: UnboundedReceiver<Job>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            backend,
            config,
            jobs,
            inbound: None,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.config.keepalive.interval());
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        keepalive.tick().await;

        let mut sweep = self.config.silence_timeout().map(|bound| {
            let period = (bound / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(backend = %self.backend.info(), "session worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => self.handle_job(job).await,
                    None => break,
                },
                event = next_inbound(&mut self.inbound) => self.handle_inbound(event).await,
                _ = keepalive.tick() => self.keepalive().await,
                _ = next_tick(&mut sweep) => self.sweep_silent(),
            }
        }

        self.inbound = None;
        self.backend.close().await;
        info!("session worker stopped");
    }

    async fn handle_job(&mut self, job: Job) {
        match job {
            Job::Send {
                seq,
                correlation,
                message,
            } => {
                if self.is_discarded(seq) {
                    debug!(seq, "turn discarded before dispatch, not sending");
                    return;
                }

                if !self.backend.is_connected() {
                    if !self.establish().await {
                        let phrase = self.config.fallback.unavailable.clone();
                        let events = self.shared.state.lock().fail_turn(seq, &phrase);
                        self.shared.publish(events);
                        return;
                    }
                    // Connecting can take several backoff rounds
                    if self.is_discarded(seq) {
                        debug!(seq, "turn discarded while connecting, not sending");
                        return;
                    }
                }

                match self.send_with_retry(&correlation, &message).await {
                    Ok(()) => {
                        self.shared.state.lock().mark_sent(seq);
                        debug!(seq, %correlation, "turn sent");
                    }
                    Err(e) => {
                        warn!(seq, error = %e, "send failed after retry");
                        self.on_connection_lost(e.to_string()).await;
                    }
                }
            }
        }
    }

    fn is_discarded(&self, seq: u64) -> bool {
        self.shared
            .state
            .lock()
            .arena
            .state(seq)
            .map_or(true, |state| state.is_terminal())
    }

    async fn send_with_retry(&mut self, correlation: &CorrelationId, message: &str) -> Result<()> {
        match self.backend.send(correlation, message).await {
            Err(TalkbackError::Send(reason)) => {
                debug!(%correlation, %reason, "send failed, retrying once");
                self.backend.send(correlation, message).await
            }
            other => other,
        }
    }

    async fn handle_inbound(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(raw)) => {
                let normalized = self.backend.normalize(&raw);
                self.dispatch(normalized);
            }
            Some(TransportEvent::Closed(reason)) => self.on_connection_lost(reason).await,
            None => {
                self.on_connection_lost("transport reader stopped".to_string())
                    .await
            }
        }
    }

    fn dispatch(&self, normalized: Vec<Normalized>) {
        if normalized.is_empty() {
            return;
        }
        let events = {
            let mut state = self.shared.state.lock();
            let mut events = Vec::new();
            for item in normalized {
                match item {
                    Normalized::Response { correlation, event } => {
                        events.extend(state.apply(&correlation, event));
                    }
                    Normalized::Tool {
                        correlation,
                        notification,
                    } => {
                        let seq = correlation.and_then(|c| state.arena.seq_for(&c));
                        events.push(CoordinatorEvent::ToolExecution {
                            seq,
                            tool: notification.tool,
                            args: notification.args,
                        });
                    }
                }
            }
            events
        };
        self.shared.publish(events);
    }

    async fn keepalive(&mut self) {
        if !self.backend.is_connected() {
            return;
        }
        if let Err(e) = self.backend.probe(self.config.keepalive.timeout()).await {
            warn!(error = %e, "keep-alive failed");
            self.on_connection_lost(e.to_string()).await;
        }
    }

    fn sweep_silent(&mut self) {
        if let Some(bound) = self.config.silence_timeout() {
            let expired = self.backend.expire_silent(bound);
            self.dispatch(expired);
        }
    }

    fn set_state(&self, state: SessionState) {
        let event = self.shared.state.lock().set_session(state);
        self.shared.publish(event.into_iter().collect());
    }

    async fn connect_once(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(TalkbackError::Coordinator("shut down while connecting".into()));
            }
            result = self.backend.connect(tx) => result?,
        }
        self.inbound = Some(rx);
        Ok(())
    }

    /// One direct attempt, then the reconnect policy
    async fn establish(&mut self) -> bool {
        self.set_state(SessionState::Connecting);
        match self.connect_once().await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                info!(backend = %self.backend.info(), "session connected");
                true
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.reconnect(e).await
            }
        }
    }

    async fn reconnect(&mut self, mut last: TalkbackError) -> bool {
        let policy = self.config.reconnect.clone();
        for attempt in 1..=policy.max_attempts {
            self.set_state(SessionState::Reconnecting { attempt });
            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_once().await {
                Ok(()) => {
                    self.set_state(SessionState::Connected);
                    info!(attempt, "reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last = e;
                }
            }
        }

        let err = TalkbackError::BackendUnavailable {
            attempts: policy.max_attempts,
            reason: last.to_string(),
        };
        error!(error = %err, "giving up on backend");
        self.set_state(SessionState::Unavailable);
        false
    }

    async fn on_connection_lost(&mut self, reason: String) {
        warn!(%reason, "backend connection lost");
        self.inbound = None;
        self.backend.close().await;
        let orphaned = self.backend.reset();
        if !orphaned.is_empty() {
            debug!(count = orphaned.len(), "dropped pending requests");
        }

        let fallback = self.config.fallback.connection_lost.clone();
        let events = {
            let mut state = self.shared.state.lock();
            let mut events: Vec<_> = state
                .set_session(SessionState::Disconnected)
                .into_iter()
                .collect();
            events.extend(state.connection_lost(&fallback));
            events
        };
        self.shared.publish(events);

        if self.cancel.is_cancelled() {
            return;
        }
        let recovered = self.reconnect(TalkbackError::Connection(reason)).await;
        if self.cancel.is_cancelled() {
            return;
        }
        let events = {
            let mut state = self.shared.state.lock();
            if recovered {
                state.reconnected();
                Vec::new()
            } else {
                state.backend_unavailable(&self.config.fallback.unavailable)
            }
        };
        self.shared.publish(events);
    }
}

async fn next_inbound(
    inbound: &mut Option<UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

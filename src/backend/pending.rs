//! In-flight request tracking shared by the response reassemblers

use crate::messages::CorrelationId;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Backend-facing half of a turn
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation: CorrelationId,
    pub sent_at: DateTime<Utc>,
    /// Monotonic send time for silence bounds
    sent_instant: Instant,
    /// Deltas received before the terminal event
    pub accumulator: Option<String>,
    /// Empty acknowledgment seen (two-phase backends)
    pub acknowledged: bool,
}

impl PendingRequest {
    pub fn new(correlation: CorrelationId) -> Self {
        Self {
            correlation,
            sent_at: Utc::now(),
            sent_instant: Instant::now(),
            accumulator: None,
            acknowledged: false,
        }
    }

    /// Append a streamed delta
    pub fn accumulate(&mut self, delta: &str) {
        self.accumulator
            .get_or_insert_with(String::new)
            .push_str(delta);
    }

    /// Take accumulated text, if any was received
    pub fn take_accumulated(&mut self) -> Option<String> {
        self.accumulator.take().filter(|text| !text.is_empty())
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_instant.elapsed()
    }
}

/// Outstanding requests in send order
#[derive(Debug, Default)]
pub struct PendingSet {
    requests: VecDeque<PendingRequest>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, correlation: CorrelationId) {
        self.requests.push_back(PendingRequest::new(correlation));
    }

    pub fn contains(&self, correlation: &str) -> bool {
        self.requests
            .iter()
            .any(|r| r.correlation.as_str() == correlation)
    }

    pub fn get(&self, correlation: &CorrelationId) -> Option<&PendingRequest> {
        self.requests.iter().find(|r| &r.correlation == correlation)
    }

    pub fn get_mut(&mut self, correlation: &CorrelationId) -> Option<&mut PendingRequest> {
        self.requests
            .iter_mut()
            .find(|r| &r.correlation == correlation)
    }

    /// Pick the request an inbound message belongs to
    ///
    /// An explicit id must match an outstanding request; messages without one
    /// belong to the oldest request, since the backend answers in order.
    pub fn resolve(&self, explicit: Option<&str>) -> Option<CorrelationId> {
        match explicit {
            Some(id) => self
                .requests
                .iter()
                .find(|r| r.correlation.as_str() == id)
                .map(|r| r.correlation.clone()),
            None => self.requests.front().map(|r| r.correlation.clone()),
        }
    }

    /// Remove a request that reached a terminal event
    pub fn complete(&mut self, correlation: &CorrelationId) -> Option<PendingRequest> {
        let index = self
            .requests
            .iter()
            .position(|r| &r.correlation == correlation)?;
        self.requests.remove(index)
    }

    /// Remove requests older than the silence bound
    pub fn expire(&mut self, bound: Duration) -> Vec<PendingRequest> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .requests
            .drain(..)
            .partition(|r| r.elapsed() >= bound);
        self.requests = kept.into();
        expired
    }

    /// Retire superseded requests that were acknowledged but stayed silent
    ///
    /// The newest request is never retired. Beyond `keep` such requests the
    /// oldest are removed and returned.
    pub fn retire_silent(&mut self, keep: usize) -> Vec<PendingRequest> {
        let newest = self.requests.len().saturating_sub(1);
        let silent: Vec<usize> = self
            .requests
            .iter()
            .enumerate()
            .take(newest)
            .filter(|(_, r)| r.acknowledged && r.accumulator.is_none())
            .map(|(index, _)| index)
            .collect();
        let excess = silent.len().saturating_sub(keep);
        let mut retired: Vec<_> = silent[..excess]
            .iter()
            .rev()
            .filter_map(|&index| self.requests.remove(index))
            .collect();
        retired.reverse();
        retired
    }

    /// Forget everything, e.g. after the connection dropped
    pub fn clear(&mut self) -> Vec<CorrelationId> {
        self.requests.drain(..).map(|r| r.correlation).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_explicit_id() {
        let mut pending = PendingSet::new();
        pending.register("a".into());
        pending.register("b".into());

        assert_eq!(pending.resolve(Some("b")), Some("b".into()));
        assert_eq!(pending.resolve(None), Some("a".into()));
        assert_eq!(pending.resolve(Some("zzz")), None);
    }

    #[test]
    fn test_complete_removes_request() {
        let mut pending = PendingSet::new();
        pending.register("a".into());
        assert!(pending.complete(&"a".into()).is_some());
        assert!(pending.complete(&"a".into()).is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_expire_zero_bound_takes_all() {
        let mut pending = PendingSet::new();
        pending.register("a".into());
        pending.register("b".into());
        let expired = pending.expire(Duration::ZERO);
        assert_eq!(expired.len(), 2);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_retire_silent_keeps_newest_and_bound() {
        let mut pending = PendingSet::new();
        for id in ["a", "b", "c", "d"] {
            pending.register(id.into());
            pending.get_mut(&id.into()).unwrap().acknowledged = true;
        }
        pending.get_mut(&"b".into()).unwrap().accumulate("streaming");

        let retired = pending.retire_silent(1);
        let retired: Vec<_> = retired.into_iter().map(|r| r.correlation).collect();
        assert_eq!(retired, vec![CorrelationId::from("a")]);
        assert!(pending.contains("b"));
        assert!(pending.contains("c"));
        assert!(pending.contains("d"));

        assert!(pending.retire_silent(1).is_empty());
        let retired = pending.retire_silent(0);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].correlation, CorrelationId::from("c"));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_accumulator() {
        let mut request = PendingRequest::new("a".into());
        assert_eq!(request.take_accumulated(), None);
        request.accumulate("It's ");
        request.accumulate("sunny");
        assert_eq!(request.take_accumulated(), Some("It's sunny".to_string()));
    }
}

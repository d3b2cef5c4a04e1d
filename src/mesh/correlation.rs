//! Correlation registry - outstanding requests awaiting exactly one reply.
//!
//! Every entry is a single-assignment slot. Whichever of resolve, expire or
//! cancel reaches it first removes it from the registry, so later attempts
//! for the same key find nothing and are reported as stale.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::mesh::RequestError;
use crate::types::Event;

/// Identifies the reply a request waits for.
///
/// By default this is the reply topic itself, so one request per reply
/// topic can be outstanding. A scope (the envelope's correlation id) lets
/// several requests share a reply topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn new(key: impl Into<String>) -> Self {
        CorrelationKey(key.into())
    }

    pub fn for_topic(reply_topic: &str, scope: Option<&str>) -> Self {
        match scope {
            Some(scope) => CorrelationKey(format!("{reply_topic}@{scope}")),
            None => CorrelationKey(reply_topic.to_string()),
        }
    }

    /// Key a reply event resolves.
    pub fn for_reply(event: &Event) -> Self {
        Self::for_topic(event.topic(), event.correlation_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        CorrelationKey::new(key)
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) enum Completion {
    Resolved(Vec<u8>),
    TimedOut { waited: Duration },
    Cancelled,
}

struct PendingRequest {
    id: u64,
    created_at: Instant,
    deadline: Instant,
    slot: Option<oneshot::Sender<Completion>>,
}

impl PendingRequest {
    fn complete(&mut self, completion: Completion) -> bool {
        let Some(slot) = self.slot.take() else {
            return false;
        };
        slot.send(completion).is_ok()
    }

    fn time_out(&mut self, now: Instant) -> bool {
        let waited = now.duration_since(self.created_at);
        self.complete(Completion::TimedOut { waited })
    }
}

/// The waiting side of a registered request.
#[derive(Debug)]
pub struct ReplyHandle {
    key: CorrelationKey,
    id: u64,
    deadline: Instant,
    receiver: oneshot::Receiver<Completion>,
}

impl ReplyHandle {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the reply, the timeout, a cancellation, or the registry going away.
    pub async fn wait(mut self) -> Result<Vec<u8>, RequestError> {
        self.outcome().await
    }

    pub(crate) async fn outcome(&mut self) -> Result<Vec<u8>, RequestError> {
        match (&mut self.receiver).await {
            Ok(Completion::Resolved(payload)) => Ok(payload),
            Ok(Completion::TimedOut { waited }) => Err(RequestError::Timeout {
                key: self.key.clone(),
                waited,
            }),
            Ok(Completion::Cancelled) => Err(RequestError::Cancelled),
            Err(_) => Err(RequestError::ContextClosed),
        }
    }
}

#[derive(Default)]
pub struct CorrelationRegistry {
    entries: HashMap<CorrelationKey, PendingRequest>,
    next_id: u64,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request; a key that is already waiting is rejected.
    pub fn register(
        &mut self,
        key: CorrelationKey,
        deadline: Instant,
    ) -> Result<ReplyHandle, RequestError> {
        if self.entries.contains_key(&key) {
            log::warn!("Request on '{}' rejected: already waiting", key);
            return Err(RequestError::Busy { key });
        }

        self.next_id += 1;
        let id = self.next_id;
        let (slot, receiver) = oneshot::channel();
        self.entries.insert(
            key.clone(),
            PendingRequest {
                id,
                created_at: Instant::now(),
                deadline,
                slot: Some(slot),
            },
        );
        log::debug!("Request {} on '{}' waiting until {:?}", id, key, deadline);

        Ok(ReplyHandle {
            key,
            id,
            deadline,
            receiver,
        })
    }

    /// Hands a reply to its waiter. Returns false for stale replies.
    pub fn resolve(&mut self, key: &CorrelationKey, payload: Vec<u8>) -> bool {
        self.resolve_at(key, payload, Instant::now())
    }

    pub fn resolve_at(&mut self, key: &CorrelationKey, payload: Vec<u8>, now: Instant) -> bool {
        let Some(mut entry) = self.entries.remove(key) else {
            log::warn!("Stale reply on '{}': nothing is waiting for it", key);
            return false;
        };

        if now >= entry.deadline {
            entry.time_out(now);
            log::warn!(
                "Stale reply on '{}': arrived {:?} after its deadline",
                key,
                now.duration_since(entry.deadline)
            );
            return false;
        }

        let delivered = entry.complete(Completion::Resolved(payload));
        if delivered {
            log::debug!("Request {} on '{}' resolved", entry.id, key);
        } else {
            log::debug!("Waiter for '{}' left before its reply arrived", key);
        }
        delivered
    }

    /// Times out every entry whose deadline has passed.
    pub fn expire(&mut self) -> usize {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> usize {
        let overdue: Vec<CorrelationKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &overdue {
            if let Some(mut entry) = self.entries.remove(key) {
                entry.time_out(now);
                log::info!(
                    "Request {} on '{}' timed out after {:?}",
                    entry.id,
                    key,
                    now.duration_since(entry.created_at)
                );
            }
        }
        overdue.len()
    }

    /// Withdraws a request. A newer request on the same key is left alone.
    pub fn cancel(&mut self, key: &CorrelationKey, id: u64) -> bool {
        if !self.entries.get(key).is_some_and(|entry| entry.id == id) {
            return false;
        }
        if let Some(mut entry) = self.entries.remove(key) {
            entry.complete(Completion::Cancelled);
        }
        log::debug!("Request {} on '{}' cancelled", id, key);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    pub fn is_waiting(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry; their waiters observe a closed context.
    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Envelope, RawFrame};

    fn pics() -> CorrelationKey {
        CorrelationKey::from("pics:5")
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_reply() {
        let mut registry = CorrelationRegistry::new();
        let start = Instant::now();
        let handle = registry.register(pics(), start + Duration::from_secs(2)).unwrap();

        assert_eq!(registry.expire_at(start + Duration::from_millis(1999)), 0);
        assert!(registry.is_waiting(&pics()));
        assert_eq!(registry.expire_at(start + Duration::from_secs(2)), 1);
        assert!(registry.is_empty());

        let outcome = handle.wait().await;
        assert!(matches!(
            outcome,
            Err(RequestError::Timeout { key, waited }) if key == pics() && waited >= Duration::from_secs(2)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_times_out_early() {
        let mut registry = CorrelationRegistry::new();
        let start = Instant::now();
        for secs in 1..=5u64 {
            let key = CorrelationKey::new(format!("pics:{secs}"));
            registry.register(key, start + Duration::from_secs(secs)).unwrap();
        }

        for secs in 1..=5u64 {
            let before = start + Duration::from_secs(secs) - Duration::from_millis(1);
            assert_eq!(registry.expire_at(before), 0);
            assert_eq!(registry.expire_at(start + Duration::from_secs(secs)), 1);
            assert_eq!(registry.len(), (5 - secs) as usize);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_within_deadline() {
        let mut registry = CorrelationRegistry::new();
        let handle = registry
            .register(pics(), Instant::now() + Duration::from_secs(2))
            .unwrap();

        let payload = br#"["a.jpg","b.jpg"]"#.to_vec();
        assert!(registry.resolve(&pics(), payload.clone()));
        assert_eq!(handle.wait().await.unwrap(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_reply_is_stale() {
        let mut registry = CorrelationRegistry::new();
        let handle = registry
            .register(pics(), Instant::now() + Duration::from_secs(2))
            .unwrap();

        assert!(registry.resolve(&pics(), b"first".to_vec()));
        assert!(!registry.resolve(&pics(), b"second".to_vec()));
        assert_eq!(handle.wait().await.unwrap(), b"first".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_after_expire_is_noop() {
        let mut registry = CorrelationRegistry::new();
        let start = Instant::now();
        let handle = registry.register(pics(), start + Duration::from_secs(2)).unwrap();

        assert_eq!(registry.expire_at(start + Duration::from_secs(3)), 1);
        assert!(!registry.resolve(&pics(), b"late".to_vec()));
        assert!(matches!(handle.wait().await, Err(RequestError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_times_out_instead() {
        let mut registry = CorrelationRegistry::new();
        let start = Instant::now();
        let handle = registry.register(pics(), start + Duration::from_secs(2)).unwrap();

        assert!(!registry.resolve_at(&pics(), b"late".to_vec(), start + Duration::from_secs(2)));
        assert!(matches!(handle.wait().await, Err(RequestError::Timeout { .. })));
    }

    #[test]
    fn test_unknown_key_is_stale() {
        let mut registry = CorrelationRegistry::new();
        assert!(!registry.resolve(&CorrelationKey::from("pics:9"), b"[]".to_vec()));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_key_is_rejected() {
        let mut registry = CorrelationRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let _first = registry.register(pics(), deadline).unwrap();

        assert_eq!(
            registry.register(pics(), deadline).unwrap_err(),
            RequestError::Busy { key: pics() }
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_matches_its_own_request() {
        let mut registry = CorrelationRegistry::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let first = registry.register(pics(), deadline).unwrap();
        assert!(registry.cancel(&pics(), first.id()));

        let second = registry.register(pics(), deadline).unwrap();
        assert!(!registry.cancel(&pics(), first.id()));
        assert!(registry.is_waiting(&pics()));

        assert!(registry.resolve(&pics(), b"ok".to_vec()));
        assert_eq!(second.wait().await.unwrap(), b"ok".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_keys_stop_waiting() {
        let mut registry = CorrelationRegistry::new();
        let start = Instant::now();
        let resolved = CorrelationKey::from("a");
        let expired = CorrelationKey::from("b");
        let cancelled = CorrelationKey::from("c");
        registry.register(resolved.clone(), start + Duration::from_secs(5)).unwrap();
        registry.register(expired.clone(), start + Duration::from_secs(1)).unwrap();
        let handle = registry
            .register(cancelled.clone(), start + Duration::from_secs(5))
            .unwrap();
        assert!(registry.is_waiting(&resolved));

        assert!(registry.resolve_at(&resolved, b"ok".to_vec(), start));
        assert_eq!(registry.expire_at(start + Duration::from_secs(1)), 1);
        assert!(registry.cancel(&cancelled, handle.id()));

        for key in [&resolved, &expired, &cancelled] {
            assert!(!registry.is_waiting(key));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_after_cancel_is_stale() {
        let mut registry = CorrelationRegistry::new();
        let handle = registry
            .register(pics(), Instant::now() + Duration::from_secs(2))
            .unwrap();
        assert!(registry.cancel(&pics(), handle.id()));
        assert!(!registry.resolve(&pics(), b"ok".to_vec()));
        assert_eq!(handle.wait().await, Err(RequestError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_and_close() {
        let mut registry = CorrelationRegistry::new();
        assert_eq!(registry.next_deadline(), None);

        let start = Instant::now();
        registry
            .register(CorrelationKey::from("a"), start + Duration::from_secs(5))
            .unwrap();
        let handle = registry
            .register(CorrelationKey::from("b"), start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(registry.next_deadline(), Some(start + Duration::from_secs(1)));

        assert_eq!(registry.close_all(), 2);
        assert_eq!(handle.wait().await, Err(RequestError::ContextClosed));
    }

    #[test]
    fn test_key_from_reply_event() {
        let plain = Event::from_frame(RawFrame::new("SEND_LATEST_PICTURES", "[]"));
        assert_eq!(CorrelationKey::for_reply(&plain).as_str(), "SEND_LATEST_PICTURES");

        let scoped = Envelope::new("picture-manager", "LATEST_PICTURES")
            .with_correlation_id(Some("42".to_string()));
        let scoped = Event::from_frame(RawFrame::new("SEND_LATEST_PICTURES", scoped.to_bytes()));
        assert_eq!(
            CorrelationKey::for_reply(&scoped).as_str(),
            "SEND_LATEST_PICTURES@42"
        );
    }
}

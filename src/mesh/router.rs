//! Topic router - fans each event out to every matching handler.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use crate::bus::{PublishError, TopicPattern};
use crate::mesh::correlation::{CorrelationKey, CorrelationRegistry};
use crate::types::{Event, MalformedPayload};

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Handler failed: {0}")]
    Failed(anyhow::Error),
}

impl HandlerError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::new(error))
    }

    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(message))
    }
}

/// What a handler may touch while it runs inside the owning runtime.
pub struct HandlerContext<'a> {
    registry: &'a mut CorrelationRegistry,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(registry: &'a mut CorrelationRegistry) -> Self {
        HandlerContext { registry }
    }

    pub fn registry(&mut self) -> &mut CorrelationRegistry {
        self.registry
    }
}

/// Application logic bound to a topic pattern.
///
/// Handlers run on the runtime one at a time and within the runtime's
/// handler budget; anything longer belongs in a spawned task.
#[async_trait]
pub trait Handler: Send + 'static {
    async fn handle(&mut self, event: &Event, ctx: &mut HandlerContext<'_>)
    -> Result<(), HandlerError>;
}

/// Adapts a plain closure into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&Event, &mut HandlerContext<'_>) -> Result<(), HandlerError> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: FnMut(&Event, &mut HandlerContext<'_>) -> Result<(), HandlerError> + Send + 'static,
{
    async fn handle(
        &mut self,
        event: &Event,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        (self.0)(event, ctx)
    }
}

/// Resolves pending requests with the replies routed to it.
pub(crate) struct ReplyCorrelator;

#[async_trait]
impl Handler for ReplyCorrelator {
    async fn handle(
        &mut self,
        event: &Event,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let key = CorrelationKey::for_reply(event);
        ctx.registry().resolve(&key, event.payload().to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub pattern: TopicPattern,
    pub registered_by: String,
}

struct Route {
    subscription: Subscription,
    handler: Box<dyn Handler>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub failed: usize,
}

pub struct TopicRouter {
    routes: Vec<Route>,
    next_id: u64,
    budget: Duration,
}

impl TopicRouter {
    pub fn new(budget: Duration) -> Self {
        TopicRouter {
            routes: Vec::new(),
            next_id: 0,
            budget,
        }
    }

    pub fn register(
        &mut self,
        pattern: TopicPattern,
        registered_by: &str,
        handler: Box<dyn Handler>,
    ) -> u64 {
        self.next_id += 1;
        log::debug!(
            "Handler {} for '{}' registered by '{}'",
            self.next_id,
            pattern,
            registered_by
        );
        self.routes.push(Route {
            subscription: Subscription {
                id: self.next_id,
                pattern,
                registered_by: registered_by.to_string(),
            },
            handler,
        });
        self.next_id
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.routes.iter().map(|route| &route.subscription)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Runs every matching handler in registration order.
    ///
    /// A failing, panicking or overrunning handler is logged and skipped.
    pub async fn dispatch(&mut self, event: &Event, ctx: &mut HandlerContext<'_>) -> DispatchReport {
        let mut report = DispatchReport::default();

        for route in self.routes.iter_mut() {
            let subscription = &route.subscription;
            if !subscription.pattern.matches(event.topic()) {
                continue;
            }
            report.matched += 1;

            let call = tokio::time::timeout(self.budget, route.handler.handle(event, ctx));
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(error))) => {
                    report.failed += 1;
                    log::error!(
                        "Handler {} ('{}', {}) failed on '{}': {}",
                        subscription.id,
                        subscription.registered_by,
                        subscription.pattern,
                        event.topic(),
                        error
                    );
                }
                Ok(Err(_)) => {
                    report.failed += 1;
                    log::warn!(
                        "Handler {} ('{}', {}) exceeded its {:?} budget on '{}'",
                        subscription.id,
                        subscription.registered_by,
                        subscription.pattern,
                        self.budget,
                        event.topic()
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    log::error!(
                        "Handler {} ('{}', {}) panicked on '{}'",
                        subscription.id,
                        subscription.registered_by,
                        subscription.pattern,
                        event.topic()
                    );
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawFrame;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;

    fn event(topic: &str) -> Event {
        Event::from_frame(RawFrame::new(topic, "x"))
    }

    fn recording(calls: &Calls, name: &'static str) -> Box<dyn Handler> {
        let calls = calls.clone();
        Box::new(handler_fn(move |event: &Event, _ctx: &mut HandlerContext<'_>| {
            calls.lock().unwrap().push(format!("{name}:{}", event.topic()));
            Ok(())
        }))
    }

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::parse(raw).unwrap()
    }

    struct Stalling;

    #[async_trait]
    impl Handler for Stalling {
        async fn handle(
            &mut self,
            _event: &Event,
            _ctx: &mut HandlerContext<'_>,
        ) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let calls = Calls::default();
        let mut router = TopicRouter::new(Duration::from_secs(1));
        let mut registry = CorrelationRegistry::new();
        router.register(pattern("#"), "monitor", recording(&calls, "all"));
        router.register(pattern("PIR/MOTION_DETECTED"), "controller", recording(&calls, "exact"));
        router.register(pattern("PIR/+"), "bot", recording(&calls, "level"));
        router.register(pattern("TAKE_PICTURE"), "camera", recording(&calls, "camera"));

        let report = router
            .dispatch(&event("PIR/MOTION_DETECTED"), &mut HandlerContext::new(&mut registry))
            .await;

        assert_eq!(report, DispatchReport { matched: 3, failed: 0 });
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "all:PIR/MOTION_DETECTED",
                "exact:PIR/MOTION_DETECTED",
                "level:PIR/MOTION_DETECTED"
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let calls = Calls::default();
        let mut router = TopicRouter::new(Duration::from_secs(1));
        let mut registry = CorrelationRegistry::new();
        router.register(
            pattern("#"),
            "broken",
            Box::new(handler_fn(|_: &Event, _: &mut HandlerContext<'_>| {
                Err(HandlerError::msg("boom"))
            })),
        );
        router.register(
            pattern("#"),
            "panicky",
            Box::new(handler_fn(|_: &Event, _: &mut HandlerContext<'_>| {
                panic!("handler bug")
            })),
        );
        router.register(pattern("#"), "healthy", recording(&calls, "healthy"));

        let mut ctx = HandlerContext::new(&mut registry);
        let first = router.dispatch(&event("PIR/HEARTBEAT"), &mut ctx).await;
        let second = router.dispatch(&event("TAKE_PICTURE"), &mut ctx).await;

        assert_eq!(first, DispatchReport { matched: 3, failed: 2 });
        assert_eq!(second, DispatchReport { matched: 3, failed: 2 });
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["healthy:PIR/HEARTBEAT", "healthy:TAKE_PICTURE"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_handler_is_cut_off() {
        let calls = Calls::default();
        let mut router = TopicRouter::new(Duration::from_millis(100));
        let mut registry = CorrelationRegistry::new();
        router.register(pattern("PIR/#"), "slow", Box::new(Stalling));
        router.register(pattern("PIR/#"), "fast", recording(&calls, "fast"));

        let report = router
            .dispatch(&event("PIR/HEARTBEAT"), &mut HandlerContext::new(&mut registry))
            .await;

        assert_eq!(report, DispatchReport { matched: 2, failed: 1 });
        assert_eq!(*calls.lock().unwrap(), vec!["fast:PIR/HEARTBEAT"]);
    }

    #[tokio::test]
    async fn test_unmatched_event() {
        let mut router = TopicRouter::new(Duration::from_secs(1));
        let mut registry = CorrelationRegistry::new();
        router.register(pattern("PIR/+"), "bot", Box::new(ReplyCorrelator));

        let report = router
            .dispatch(&event("TAKE_PICTURE"), &mut HandlerContext::new(&mut registry))
            .await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(router.len(), 1);
        assert_eq!(router.subscriptions().next().unwrap().registered_by, "bot");
    }

    #[tokio::test]
    async fn test_reply_correlator_resolves() {
        let mut router = TopicRouter::new(Duration::from_secs(1));
        let mut registry = CorrelationRegistry::new();
        router.register(pattern("SEND_LATEST_PICTURES"), "bot", Box::new(ReplyCorrelator));

        let handle = registry
            .register(
                CorrelationKey::from("SEND_LATEST_PICTURES"),
                tokio::time::Instant::now() + Duration::from_secs(5),
            )
            .unwrap();

        let reply = Event::from_frame(RawFrame::new("SEND_LATEST_PICTURES", r#"["a.jpg","b.jpg"]"#));
        router
            .dispatch(&reply, &mut HandlerContext::new(&mut registry))
            .await;

        assert_eq!(handle.wait().await.unwrap(), br#"["a.jpg","b.jpg"]"#.to_vec());
    }
}

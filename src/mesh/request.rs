//! Issuing correlated requests and waiting for their replies.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::mesh::correlation::{CorrelationKey, ReplyHandle};
use crate::mesh::dispatcher::{Dispatcher, Job};
use crate::mesh::RequestError;
use crate::types::{Envelope, RequestRoute};

/// A request about to be published on a [`RequestRoute`].
#[derive(Debug, Clone)]
pub struct Request {
    route: RequestRoute,
    payload: Vec<u8>,
    scope: Option<String>,
    timeout: Option<Duration>,
}

impl Request {
    /// A request with an opaque payload, correlated by reply topic alone.
    pub fn new(route: RequestRoute, payload: impl Into<Vec<u8>>) -> Self {
        Request {
            route,
            payload: payload.into(),
            scope: None,
            timeout: None,
        }
    }

    /// A request carrying an envelope. Its correlation id, if any, scopes the key.
    pub fn envelope(route: RequestRoute, envelope: Envelope) -> Self {
        Request {
            route,
            scope: envelope.correlation_id.clone(),
            payload: envelope.to_bytes(),
            timeout: None,
        }
    }

    /// Like [`Request::envelope`], with a freshly generated correlation id.
    pub fn correlated(route: RequestRoute, envelope: Envelope) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        Self::envelope(route, envelope.with_correlation_id(Some(correlation_id)))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::for_topic(self.route.reply_topic, self.scope.as_deref())
    }

    pub fn route(&self) -> RequestRoute {
        self.route
    }
}

/// Registered-then-published form handed to the runtime.
#[derive(Debug)]
pub(crate) struct OutboundRequest {
    pub key: CorrelationKey,
    pub topic: String,
    pub payload: Vec<u8>,
    pub deadline: Instant,
}

/// Issues requests through a mesh runtime.
#[derive(Clone, Debug)]
pub struct Requester {
    dispatcher: Dispatcher,
    default_timeout: Duration,
}

impl Requester {
    pub(crate) fn new(dispatcher: Dispatcher, default_timeout: Duration) -> Self {
        Requester {
            dispatcher,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registers the request and publishes it.
    ///
    /// Both happen inside the runtime, registration first, so a reply can
    /// never overtake its waiter.
    pub async fn send(&self, request: Request) -> Result<PendingReply, RequestError> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let outbound = OutboundRequest {
            key: request.key(),
            topic: request.route.request_topic.to_string(),
            payload: request.payload,
            deadline: Instant::now() + timeout,
        };

        let (ack, acked) = oneshot::channel();
        self.dispatcher
            .submit(Job::Request {
                request: outbound,
                ack,
            })
            .map_err(|_| RequestError::ContextClosed)?;

        let handle = acked.await.map_err(|_| RequestError::ContextClosed)??;
        Ok(PendingReply {
            handle,
            dispatcher: self.dispatcher.clone(),
            finished: false,
        })
    }

    /// Sends the request and waits for its reply or its timeout.
    pub async fn request(&self, request: Request) -> Result<Vec<u8>, RequestError> {
        self.send(request).await?.wait().await
    }
}

/// An outstanding request. Dropping it before completion cancels it.
#[derive(Debug)]
pub struct PendingReply {
    handle: ReplyHandle,
    dispatcher: Dispatcher,
    finished: bool,
}

impl PendingReply {
    pub fn key(&self) -> &CorrelationKey {
        self.handle.key()
    }

    pub fn deadline(&self) -> Instant {
        self.handle.deadline()
    }

    pub async fn wait(mut self) -> Result<Vec<u8>, RequestError> {
        let outcome = self.handle.outcome().await;
        self.finished = true;
        outcome
    }

    /// Withdraws the request; a reply arriving later is treated as stale.
    pub fn cancel(self) {
        log::debug!("Cancelling request on '{}'", self.handle.key());
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let job = Job::Cancel {
            key: self.handle.key().clone(),
            id: self.handle.id(),
        };
        if self.dispatcher.submit(job).is_err() {
            log::debug!(
                "Request on '{}' abandoned after its runtime closed",
                self.handle.key()
            );
        }
    }
}

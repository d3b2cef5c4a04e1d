//! Transport adapter - one connection to the publish/subscribe bus.
//!
//! A [`BusClient`] owns its link exclusively. Inbound frames are read on the
//! client's own delivery task, turned into [`Event`]s and handed to a
//! [`Dispatcher`]; application code never runs on that task. When the link
//! drops the client reconnects according to its [`ReconnectPolicy`] and
//! re-issues every recorded subscription before delivering anything again.

mod broker;
mod link;
mod retry;
mod topic;

pub use broker::LocalBroker;
pub use link::{Connector, Link, LinkCommand};
pub use retry::{
    ExponentialBackoffStrategy, FixedIntervalStrategy, NoIntervalStrategy, ReconnectPolicy,
    RetryStrategy,
};
pub use topic::{TopicError, TopicPattern};

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::mesh::Dispatcher;
use crate::types::{Event, RawFrame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Bus at {address} refused the connection")]
    Refused { address: String },

    #[error("Bus at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Bus at {address} still unreachable after {attempts} attempt(s)")]
    Exhausted { address: String, attempts: usize },

    #[error("Bus client was closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Cannot publish on '{topic}': not connected")]
    NotConnected { topic: String },

    #[error("Cannot publish on '{topic}': link closed")]
    LinkClosed { topic: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub address: String,
    pub client_id: String,
}

struct ClientInner {
    address: String,
    client_id: String,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<mpsc::UnboundedSender<LinkCommand>>>,
    subscriptions: Mutex<Vec<String>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Re-sends every recorded pattern on a fresh link, then makes it live.
    fn attach(&self, commands: mpsc::UnboundedSender<LinkCommand>) {
        let subscriptions = lock(&self.subscriptions);
        for pattern in subscriptions.iter() {
            if commands.send(LinkCommand::Subscribe(pattern.clone())).is_err() {
                log::warn!(
                    "Bus client '{}' lost its link while restoring subscriptions",
                    self.client_id
                );
                break;
            }
        }

        let mut link = lock(&self.link);
        if self.is_closed() {
            return;
        }
        *link = Some(commands);
        self.state.send_replace(ConnectionState::Connected);
        log::debug!(
            "Bus client '{}' connected with {} subscription(s)",
            self.client_id,
            subscriptions.len()
        );
    }

    fn detach(&self) {
        lock(&self.link).take();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.detach();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// Cloneable handle to one bus connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Connects to the bus and starts the delivery task.
    ///
    /// Failed attempts are retried as the policy allows. With
    /// [`ReconnectPolicy::Never`] the first failure is returned as is.
    pub async fn connect(
        options: BusOptions,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        mut policy: ReconnectPolicy,
    ) -> Result<Self, ConnectionError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(ClientInner {
            address: options.address,
            client_id: options.client_id,
            state,
            link: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let link = establish(&inner, connector.as_ref(), &mut policy).await?;
        inner.attach(link.commands);
        log::info!(
            "Bus client '{}' connected to {}",
            inner.client_id,
            inner.address
        );

        tokio::spawn(deliver(
            inner.clone(),
            link.frames,
            connector,
            dispatcher,
            policy,
        ));

        Ok(BusClient { inner })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Records a pattern and forwards it to the live link, if any.
    ///
    /// Recorded patterns are re-issued after every reconnect.
    pub fn subscribe(&self, pattern: &TopicPattern) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        let raw = pattern.to_string();
        if subscriptions.contains(&raw) {
            return;
        }
        subscriptions.push(raw.clone());

        if let Some(commands) = lock(&self.inner.link).as_ref() {
            if commands.send(LinkCommand::Subscribe(raw)).is_err() {
                log::debug!(
                    "Subscription {} recorded; it will be sent once the link is back",
                    pattern
                );
            }
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner.subscriptions).clone()
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), PublishError> {
        if self.state() != ConnectionState::Connected {
            return Err(PublishError::NotConnected {
                topic: topic.to_string(),
            });
        }

        let link = lock(&self.inner.link);
        let commands = link.as_ref().ok_or_else(|| PublishError::NotConnected {
            topic: topic.to_string(),
        })?;

        commands
            .send(LinkCommand::Publish(RawFrame::new(topic, payload)))
            .map_err(|_| PublishError::LinkClosed {
                topic: topic.to_string(),
            })
    }

    /// Closes the connection for good.
    pub fn disconnect(&self) {
        if !self.inner.is_closed() {
            log::info!("Bus client '{}' disconnecting", self.inner.client_id);
        }
        self.inner.close();
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BusClient({}@{})", self.inner.client_id, self.inner.address)
    }
}

async fn establish(
    inner: &ClientInner,
    connector: &dyn Connector,
    policy: &mut ReconnectPolicy,
) -> Result<Link, ConnectionError> {
    let mut attempts = 0;

    loop {
        if inner.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let error = match connector.connect(&inner.address, &inner.client_id).await {
            Ok(link) => {
                if let ReconnectPolicy::Retry(strategy) = policy {
                    strategy.reset();
                }
                return Ok(link);
            }
            Err(error) => error,
        };
        attempts += 1;

        let strategy = match policy {
            ReconnectPolicy::Never => return Err(error),
            ReconnectPolicy::Retry(strategy) => strategy,
        };

        if strategy.max_retries().is_some_and(|max| attempts > max) {
            return Err(ConnectionError::Exhausted {
                address: inner.address.clone(),
                attempts,
            });
        }

        log::warn!(
            "Bus client '{}' attempt {} failed: {}",
            inner.client_id,
            attempts,
            error
        );
        match strategy.next_backoff() {
            Some(duration) => {
                log::debug!("Backoff for {:?}", duration);
                tokio::time::sleep(duration).await;
            }
            None => tokio::task::yield_now().await,
        }
    }
}

async fn deliver(
    inner: Arc<ClientInner>,
    frames: mpsc::UnboundedReceiver<RawFrame>,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    mut policy: ReconnectPolicy,
) {
    let mut frames = UnboundedReceiverStream::new(frames);

    loop {
        while let Some(frame) = frames.next().await {
            if dispatcher.handoff(Event::from_frame(frame)).is_err() {
                log::warn!(
                    "Bus client '{}' stops: its owning context is closed",
                    inner.client_id
                );
                inner.close();
                return;
            }
        }

        inner.detach();
        if inner.is_closed() {
            break;
        }

        inner.state.send_replace(ConnectionState::Reconnecting);
        log::warn!(
            "Bus client '{}' lost its connection to {}, reconnecting",
            inner.client_id,
            inner.address
        );

        match establish(&inner, connector.as_ref(), &mut policy).await {
            Ok(link) => {
                inner.attach(link.commands);
                frames = UnboundedReceiverStream::new(link.frames);
                log::info!("Bus client '{}' reconnected", inner.client_id);
            }
            Err(error) => {
                log::error!(
                    "Bus client '{}' gave up reconnecting: {}",
                    inner.client_id,
                    error
                );
                break;
            }
        }
    }

    inner.state.send_replace(ConnectionState::Disconnected);
    log::debug!("Bus client '{}' delivery stopped", inner.client_id);
}

//! Mesh - request/reply correlation and event dispatch over the bus.
//!
//! A [`Mesh`] is one component's view of the bus: a [`BusClient`], a
//! runtime task that owns the topic router and the correlation registry,
//! and the [`Dispatcher`] that carries work from the bus delivery task into
//! that runtime. It is built explicitly at start-up and passed around; there
//! is no global client.

pub mod correlation;
pub(crate) mod dispatcher;
pub mod request;
pub mod router;
mod runner;

pub use correlation::{CorrelationKey, CorrelationRegistry, ReplyHandle};
pub use dispatcher::Dispatcher;
pub(crate) use dispatcher::{Job, Mailbox};
pub use request::{PendingReply, Request, Requester};
pub use router::{
    DispatchReport, FnHandler, Handler, HandlerContext, HandlerError, Subscription, TopicRouter,
    handler_fn,
};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::bus::{BusClient, BusOptions, ConnectionError, Connector, PublishError, TopicError, TopicPattern};
use crate::config::MeshConfig;
use crate::types::RequestRoute;
use router::ReplyCorrelator;
use runner::Runtime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("No reply on '{key}' after {waited:?}")]
    Timeout {
        key: CorrelationKey,
        waited: Duration,
    },

    #[error("A request on '{key}' is already waiting for its reply")]
    Busy { key: CorrelationKey },

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("The owning context is closed")]
    ContextClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("The owning context is closed")]
    ContextClosed { topic: Option<String> },
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A participant that binds its handlers and producers to a mesh.
pub trait Component: Send + 'static {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError>;
}

pub struct Mesh {
    name: String,
    bus: BusClient,
    dispatcher: Dispatcher,
    requester: Requester,
    runtime: JoinHandle<()>,
}

impl Mesh {
    /// Connects to the bus and starts the runtime that owns handler state.
    pub async fn start(
        name: &str,
        config: &MeshConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Mesh, ConnectionError> {
        let (dispatcher, mailbox) = Dispatcher::channel();
        let options = BusOptions {
            address: config.bus_address.clone(),
            client_id: name.to_string(),
        };
        let bus = BusClient::connect(
            options,
            connector,
            dispatcher.clone(),
            config.reconnect_policy(),
        )
        .await?;

        let runtime = Runtime::new(name, mailbox, bus.clone(), config.handler_budget());
        let runtime = tokio::spawn(runtime.run());
        let requester = Requester::new(dispatcher.clone(), config.request_timeout());

        Ok(Mesh {
            name: name.to_string(),
            bus,
            dispatcher,
            requester,
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn requester(&self) -> Requester {
        self.requester.clone()
    }

    /// Routes events matching `pattern` to `handler` and subscribes to them.
    pub fn register<H: Handler>(&self, pattern: &str, handler: H) -> Result<(), MeshError> {
        let pattern = TopicPattern::parse(pattern)?;
        self.dispatcher.submit(Job::Register {
            pattern: pattern.clone(),
            registered_by: self.name.clone(),
            handler: Box::new(handler),
        })?;
        self.bus.subscribe(&pattern);
        Ok(())
    }

    /// Lets replies on the route's reply topic resolve pending requests.
    pub fn expect_replies(&self, route: RequestRoute) -> Result<(), MeshError> {
        self.register(route.reply_topic, ReplyCorrelator)
    }

    pub fn install<C: Component>(&self, component: C) -> Result<(), MeshError> {
        component.install(self)
    }

    pub async fn shutdown(self) {
        log::info!("Mesh '{}' shutting down", self.name);
        self.bus.disconnect();
        let _ = self.dispatcher.submit(Job::Shutdown);
        if let Err(error) = self.runtime.await {
            log::error!("Runtime '{}' ended abnormally: {}", self.name, error);
        }
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mesh({})", self.name)
    }
}

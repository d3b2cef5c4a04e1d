//! Cross-context dispatcher - the only bridge into a mesh runtime.

use tokio::sync::{mpsc, oneshot};

use crate::bus::TopicPattern;
use crate::mesh::correlation::{CorrelationKey, ReplyHandle};
use crate::mesh::request::OutboundRequest;
use crate::mesh::router::Handler;
use crate::mesh::{DispatchError, RequestError};
use crate::types::Event;

/// Work queued for the runtime that owns the router and the registry.
pub(crate) enum Job {
    Deliver(Event),
    Register {
        pattern: TopicPattern,
        registered_by: String,
        handler: Box<dyn Handler>,
    },
    Request {
        request: OutboundRequest,
        ack: oneshot::Sender<Result<ReplyHandle, RequestError>>,
    },
    Cancel {
        key: CorrelationKey,
        id: u64,
    },
    Expire,
    Shutdown,
}

pub(crate) type Mailbox = mpsc::UnboundedReceiver<Job>;

/// Cloneable sending side of a runtime's mailbox.
///
/// Jobs are processed in the order they were handed off.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Job>,
}

impl Dispatcher {
    pub(crate) fn channel() -> (Dispatcher, Mailbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Dispatcher { sender }, receiver)
    }

    /// Moves an inbound event into the owning runtime.
    pub fn handoff(&self, event: Event) -> Result<(), DispatchError> {
        self.submit(Job::Deliver(event)).map_err(|error| {
            log::warn!("Dropped event: {}", error);
            error
        })
    }

    /// Asks the runtime to time out overdue requests now.
    pub fn expire(&self) -> Result<(), DispatchError> {
        self.submit(Job::Expire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn submit(&self, job: Job) -> Result<(), DispatchError> {
        self.sender.send(job).map_err(|rejected| DispatchError::ContextClosed {
            topic: match rejected.0 {
                Job::Deliver(event) => Some(event.topic().to_string()),
                _ => None,
            },
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatcher(closed: {})", self.is_closed())
    }
}

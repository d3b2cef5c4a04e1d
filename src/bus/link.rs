//! The raw connection between a bus client and a broker.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::ConnectionError;
use crate::types::RawFrame;

/// Commands a client sends over its link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkCommand {
    Subscribe(String),
    Publish(RawFrame),
}

/// Both directions of one live connection.
///
/// The link is gone once `frames` yields `None`.
#[derive(Debug)]
pub struct Link {
    pub commands: mpsc::UnboundedSender<LinkCommand>,
    pub frames: mpsc::UnboundedReceiver<RawFrame>,
}

/// Opens links to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str, client_id: &str) -> Result<Link, ConnectionError>;
}

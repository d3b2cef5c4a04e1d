//! In-process broker used to run the mesh inside one process.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::bus::link::{Connector, Link, LinkCommand};
use crate::bus::topic::TopicPattern;
use crate::bus::ConnectionError;
use crate::types::RawFrame;

struct Session {
    client_id: String,
    patterns: Vec<TopicPattern>,
    sender: mpsc::UnboundedSender<RawFrame>,
}

#[derive(Clone)]
pub struct LocalBroker {
    sessions: Arc<DashMap<u64, Session>>,
    next_session: Arc<AtomicU64>,
    online: Arc<AtomicBool>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            next_session: Arc::new(AtomicU64::new(1)),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// While offline, new connections are refused.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Drops every live session, as a network outage would.
    pub fn drop_connections(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        log::warn!("Broker dropped {} session(s)", count);
        count
    }

    /// Delivers a frame once to every session with a matching pattern.
    pub fn publish(&self, frame: RawFrame) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.patterns.iter().any(|p| p.matches(&frame.topic))
                && session.sender.send(frame.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        log::trace!("Frame on '{}' delivered to {} session(s)", frame.topic, delivered);
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Patterns currently held by the sessions of a client.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().client_id == client_id)
            .flat_map(|entry| {
                entry
                    .value()
                    .patterns
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn subscribe(&self, session_id: u64, raw: &str) {
        let pattern = match TopicPattern::parse(raw) {
            Ok(pattern) => pattern,
            Err(error) => {
                log::warn!("Session {} sent invalid pattern: {}", session_id, error);
                return;
            }
        };

        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            if !session.patterns.contains(&pattern) {
                session.patterns.push(pattern);
            }
        }
    }

    async fn serve(self, session_id: u64, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                LinkCommand::Subscribe(pattern) => self.subscribe(session_id, &pattern),
                LinkCommand::Publish(frame) => {
                    if self.sessions.contains_key(&session_id) {
                        self.publish(frame);
                    }
                }
            }
        }
        self.sessions.remove(&session_id);
        log::debug!("Broker session {} closed", session_id);
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for LocalBroker {
    async fn connect(&self, address: &str, client_id: &str) -> Result<Link, ConnectionError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ConnectionError::Refused {
                address: address.to_string(),
            });
        }

        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.sessions.insert(
            session_id,
            Session {
                client_id: client_id.to_string(),
                patterns: Vec::new(),
                sender: frame_tx,
            },
        );
        tokio::spawn(self.clone().serve(session_id, command_rx));

        log::debug!(
            "Broker session {} opened for '{}' at {}",
            session_id,
            client_id,
            address
        );

        Ok(Link {
            commands: command_tx,
            frames: frame_rx,
        })
    }
}

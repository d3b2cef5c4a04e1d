//! Chat gateway - chat commands in, alerts and pictures out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::MissedTickBehavior;

use crate::bus::{BusClient, ConnectionState};
use crate::mesh::{
    Component, Handler, HandlerContext, HandlerError, Mesh, MeshError, Request, RequestError,
    Requester,
};
use crate::types::{Envelope, Event, LATEST_PICTURES, PIR_HEARTBEAT, PIR_MOTION_DETECTED};

/// Where the gateway's messages end up, e.g. a group chat.
#[async_trait]
pub trait ChatSink: Send + Sync + 'static {
    async fn send_text(&self, text: &str) -> anyhow::Result<()>;
    async fn send_photo(&self, path: &Path) -> anyhow::Result<()>;
}

/// Writes chat traffic to the log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl ChatSink for LogSink {
    async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        log::info!("[chat] {}", text);
        Ok(())
    }

    async fn send_photo(&self, path: &Path) -> anyhow::Result<()> {
        log::info!("[chat] <photo {}>", path.display());
        Ok(())
    }
}

pub const HELP_TEXT: &str = "Available commands:\n\
    /start - start a conversation with the bot\n\
    /help - show this help text\n\
    /photo - send the picture of the sea hut\n\
    /latestphoto [N] - send the N latest pictures (default 1)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Photo,
    LatestPhoto(usize),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let name = parts.next()?;
        Some(match name {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/photo" => Command::Photo,
            "/latestphoto" => {
                let count = parts.next().and_then(|n| n.parse().ok()).unwrap_or(1);
                Command::LatestPhoto(count)
            }
            other => Command::Unknown(other.to_string()),
        })
    }
}

/// Picture paths from a reply: an envelope's `data.pictures` or a bare JSON list.
pub fn reply_pictures(payload: &[u8]) -> Result<Vec<PathBuf>, serde_json::Error> {
    let mut value: Value = serde_json::from_slice(payload)?;
    if let Some(pictures) = value.pointer_mut("/data/pictures") {
        value = pictures.take();
    }
    let paths: Vec<String> = serde_json::from_value(value)?;
    Ok(paths.into_iter().map(PathBuf::from).collect())
}

/// Sends a picture, or tells the chat it is missing.
async fn send_picture(sink: &dyn ChatSink, path: &Path) -> anyhow::Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        sink.send_photo(path).await
    } else {
        log::error!("Picture missing: {}", path.display());
        sink.send_text("Oops! I could not find the picture.").await
    }
}

/// Runs chat commands against the mesh.
#[derive(Clone)]
pub struct Commands {
    sink: Arc<dyn ChatSink>,
    requester: Requester,
    default_picture: PathBuf,
}

impl Commands {
    pub fn new(
        sink: Arc<dyn ChatSink>,
        requester: Requester,
        default_picture: impl Into<PathBuf>,
    ) -> Self {
        Commands {
            sink,
            requester,
            default_picture: default_picture.into(),
        }
    }

    pub async fn run(&self, line: &str) -> anyhow::Result<()> {
        let Some(command) = Command::parse(line) else {
            return Ok(());
        };
        log::info!("Chat command {:?}", command);

        match command {
            Command::Start => {
                self.sink
                    .send_text("Welcome! Type /help to see what I can do.")
                    .await
            }
            Command::Help => self.sink.send_text(HELP_TEXT).await,
            Command::Photo => send_picture(self.sink.as_ref(), &self.default_picture).await,
            Command::LatestPhoto(count) => self.latest_photos(count).await,
            Command::Unknown(name) => {
                self.sink
                    .send_text(&format!("Unknown command {name}, try /help."))
                    .await
            }
        }
    }

    async fn latest_photos(&self, count: usize) -> anyhow::Result<()> {
        let envelope = Envelope::new("bot", "GET_LATEST_PICTURES").with_data("count", count);
        log::info!("Waiting for the {} latest picture(s)", count);

        let payload = match self
            .requester
            .request(Request::correlated(LATEST_PICTURES, envelope))
            .await
        {
            Ok(payload) => payload,
            Err(RequestError::Timeout { waited, .. }) => {
                log::warn!("No picture list after {:?}", waited);
                return self
                    .sink
                    .send_text("No response from the picture manager.")
                    .await;
            }
            Err(error) => {
                return self
                    .sink
                    .send_text(&format!("Could not ask for pictures: {error}"))
                    .await;
            }
        };

        let pictures = match reply_pictures(&payload) {
            Ok(pictures) => pictures,
            Err(error) => {
                log::error!("Unreadable picture list: {}", error);
                return self.sink.send_text("Could not read the picture list.").await;
            }
        };

        if pictures.is_empty() {
            return self.sink.send_text("No picture found.").await;
        }

        log::info!("Sending {} picture(s) (asked for {})", pictures.len(), count);
        for path in pictures {
            send_picture(self.sink.as_ref(), &path).await?;
        }
        Ok(())
    }
}

struct AlertHandler {
    sink: Arc<dyn ChatSink>,
    default_picture: PathBuf,
}

#[async_trait]
impl Handler for AlertHandler {
    async fn handle(
        &mut self,
        event: &Event,
        _ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        if event.topic() == PIR_MOTION_DETECTED {
            let envelope = event.envelope()?;
            let text = format!(
                "PIR sensor alert: {} detected at {}.",
                envelope.event,
                envelope.timestamp.to_rfc3339()
            );
            return self.sink.send_text(&text).await.map_err(HandlerError::Failed);
        }

        let text = format!("Bus event on {}: {}", event.topic(), event.payload_str());
        self.sink.send_text(&text).await.map_err(HandlerError::Failed)?;
        send_picture(self.sink.as_ref(), &self.default_picture)
            .await
            .map_err(HandlerError::Failed)
    }
}

async fn chat_heartbeat(sink: Arc<dyn ChatSink>, bus: BusClient, every: Duration) {
    if every.is_zero() {
        log::info!("Chat heartbeat disabled");
        return;
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if bus.state() == ConnectionState::Disconnected {
            break;
        }
        log::info!("Sending chat heartbeat");
        if let Err(error) = sink.send_text("Heartbeat").await {
            log::warn!("Chat heartbeat not sent: {}", error);
        }
    }
}

/// Pushes sensor events to the chat and accepts replies for chat requests.
pub struct ChatGateway {
    sink: Arc<dyn ChatSink>,
    default_picture: PathBuf,
    heartbeat: Option<Duration>,
}

impl ChatGateway {
    pub fn new(sink: Arc<dyn ChatSink>, default_picture: impl Into<PathBuf>) -> Self {
        ChatGateway {
            sink,
            default_picture: default_picture.into(),
            heartbeat: None,
        }
    }

    /// Also posts "Heartbeat" to the chat every `every`, starting right away.
    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat = Some(every);
        self
    }
}

impl Component for ChatGateway {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        mesh.expect_replies(LATEST_PICTURES)?;
        for topic in [PIR_MOTION_DETECTED, PIR_HEARTBEAT] {
            mesh.register(
                topic,
                AlertHandler {
                    sink: self.sink.clone(),
                    default_picture: self.default_picture.clone(),
                },
            )?;
        }
        if let Some(every) = self.heartbeat {
            tokio::spawn(chat_heartbeat(self.sink, mesh.bus().clone(), every));
        }
        Ok(())
    }
}

//! Picture manager - answers "latest N pictures" requests from the picture
//! folder and keeps it trimmed to the retention period.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeDelta};
use serde_json::Value;
use tokio::time::MissedTickBehavior;

use crate::bus::{BusClient, ConnectionState};
use crate::mesh::{Component, Handler, HandlerContext, HandlerError, Mesh, MeshError};
use crate::types::{Envelope, Event, LATEST_PICTURES};

/// Picture files are named after their capture time.
pub const PICTURE_NAME_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const PICTURE_EXTENSION: &str = ".jpg";

pub fn picture_name(taken_at: NaiveDateTime) -> String {
    format!("{}{}", taken_at.format(PICTURE_NAME_FORMAT), PICTURE_EXTENSION)
}

/// Capture time encoded in a picture file name, if it is one.
pub fn picture_time(file_name: &str) -> Option<NaiveDateTime> {
    let stem = file_name.strip_suffix(PICTURE_EXTENSION)?;
    // "YYYY-MM-DD_HHMMSS"
    if stem.len() != 17 {
        return None;
    }
    NaiveDateTime::parse_from_str(stem, PICTURE_NAME_FORMAT).ok()
}

/// Pictures in `folder` with their capture times. A missing folder has none.
async fn scan_pictures(folder: &Path) -> io::Result<Vec<(NaiveDateTime, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(folder).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            log::warn!("Picture folder {} does not exist", folder.display());
            return Ok(Vec::new());
        }
        Err(error) => return Err(error),
    };

    let mut pictures = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(taken_at) = name.to_str().and_then(picture_time) else {
            continue;
        };
        pictures.push((taken_at, entry.path()));
    }
    Ok(pictures)
}

/// Paths of the `n` most recent pictures in `folder`, newest first.
///
/// A missing folder yields no pictures.
pub async fn latest_pictures(folder: &Path, n: usize) -> io::Result<Vec<PathBuf>> {
    let mut pictures = scan_pictures(folder).await?;
    pictures.sort_by(|a, b| b.0.cmp(&a.0));
    let latest: Vec<PathBuf> = pictures.into_iter().take(n).map(|(_, path)| path).collect();
    log::info!("Found {} latest picture(s)", latest.len());
    Ok(latest)
}

/// Deletes every picture taken before `cutoff` and returns how many went.
///
/// Files that fail to delete are logged and skipped.
pub async fn delete_old_pictures(folder: &Path, cutoff: NaiveDateTime) -> io::Result<usize> {
    log::info!("Cleaning pictures taken before {}", cutoff);
    let mut deleted = 0;
    for (taken_at, path) in scan_pictures(folder).await? {
        if taken_at >= cutoff {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                deleted += 1;
                log::info!("Deleted {}", path.display());
            }
            Err(error) => log::error!("Could not delete {}: {}", path.display(), error),
        }
    }
    log::info!("Cleanup done, {} picture(s) deleted", deleted);
    Ok(deleted)
}

/// Periodically deletes pictures older than the retention period.
pub struct RetentionCleaner {
    folder: PathBuf,
    retention: TimeDelta,
    every: Duration,
}

impl RetentionCleaner {
    pub fn new(folder: impl Into<PathBuf>, retention_days: u32, every: Duration) -> Self {
        RetentionCleaner {
            folder: folder.into(),
            retention: TimeDelta::days(i64::from(retention_days)),
            every,
        }
    }

    pub async fn clean(&self) -> io::Result<usize> {
        let cutoff = Local::now().naive_local() - self.retention;
        delete_old_pictures(&self.folder, cutoff).await
    }

    async fn run(self, bus: BusClient) {
        if self.every.is_zero() {
            log::info!("Picture cleanup disabled");
            return;
        }

        let mut ticker = tokio::time::interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if bus.state() == ConnectionState::Disconnected {
                break;
            }
            if let Err(error) = self.clean().await {
                log::error!("Picture cleanup failed: {}", error);
            }
            log::info!("Next cleanup in {:?}", self.every);
        }
        log::info!("Picture cleanup stopped");
    }
}

/// How many pictures a request asks for.
///
/// Envelopes carry the count in `data.count`; bare payloads are the number itself.
fn requested_count(event: &Event) -> Result<(usize, Option<Envelope>), HandlerError> {
    if let Ok(envelope) = event.envelope() {
        let count = envelope
            .data
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        return Ok((count, Some(envelope)));
    }

    let raw = event.payload_str();
    let count = raw
        .trim()
        .parse::<usize>()
        .map_err(|_| HandlerError::msg(format!("not a picture count: '{}'", raw.trim())))?;
    Ok((count, None))
}

struct LatestPicturesResponder {
    folder: PathBuf,
    bus: BusClient,
}

#[async_trait]
impl Handler for LatestPicturesResponder {
    async fn handle(
        &mut self,
        event: &Event,
        _ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let (count, request) = requested_count(event)?;
        log::info!("Fetching the {} latest picture(s)", count);

        let pictures: Vec<String> = latest_pictures(&self.folder, count)
            .await
            .map_err(HandlerError::new)?
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        let sent = pictures.len();

        let reply = match request {
            Some(request) => Envelope::new("picture-manager", "LATEST_PICTURES")
                .with_data("pictures", pictures)
                .with_correlation_id(request.correlation_id)
                .to_bytes(),
            None => serde_json::to_vec(&pictures).map_err(HandlerError::new)?,
        };
        self.bus.publish(LATEST_PICTURES.reply_topic, reply)?;
        log::info!(
            "Sent {} picture(s) on '{}'",
            sent,
            LATEST_PICTURES.reply_topic
        );
        Ok(())
    }
}

pub struct PictureManager {
    folder: PathBuf,
    cleaner: Option<RetentionCleaner>,
}

impl PictureManager {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        PictureManager {
            folder: folder.into(),
            cleaner: None,
        }
    }

    /// Also deletes pictures older than `retention_days`, checking every `every`.
    pub fn with_retention(mut self, retention_days: u32, every: Duration) -> Self {
        self.cleaner = Some(RetentionCleaner::new(&self.folder, retention_days, every));
        self
    }
}

impl Component for PictureManager {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        log::info!("Picture folder: {}", self.folder.display());
        if let Some(cleaner) = self.cleaner {
            tokio::spawn(cleaner.run(mesh.bus().clone()));
        }
        mesh.register(
            LATEST_PICTURES.request_topic,
            LatestPicturesResponder {
                folder: self.folder,
                bus: mesh.bus().clone(),
            },
        )
    }
}

//! Camera node - captures a picture whenever the alarm is raised.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;

use crate::bus::BusClient;
use crate::components::controller::ALARM_CLEARED;
use crate::components::pictures::picture_name;
use crate::mesh::{Component, Handler, HandlerContext, HandlerError, Mesh, MeshError};
use crate::types::{Envelope, Event, LATEST_PICTURE_TAKEN, TAKE_PICTURE};

/// Writes one image to the given path.
#[async_trait]
pub trait Capture: Send + Sync + 'static {
    async fn capture(&self, path: &Path) -> anyhow::Result<()>;
}

/// Stands in for camera hardware by writing a placeholder image.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderCapture;

// SOI, APP0 "JFIF", EOI
const PLACEHOLDER_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

#[async_trait]
impl Capture for PlaceholderCapture {
    async fn capture(&self, path: &Path) -> anyhow::Result<()> {
        tokio::fs::write(path, PLACEHOLDER_JPEG).await?;
        Ok(())
    }
}

struct CaptureHandler {
    folder: PathBuf,
    capture: Arc<dyn Capture>,
    bus: BusClient,
}

impl CaptureHandler {
    async fn take_picture(&self) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.folder).await?;
        let path = self
            .folder
            .join(picture_name(Local::now().naive_local()));
        self.capture.capture(&path).await?;
        Ok(path)
    }
}

#[async_trait]
impl Handler for CaptureHandler {
    async fn handle(
        &mut self,
        event: &Event,
        _ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        if event.event_type() == ALARM_CLEARED {
            log::debug!("Alarm cleared, nothing to capture");
            return Ok(());
        }

        log::info!("{} received, capturing", TAKE_PICTURE);
        let path = self.take_picture().await.map_err(HandlerError::Failed)?;
        log::info!("Picture saved to {}", path.display());

        let taken = Envelope::new("camera", "PICTURE_TAKEN")
            .with_data("path", path.display().to_string());
        self.bus.publish(LATEST_PICTURE_TAKEN, taken.to_bytes())?;
        Ok(())
    }
}

pub struct Camera {
    folder: PathBuf,
    capture: Arc<dyn Capture>,
}

impl Camera {
    pub fn new(folder: impl Into<PathBuf>, capture: impl Capture) -> Self {
        Camera {
            folder: folder.into(),
            capture: Arc::new(capture),
        }
    }
}

impl Component for Camera {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        mesh.register(
            TAKE_PICTURE,
            CaptureHandler {
                folder: self.folder,
                capture: self.capture,
                bus: mesh.bus().clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBroker;
    use crate::components::controller::ALARM_TRIGGERED;
    use crate::components::pictures::latest_pictures;
    use crate::config::MeshConfig;
    use crate::mesh::handler_fn;
    use std::sync::Mutex;
    use std::time::Duration;

    struct BrokenCapture;

    #[async_trait]
    impl Capture for BrokenCapture {
        async fn capture(&self, _path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("camera unplugged")
        }
    }

    async fn announced(broker: &LocalBroker, camera: Camera) -> Arc<Mutex<Vec<String>>> {
        let config = MeshConfig::default();
        let camera_mesh = Mesh::start("camera", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        camera_mesh.install(camera).unwrap();

        let listener = Mesh::start("listener", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        let paths = Arc::new(Mutex::new(Vec::new()));
        {
            let paths = paths.clone();
            listener
                .register(
                    LATEST_PICTURE_TAKEN,
                    handler_fn(move |event: &Event, _: &mut HandlerContext<'_>| {
                        let envelope = event.envelope()?;
                        paths
                            .lock()
                            .unwrap()
                            .push(envelope.data["path"].as_str().unwrap_or_default().to_string());
                        Ok(())
                    }),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let controller = listener.bus();
        controller
            .publish(TAKE_PICTURE, Envelope::new("controller", ALARM_CLEARED).to_bytes())
            .unwrap();
        controller
            .publish(TAKE_PICTURE, Envelope::new("controller", ALARM_TRIGGERED).to_bytes())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        paths
    }

    #[tokio::test]
    async fn test_alarm_produces_a_picture() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("pics");
        let broker = LocalBroker::new();

        let paths = announced(&broker, Camera::new(&folder, PlaceholderCapture)).await;

        let saved = latest_pictures(&folder, 5).await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(*paths.lock().unwrap(), vec![saved[0].display().to_string()]);
    }

    #[tokio::test]
    async fn test_failed_capture_announces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let broker = LocalBroker::new();

        let paths = announced(&broker, Camera::new(dir.path(), BrokenCapture)).await;
        assert!(paths.lock().unwrap().is_empty());
    }
}

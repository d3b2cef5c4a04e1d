use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bus::TopicPattern;
use crate::mesh::{Component, HandlerContext, Mesh, MeshError, handler_fn};
use crate::types::Event;

/// Logs every message on the bus.
#[derive(Debug, Default, Clone)]
pub struct BusMonitor {
    seen: Arc<AtomicU64>,
}

impl BusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages observed so far.
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Component for BusMonitor {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        let seen = self.seen;
        mesh.register(
            TopicPattern::all().as_str(),
            handler_fn(move |event: &Event, _: &mut HandlerContext<'_>| {
                seen.fetch_add(1, Ordering::Relaxed);
                log::info!("Topic: {}, Message: {}", event.topic(), event.payload_str());
                Ok(())
            }),
        )
    }
}

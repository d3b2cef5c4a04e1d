//! Controller - raises and clears the alarm on motion events.

use async_trait::async_trait;

use crate::bus::BusClient;
use crate::mesh::{Component, Handler, HandlerContext, HandlerError, Mesh, MeshError};
use crate::types::{Envelope, Event, PIR_HEARTBEAT, PIR_MOTION_DETECTED, PIR_MOTION_ENDED, TAKE_PICTURE};

pub const ALARM_TRIGGERED: &str = "ALARM_TRIGGERED";
pub const ALARM_CLEARED: &str = "ALARM_CLEARED";

enum Reaction {
    Trigger,
    Clear,
    Heartbeat,
}

struct AlarmHandler {
    reaction: Reaction,
    bus: BusClient,
}

#[async_trait]
impl Handler for AlarmHandler {
    async fn handle(
        &mut self,
        event: &Event,
        _ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let envelope = event.envelope()?;

        let (alarm, reason) = match self.reaction {
            Reaction::Trigger => {
                log::info!("Motion detected at {}, triggering alarm", envelope.timestamp);
                (ALARM_TRIGGERED, "Motion detected")
            }
            Reaction::Clear => {
                log::info!("Motion ended at {}", envelope.timestamp);
                (ALARM_CLEARED, "Motion ended")
            }
            Reaction::Heartbeat => {
                log::info!(
                    "Heartbeat from '{}' at {}",
                    envelope.source,
                    envelope.timestamp
                );
                return Ok(());
            }
        };

        let command = Envelope::new("controller", alarm).with_data("reason", reason);
        self.bus.publish(TAKE_PICTURE, command.to_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Controller;

impl Component for Controller {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        for (topic, reaction) in [
            (PIR_MOTION_DETECTED, Reaction::Trigger),
            (PIR_MOTION_ENDED, Reaction::Clear),
            (PIR_HEARTBEAT, Reaction::Heartbeat),
        ] {
            mesh.register(
                topic,
                AlarmHandler {
                    reaction,
                    bus: mesh.bus().clone(),
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBroker;
    use crate::config::MeshConfig;
    use crate::mesh::handler_fn;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_motion_drives_the_alarm() {
        let broker = LocalBroker::new();
        let config = MeshConfig::default();
        let controller = Mesh::start("controller", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        controller.install(Controller).unwrap();

        let camera = Mesh::start("camera", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));
        {
            let commands = commands.clone();
            camera
                .register(
                    TAKE_PICTURE,
                    handler_fn(move |event: &Event, _: &mut HandlerContext<'_>| {
                        let envelope = event.envelope()?;
                        commands.lock().unwrap().push((
                            envelope.event,
                            envelope.data["reason"].as_str().unwrap_or_default().to_string(),
                        ));
                        Ok(())
                    }),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sensor = camera.bus();
        sensor
            .publish(PIR_MOTION_DETECTED, "not an envelope")
            .unwrap();
        sensor
            .publish(PIR_HEARTBEAT, Envelope::new("pir-sensor", "HEARTBEAT").to_bytes())
            .unwrap();
        sensor
            .publish(
                PIR_MOTION_DETECTED,
                Envelope::new("pir-sensor", "MOTION_DETECTED").to_bytes(),
            )
            .unwrap();
        sensor
            .publish(
                PIR_MOTION_ENDED,
                Envelope::new("pir-sensor", "MOTION_ENDED").to_bytes(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *commands.lock().unwrap(),
            vec![
                (ALARM_TRIGGERED.to_string(), "Motion detected".to_string()),
                (ALARM_CLEARED.to_string(), "Motion ended".to_string()),
            ]
        );
    }
}

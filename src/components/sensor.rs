//! Motion sensor node - turns probe samples into motion and heartbeat events.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::bus::{BusClient, ConnectionState};
use crate::mesh::{Component, Mesh, MeshError};
use crate::types::{Envelope, PIR_HEARTBEAT, PIR_MOTION_DETECTED, PIR_MOTION_ENDED};

/// A source of presence samples, e.g. a PIR input pin.
pub trait MotionProbe: Send + 'static {
    fn motion(&mut self) -> bool;
}

/// Random motion, for running the mesh without hardware.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    start_chance: f64,
    end_chance: f64,
    active: bool,
}

impl SimulatedProbe {
    pub fn new(start_chance: f64, end_chance: f64) -> Self {
        SimulatedProbe {
            start_chance,
            end_chance,
            active: false,
        }
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new(0.002, 0.05)
    }
}

impl MotionProbe for SimulatedProbe {
    fn motion(&mut self) -> bool {
        let roll = rand::random::<f64>();
        if self.active {
            self.active = roll >= self.end_chance;
        } else {
            self.active = roll < self.start_chance;
        }
        self.active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEdge {
    Detected,
    Ended,
}

impl MotionEdge {
    pub fn topic(self) -> &'static str {
        match self {
            MotionEdge::Detected => PIR_MOTION_DETECTED,
            MotionEdge::Ended => PIR_MOTION_ENDED,
        }
    }

    pub fn event(self) -> &'static str {
        match self {
            MotionEdge::Detected => "MOTION_DETECTED",
            MotionEdge::Ended => "MOTION_ENDED",
        }
    }
}

/// Reports only changes between consecutive samples.
#[derive(Debug, Default)]
pub struct MotionTracker {
    active: bool,
}

impl MotionTracker {
    pub fn update(&mut self, motion: bool) -> Option<MotionEdge> {
        if motion == self.active {
            return None;
        }
        self.active = motion;
        Some(if motion {
            MotionEdge::Detected
        } else {
            MotionEdge::Ended
        })
    }
}

const SOURCE: &str = "pir-sensor";

pub struct MotionSensor {
    probe: Box<dyn MotionProbe>,
    poll: Duration,
    heartbeat: Duration,
}

impl MotionSensor {
    pub fn new(probe: impl MotionProbe, poll: Duration, heartbeat: Duration) -> Self {
        MotionSensor {
            probe: Box::new(probe),
            poll,
            heartbeat,
        }
    }

    async fn run(mut self, bus: BusClient) {
        log::info!("Motion sensor polling every {:?}", self.poll);
        let mut tracker = MotionTracker::default();
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heartbeat = Instant::now();

        loop {
            ticker.tick().await;
            if bus.state() == ConnectionState::Disconnected {
                break;
            }

            if last_heartbeat.elapsed() >= self.heartbeat {
                let envelope = Envelope::new(SOURCE, "HEARTBEAT");
                match bus.publish(PIR_HEARTBEAT, envelope.to_bytes()) {
                    Ok(()) => log::info!("Sent heartbeat"),
                    Err(error) => log::warn!("Heartbeat not sent: {}", error),
                }
                last_heartbeat = Instant::now();
            }

            if let Some(edge) = tracker.update(self.probe.motion()) {
                log::info!("{:?}", edge);
                let envelope = Envelope::new(SOURCE, edge.event());
                if let Err(error) = bus.publish(edge.topic(), envelope.to_bytes()) {
                    log::warn!("{} not sent: {}", edge.event(), error);
                }
            }
        }

        log::info!("Motion sensor stopped");
    }
}

impl Component for MotionSensor {
    fn install(self, mesh: &Mesh) -> Result<(), MeshError> {
        tokio::spawn(self.run(mesh.bus().clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBroker, TopicPattern};
    use crate::config::MeshConfig;
    use crate::mesh::{HandlerContext, handler_fn};
    use crate::types::Event;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptedProbe(VecDeque<bool>);

    impl MotionProbe for ScriptedProbe {
        fn motion(&mut self) -> bool {
            self.0.pop_front().unwrap_or(false)
        }
    }

    #[test]
    fn test_tracker_reports_edges_only() {
        let mut tracker = MotionTracker::default();
        let edges: Vec<_> = [false, true, true, true, false, false, true]
            .into_iter()
            .filter_map(|sample| tracker.update(sample))
            .collect();
        assert_eq!(
            edges,
            vec![MotionEdge::Detected, MotionEdge::Ended, MotionEdge::Detected]
        );
    }

    #[test]
    fn test_simulated_probe_extremes() {
        let mut always = SimulatedProbe::new(1.0, 0.0);
        assert!((0..10).all(|_| always.motion()));

        let mut never = SimulatedProbe::new(0.0, 1.0);
        assert!((0..10).all(|_| !never.motion()));
    }

    #[tokio::test]
    async fn test_sensor_publishes_edges() {
        let broker = LocalBroker::new();
        let config = MeshConfig::default();
        let observer = Mesh::start("observer", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            observer
                .register(
                    TopicPattern::all().as_str(),
                    handler_fn(move |event: &Event, _: &mut HandlerContext<'_>| {
                        seen.lock()
                            .unwrap()
                            .push(format!("{} {}", event.topic(), event.event_type()));
                        Ok(())
                    }),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sensor = Mesh::start("pir-sensor", &config, Arc::new(broker.clone()))
            .await
            .unwrap();
        let probe = ScriptedProbe(VecDeque::from([false, true, true, false]));
        sensor
            .install(MotionSensor::new(
                probe,
                Duration::from_millis(5),
                Duration::from_secs(3600),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "PIR/MOTION_DETECTED MOTION_DETECTED",
                "PIR/MOTION_ENDED MOTION_ENDED"
            ]
        );
        sensor.shutdown().await;
    }
}

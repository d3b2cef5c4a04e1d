//! The mesh participants: sensor, controller, camera, picture manager, chat
//! gateway and bus monitor. Each one is a [`Component`](crate::mesh::Component)
//! installed on its own [`Mesh`](crate::mesh::Mesh).

pub mod camera;
pub mod controller;
pub mod gateway;
pub mod monitor;
pub mod pictures;
pub mod sensor;

pub use camera::{Camera, Capture, PlaceholderCapture};
pub use controller::Controller;
pub use gateway::{ChatGateway, ChatSink, Command, Commands, LogSink};
pub use monitor::BusMonitor;
pub use pictures::{PictureManager, RetentionCleaner, delete_old_pictures, latest_pictures};
pub use sensor::{MotionProbe, MotionSensor, SimulatedProbe};

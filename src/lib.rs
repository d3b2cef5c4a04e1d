//! SeaGuard - request/reply correlation and event dispatch for a small
//! publish/subscribe home-monitoring mesh.
//!
//! A [`BusClient`] reads frames on its own task and hands them to a
//! [`Dispatcher`]; each [`Mesh`] runtime then routes them to its handlers and
//! resolves pending requests, so no application code runs on the transport.

pub mod bus;
pub mod components;
pub mod config;
pub mod mesh;
pub mod types;

pub use bus::{BusClient, ConnectionError, ConnectionState, LocalBroker, PublishError, TopicPattern};
pub use config::MeshConfig;
pub use mesh::{Component, Dispatcher, Mesh, MeshError, Request, RequestError, Requester};
pub use types::{Envelope, Event};

pub use async_trait::async_trait;

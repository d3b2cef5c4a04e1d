//! Mesh runtime - the single owner of router and registry state.

use std::time::Duration;

use tokio::time::Instant;

use crate::bus::BusClient;
use crate::mesh::correlation::{CorrelationRegistry, ReplyHandle};
use crate::mesh::dispatcher::{Job, Mailbox};
use crate::mesh::request::OutboundRequest;
use crate::mesh::router::{HandlerContext, TopicRouter};
use crate::mesh::RequestError;

pub(crate) struct Runtime {
    name: String,
    router: TopicRouter,
    registry: CorrelationRegistry,
    mailbox: Mailbox,
    bus: BusClient,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Runtime {
    pub fn new(name: &str, mailbox: Mailbox, bus: BusClient, handler_budget: Duration) -> Self {
        Runtime {
            name: name.to_string(),
            router: TopicRouter::new(handler_budget),
            registry: CorrelationRegistry::new(),
            mailbox,
            bus,
        }
    }

    pub async fn run(mut self) {
        log::debug!("Runtime '{}' started", self.name);

        loop {
            let next_deadline = self.registry.next_deadline();
            tokio::select! {
                biased;
                job = self.mailbox.recv() => match job {
                    Some(Job::Shutdown) | None => break,
                    Some(job) => self.process(job).await,
                },
                _ = deadline_elapsed(next_deadline) => {
                    self.registry.expire();
                }
            }
        }

        self.mailbox.close();
        let mut dropped = 0;
        while let Ok(job) = self.mailbox.try_recv() {
            if let Job::Deliver(event) = job {
                log::warn!(
                    "Runtime '{}' closed, dropped event on '{}'",
                    self.name,
                    event.topic()
                );
                dropped += 1;
            }
        }
        let abandoned = self.registry.close_all();
        log::debug!(
            "Runtime '{}' stopped ({} pending request(s) abandoned, {} event(s) dropped)",
            self.name,
            abandoned,
            dropped
        );
    }

    async fn process(&mut self, job: Job) {
        match job {
            Job::Deliver(event) => {
                self.registry.expire();
                let mut ctx = HandlerContext::new(&mut self.registry);
                let report = self.router.dispatch(&event, &mut ctx).await;
                if report.matched == 0 {
                    log::debug!(
                        "Runtime '{}' has no handler for '{}'",
                        self.name,
                        event.topic()
                    );
                }
            }
            Job::Register {
                pattern,
                registered_by,
                handler,
            } => {
                self.router.register(pattern, &registered_by, handler);
            }
            Job::Request { request, ack } => {
                let started = self.start_request(request);
                if let Err(Ok(handle)) = ack.send(started) {
                    // requester went away before it could wait
                    self.registry.cancel(handle.key(), handle.id());
                }
            }
            Job::Cancel { key, id } => {
                self.registry.cancel(&key, id);
            }
            Job::Expire => {
                self.registry.expire();
            }
            Job::Shutdown => {}
        }
    }

    fn start_request(&mut self, request: OutboundRequest) -> Result<ReplyHandle, RequestError> {
        let handle = self.registry.register(request.key.clone(), request.deadline)?;

        if let Err(error) = self.bus.publish(&request.topic, request.payload) {
            log::warn!(
                "Request on '{}' not sent: {}",
                request.key,
                error
            );
            self.registry.cancel(&request.key, handle.id());
            return Err(RequestError::Publish(error));
        }

        log::debug!("Request published on '{}'", request.topic);
        Ok(handle)
    }
}

//! Queue consumer lifecycle.
//!
//! A consumer is created in `Binding` while the broker sets up the flow,
//! moves to `Consuming` on the bind notice and ends in `Stopped`. Only a
//! `Consuming` consumer can track deliveries or queue subscriptions.

use chrono::{DateTime, Local};
use statum::{machine, state};
use tracing::{debug, info};

#[state]
#[derive(Debug, Clone)]
pub enum ConsumerState {
    Binding,
    Consuming,
    Stopped,
}

#[machine]
#[derive(Debug)]
pub struct QueueConsumer<S: ConsumerState> {
    queue: String,
    subscriptions: Vec<String>,
    delivered: u64,
    bound_at: Option<DateTime<Local>>,
}

impl<S: ConsumerState> QueueConsumer<S> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl QueueConsumer<Binding> {
    pub fn create(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        debug!("Binding consumer to queue {}", queue);
        Self::new(queue, Vec::new(), 0, None)
    }

    pub fn bound(mut self) -> QueueConsumer<Consuming> {
        self.bound_at = Some(Local::now());
        info!("Consumer bound to queue {}", self.queue);
        self.transition()
    }

    pub fn abandon(self) -> QueueConsumer<Stopped> {
        debug!("Binding to queue {} abandoned", self.queue);
        self.transition()
    }
}

impl QueueConsumer<Consuming> {
    pub fn record_delivery(&mut self) {
        self.delivered += 1;
    }

    pub fn add_subscription(&mut self, filter: &str) {
        if !self.subscriptions.iter().any(|f| f == filter) {
            self.subscriptions.push(filter.to_string());
        }
    }

    pub fn remove_subscription(&mut self, filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|f| f != filter);
        self.subscriptions.len() != before
    }

    pub fn stop(self) -> QueueConsumer<Stopped> {
        info!(
            "Consumer on queue {} stopped after {} messages",
            self.queue, self.delivered
        );
        self.transition()
    }
}

impl QueueConsumer<Stopped> {
    pub fn summary(&self) -> String {
        match self.bound_at {
            Some(at) => format!(
                "{}: {} messages since {}",
                self.queue,
                self.delivered,
                at.format("%H:%M:%S")
            ),
            None => format!("{}: never bound", self.queue),
        }
    }
}

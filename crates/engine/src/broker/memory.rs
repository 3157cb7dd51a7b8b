//! In-process broker for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Broker, BrokerError, Delivery, MessageHeaders, QueueMessage, QueueTopology};

/// A message routed to a dead-letter queue, with the reason it was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub original_queue: String,
    pub reason: String,
    pub message: QueueMessage,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<QueueMessage>>,
    in_flight: HashMap<String, Delivery>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
    acked: usize,
    next_tag: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.len())
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total acknowledged deliveries.
    pub fn acked(&self) -> usize {
        self.lock().acked
    }

    pub fn dead_letters(&self, dead_letter_queue: &str) -> Vec<DeadLetter> {
        self.lock()
            .dead_letters
            .get(dead_letter_queue)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn settle(state: &mut State, delivery: &Delivery) -> Result<(), BrokerError> {
        state
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.queues.entry(topology.queue.clone()).or_default();
        state
            .dead_letters
            .entry(topology.dead_letter_queue.clone())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<(), BrokerError> {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut state = self.lock();
        let mut deliveries = Vec::new();

        while deliveries.len() < max {
            let Some(message) = state.queues.get_mut(queue).and_then(|q| q.pop_front()) else {
                break;
            };
            state.next_tag += 1;
            let delivery = Delivery {
                queue: queue.to_string(),
                tag: state.next_tag.to_string(),
                message,
            };
            state.in_flight.insert(delivery.tag.clone(), delivery.clone());
            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::settle(&mut state, delivery)?;
        state.acked += 1;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, headers: MessageHeaders) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::settle(&mut state, delivery)?;
        state
            .queues
            .entry(delivery.queue.clone())
            .or_default()
            .push_back(QueueMessage {
                payload: delivery.message.payload.clone(),
                headers,
            });
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::settle(&mut state, delivery)?;
        state
            .dead_letters
            .entry(dead_letter_queue.to_string())
            .or_default()
            .push(DeadLetter {
                original_queue: delivery.queue.clone(),
                reason: reason.to_string(),
                message: delivery.message.clone(),
            });
        Ok(())
    }
}

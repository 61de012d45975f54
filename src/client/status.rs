use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use futures::{prelude::*, task::AtomicTask};
use parking_lot::{Mutex, RwLock};

use error::NatsError;

/// Lifecycle events the connection broadcasts to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// Lost the server at this address; reconnection is under way.
    Disconnect(String),
    /// Re-established on this address, subscriptions replayed.
    Reconnect(String),
    /// The gossiped cluster topology changed the server pool.
    ServersChanged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// The current server announced lame-duck mode.
    LameDuck,
    /// A non-fatal error the connection absorbed.
    Error(NatsError),
}

#[derive(Debug)]
struct ConsumerQueue {
    events: Mutex<VecDeque<StatusEvent>>,
    task: AtomicTask,
    capacity: usize,
}

/// Fan-out of status events: one bounded queue per consumer, drop-oldest
/// under backpressure, so a stalled observer never wedges the handler.
/// Subscribers only see events published after they joined.
#[derive(Debug, Default)]
pub(crate) struct StatusBus {
    consumers: RwLock<Vec<Weak<ConsumerQueue>>>,
}

impl StatusBus {
    pub fn new() -> Self {
        StatusBus::default()
    }

    pub fn publish(&self, event: StatusEvent) {
        debug!(target: "natrix", "Status event: {:?}", event);
        let consumers = self.consumers.read();
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            {
                let mut events = consumer.events.lock();
                if events.len() == consumer.capacity {
                    events.pop_front();
                }
                events.push_back(event.clone());
            }
            consumer.task.notify();
        }
    }

    pub fn subscribe(&self, capacity: usize) -> StatusStream {
        let queue = Arc::new(ConsumerQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            task: AtomicTask::new(),
            capacity,
        });

        let mut consumers = self.consumers.write();
        consumers.retain(|c| c.upgrade().is_some());
        consumers.push(Arc::downgrade(&queue));

        StatusStream { queue }
    }
}

/// A consumer's view of the status bus.
#[derive(Debug)]
pub struct StatusStream {
    queue: Arc<ConsumerQueue>,
}

impl Stream for StatusStream {
    type Item = StatusEvent;
    type Error = NatsError;

    fn poll(&mut self) -> Poll<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.queue.events.lock().pop_front() {
            return Ok(Async::Ready(Some(event)));
        }

        self.queue.task.register();
        // Re-check after registering so a publish racing the register is
        // not lost.
        match self.queue.events.lock().pop_front() {
            Some(event) => Ok(Async::Ready(Some(event))),
            None => Ok(Async::NotReady),
        }
    }
}

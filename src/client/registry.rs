use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{prelude::*, sync::mpsc};
use parking_lot::RwLock;

use error::NatsError;
use protocol::commands::{Message, SubCommand, UnsubCommand};
use protocol::Op;

/// One registered subscription: the wire identity plus delivery
/// accounting and the sink feeding the consumer's stream.
#[derive(Debug)]
struct SubscriptionSink {
    subject: String,
    queue_group: Option<String>,
    tx: mpsc::Sender<Result<Message, NatsError>>,
    received: u64,
    max: Option<u64>,
    draining: bool,
    generation: u64,
    awaiting_first: bool,
}

/// What became of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Dispatch {
    Delivered,
    /// Delivered its last message and removed itself.
    Finished,
    /// The consumer's buffer was full; the message is gone.
    Overflowed,
    /// No such sid, e.g. a message racing an unsubscribe. Dropped.
    Unknown,
}

/// Outcome of arming an auto-unsubscribe threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SetMax {
    Armed,
    /// Already at or past the threshold, record removed.
    RemovedNow,
    Unknown,
}

/// Maps server-side sids to local consumers. Shared between the protocol
/// handler and user-thread calls; every mutation happens under the lock.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
    subs: RwLock<HashMap<u64, SubscriptionSink>>,
    next_sid: AtomicUsize,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        SubscriptionRegistry {
            subs: RwLock::new(HashMap::new()),
            next_sid: AtomicUsize::new(1),
            capacity,
        }
    }

    /// Hands out the next sid without installing a record, for wire-level
    /// subscriptions the registry should not dispatch (the request mux).
    pub fn allocate_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::SeqCst) as u64
    }

    pub fn register(
        &self,
        subject: String,
        queue_group: Option<String>,
        max: Option<u64>,
        generation: u64,
    ) -> (u64, SubscriptionStream) {
        let sid = self.allocate_sid();
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subs.write().insert(
            sid,
            SubscriptionSink {
                subject,
                queue_group,
                tx,
                received: 0,
                max,
                draining: false,
                generation,
                awaiting_first: true,
            },
        );

        (sid, SubscriptionStream { sid, rx })
    }

    /// Routes a message to its consumer, enforcing the auto-unsubscribe
    /// threshold: the record disappears the moment its last allowed
    /// message went out.
    pub fn dispatch(&self, msg: Message) -> Dispatch {
        let sid = msg.sid;
        let mut subs = self.subs.write();

        let (outcome, remove) = match subs.get_mut(&sid) {
            None => (Dispatch::Unknown, false),
            Some(sub) => {
                sub.received += 1;
                sub.awaiting_first = false;
                let overflowed = sub.tx.try_send(Ok(msg)).is_err();
                let finished = sub.max.map(|max| sub.received >= max).unwrap_or(false);
                let outcome = if overflowed {
                    Dispatch::Overflowed
                } else if finished {
                    Dispatch::Finished
                } else {
                    Dispatch::Delivered
                };
                (outcome, finished)
            }
        };

        if remove {
            subs.remove(&sid);
        }

        outcome
    }

    /// Applies `unsubscribe(max)`: arms the threshold, or removes the
    /// record outright when the count is already spent.
    pub fn set_max(&self, sid: u64, max: u64) -> SetMax {
        let mut subs = self.subs.write();
        let remove = match subs.get_mut(&sid) {
            None => return SetMax::Unknown,
            Some(sub) => {
                sub.max = Some(max);
                sub.received >= max
            }
        };

        if remove {
            subs.remove(&sid);
            SetMax::RemovedNow
        } else {
            SetMax::Armed
        }
    }

    pub fn remove(&self, sid: u64) -> bool {
        self.subs.write().remove(&sid).is_some()
    }

    pub fn mark_draining(&self, sid: u64) -> bool {
        match self.subs.write().get_mut(&sid) {
            Some(sub) => {
                sub.draining = true;
                true
            }
            None => false,
        }
    }

    /// Fires an inactivity deadline: if nothing arrived yet, the consumer
    /// sees a `Timeout` error and the record is gone.
    pub fn fire_inactivity(&self, sid: u64) {
        let mut subs = self.subs.write();
        let fire = subs
            .get(&sid)
            .map(|sub| sub.awaiting_first && !sub.draining)
            .unwrap_or(false);
        if fire {
            if let Some(mut sub) = subs.remove(&sid) {
                let _ = sub.tx.try_send(Err(NatsError::Timeout));
            }
        }
    }

    /// Live sids in registration order.
    pub fn sids(&self) -> Vec<u64> {
        let mut sids: Vec<u64> = self.subs.read().keys().cloned().collect();
        sids.sort();
        sids
    }

    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    /// Re-registration commands for a fresh connection generation, in
    /// original registration order: a `SUB` per record, then an `UNSUB`
    /// with the remaining allowance for capped records.
    pub fn replay_entries(&self, generation: u64) -> Vec<(u64, Vec<Op>)> {
        let mut subs = self.subs.write();
        let mut entries: Vec<(u64, Vec<Op>)> = subs
            .iter_mut()
            .map(|(&sid, sub)| {
                sub.generation = generation;
                let mut ops = vec![Op::SUB(SubCommand {
                    subject: sub.subject.clone(),
                    queue_group: sub.queue_group.clone(),
                    sid,
                })];
                if let Some(max) = sub.max {
                    let remaining = max.saturating_sub(sub.received).max(1);
                    ops.push(Op::UNSUB(UnsubCommand {
                        sid,
                        max_msgs: Some(remaining),
                    }));
                }
                (sid, ops)
            })
            .collect();

        entries.sort_by_key(|&(sid, _)| sid);
        entries
    }

    /// Drops every sink, closing the consumer streams once buffered
    /// messages are drained.
    pub fn close_all(&self) {
        self.subs.write().clear();
    }
}

/// The lazy message sequence a subscriber consumes. Yields messages until
/// unsubscribe, drain or an error such as an inactivity timeout ends it.
#[derive(Debug)]
pub struct SubscriptionStream {
    sid: u64,
    rx: mpsc::Receiver<Result<Message, NatsError>>,
}

impl SubscriptionStream {
    pub fn sid(&self) -> u64 {
        self.sid
    }
}

impl Stream for SubscriptionStream {
    type Item = Message;
    type Error = NatsError;

    fn poll(&mut self) -> Poll<Option<Self::Item>, Self::Error> {
        match self.rx.poll() {
            Ok(Async::Ready(Some(Ok(msg)))) => Ok(Async::Ready(Some(msg))),
            Ok(Async::Ready(Some(Err(e)))) => Err(e),
            Ok(Async::Ready(None)) => Ok(Async::Ready(None)),
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Err(()) => Err(NatsError::InnerBrokenChain),
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    fn msg(sid: u64, body: &'static str) -> Message {
        Message::builder()
            .subject("test.subject")
            .sid(sid)
            .payload(body)
            .build()
            .unwrap()
    }

    #[test]
    fn it_allocates_monotonic_sids() {
        let registry = SubscriptionRegistry::new(8);
        let (first, _a) = registry.register("a".into(), None, None, 1);
        let (second, _b) = registry.register("b".into(), None, None, 1);
        assert!(second > first);
    }

    #[test]
    fn it_dispatches_to_the_right_sink() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, stream) = registry.register("a".into(), None, None, 1);
        assert_eq!(registry.dispatch(msg(sid, "hello")), Dispatch::Delivered);

        registry.remove(sid);
        let collected = stream.collect().wait().unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].payload, "hello");
    }

    #[test]
    fn it_discards_messages_for_unknown_sids() {
        let registry = SubscriptionRegistry::new(8);
        assert_eq!(registry.dispatch(msg(42, "hello")), Dispatch::Unknown);
    }

    #[test]
    fn it_enforces_the_max_threshold() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, stream) = registry.register("a".into(), None, Some(2), 1);

        assert_eq!(registry.dispatch(msg(sid, "one")), Dispatch::Delivered);
        assert_eq!(registry.dispatch(msg(sid, "two")), Dispatch::Finished);
        assert_eq!(registry.dispatch(msg(sid, "three")), Dispatch::Unknown);

        let collected = stream.collect().wait().unwrap();
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn it_removes_immediately_when_max_is_already_spent() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, _stream) = registry.register("a".into(), None, None, 1);
        registry.dispatch(msg(sid, "one"));
        registry.dispatch(msg(sid, "two"));

        assert_eq!(registry.set_max(sid, 2), SetMax::RemovedNow);
        assert_eq!(registry.set_max(sid, 2), SetMax::Unknown);
    }

    #[test]
    fn it_arms_max_for_future_messages() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, _stream) = registry.register("a".into(), None, None, 1);
        registry.dispatch(msg(sid, "one"));

        assert_eq!(registry.set_max(sid, 3), SetMax::Armed);
        registry.dispatch(msg(sid, "two"));
        assert_eq!(registry.dispatch(msg(sid, "three")), Dispatch::Finished);
    }

    #[test]
    fn it_times_out_inactive_subscriptions() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, stream) = registry.register("a".into(), None, None, 1);

        registry.fire_inactivity(sid);
        assert_eq!(registry.len(), 0);

        match stream.collect().wait() {
            Err(NatsError::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn it_disarms_the_inactivity_timer_after_delivery() {
        let registry = SubscriptionRegistry::new(8);
        let (sid, _stream) = registry.register("a".into(), None, None, 1);
        registry.dispatch(msg(sid, "one"));

        registry.fire_inactivity(sid);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn it_replays_in_registration_order_with_remaining_allowances() {
        let registry = SubscriptionRegistry::new(8);
        let (first, _a) = registry.register("a".into(), None, None, 1);
        let (second, _b) = registry.register("b".into(), Some("workers".into()), Some(5), 1);
        registry.dispatch(msg(second, "one"));

        let entries = registry.replay_entries(2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, first);
        assert_eq!(entries[1].0, second);

        match entries[1].1[..] {
            [Op::SUB(ref sub), Op::UNSUB(ref unsub)] => {
                assert_eq!(sub.queue_group.as_ref().unwrap(), "workers");
                assert_eq!(unsub.max_msgs, Some(4));
            }
            ref ops => panic!("unexpected replay ops {:?}", ops),
        }
    }
}

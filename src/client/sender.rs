use std::collections::VecDeque;
use std::sync::Arc;

use futures::{
    future,
    prelude::*,
    sync::{mpsc, oneshot},
    task::{self, Task},
};
use parking_lot::Mutex;

use error::NatsError;
use protocol::Op;

use super::NatsSink;

#[derive(Debug)]
struct QueueInner {
    frames: VecDeque<Op>,
    queued_bytes: usize,
    paused: bool,
    closed: bool,
    writer: Option<Task>,
}

/// What happened to a frame handed to [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Enqueue {
    Queued,
    /// The reconnect replay buffer was full; the frame is gone and the
    /// caller should say so on the status bus.
    Dropped,
}

/// The outbound frame queue shared between user-facing calls and the
/// writer task of the current connection generation.
///
/// While connected, `push` refuses frames beyond `high_water`. While
/// paused for a reconnect, the smaller `replay_buffer` bound applies and
/// overflowing frames are dropped instead of erroring the publisher.
#[derive(Debug, Clone)]
pub(crate) struct OutboundQueue {
    inner: Arc<Mutex<QueueInner>>,
    high_water: usize,
    replay_buffer: usize,
}

impl OutboundQueue {
    /// Starts paused; the first successful handshake resumes it.
    pub fn new(high_water: usize, replay_buffer: usize) -> Self {
        OutboundQueue {
            inner: Arc::new(Mutex::new(QueueInner {
                frames: VecDeque::new(),
                queued_bytes: 0,
                paused: true,
                closed: false,
                writer: None,
            })),
            high_water,
            replay_buffer,
        }
    }

    pub fn push(&self, op: Op) -> Result<Enqueue, NatsError> {
        let len = op.encoded_len();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NatsError::ConnectionClosed);
        }

        if inner.paused {
            if inner.queued_bytes + len > self.replay_buffer {
                return Ok(Enqueue::Dropped);
            }
        } else if inner.queued_bytes + len > self.high_water {
            return Err(NatsError::SlowConsumer);
        }

        inner.queued_bytes += len;
        inner.frames.push_back(op);
        if let Some(task) = inner.writer.take() {
            task.notify();
        }

        Ok(Enqueue::Queued)
    }

    /// Queue-jumps `op` ahead of everything buffered, for `PONG` answers
    /// that must not wait behind a deep publish backlog.
    pub fn push_front(&self, op: Op) -> Result<Enqueue, NatsError> {
        let len = op.encoded_len();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NatsError::ConnectionClosed);
        }

        inner.queued_bytes += len;
        inner.frames.push_front(op);
        if let Some(task) = inner.writer.take() {
            task.notify();
        }

        Ok(Enqueue::Queued)
    }

    /// Re-inserts frames at the front in the given order, used to replay
    /// `SUB`s ahead of buffered traffic after a reconnect.
    pub fn push_front_batch(&self, ops: Vec<Op>) {
        let mut inner = self.inner.lock();
        for op in ops.into_iter().rev() {
            inner.queued_bytes += op.encoded_len();
            inner.frames.push_front(op);
        }
        if let Some(task) = inner.writer.take() {
            task.notify();
        }
    }

    fn pop(&self) -> Option<Op> {
        let mut inner = self.inner.lock();
        if inner.paused {
            return None;
        }
        match inner.frames.pop_front() {
            Some(op) => {
                inner.queued_bytes = inner.queued_bytes.saturating_sub(op.encoded_len());
                Some(op)
            }
            None => None,
        }
    }

    fn undo_pop(&self, op: Op) {
        let mut inner = self.inner.lock();
        inner.queued_bytes += op.encoded_len();
        inner.frames.push_front(op);
    }

    fn park_writer(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.paused && !inner.frames.is_empty() {
            return false;
        }
        inner.writer = Some(task::current());
        true
    }

    /// Holds frames for replay while the socket is gone.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    /// Drops queued wire-state frames (SUB/UNSUB/PING and friends) ahead
    /// of a reconnect; the registry regenerates them at replay time, so
    /// only publishes are worth carrying across the generation change.
    pub fn purge_for_replay(&self) {
        let mut inner = self.inner.lock();
        inner.frames.retain(|op| match *op {
            Op::PUB(_) => true,
            _ => false,
        });
        inner.queued_bytes = inner.frames.iter().map(Op::encoded_len).sum();
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        if let Some(task) = inner.writer.take() {
            task.notify();
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.frames.clear();
        inner.queued_bytes = 0;
        if let Some(task) = inner.writer.take() {
            task.notify();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// Drains the queue into one generation's sink. The `Framed` write buffer
/// coalesces adjacent frames into a single syscall. Sink faults are
/// reported on the fault channel; dropping `stop` retires the task.
pub(crate) struct WriterTask {
    queue: OutboundQueue,
    sink: NatsSink,
    fault: mpsc::UnboundedSender<NatsError>,
    stop: oneshot::Receiver<()>,
}

impl WriterTask {
    pub fn new(
        queue: OutboundQueue,
        sink: NatsSink,
        fault: mpsc::UnboundedSender<NatsError>,
        stop: oneshot::Receiver<()>,
    ) -> Self {
        WriterTask {
            queue,
            sink,
            fault,
            stop,
        }
    }
}

impl Future for WriterTask {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        match self.stop.poll() {
            Ok(Async::NotReady) => {}
            // Fired or dropped either way: this generation is over.
            Ok(Async::Ready(())) | Err(_) => return Ok(Async::Ready(())),
        }

        if self.queue.is_closed() {
            let _ = self.sink.poll_complete();
            return Ok(Async::Ready(()));
        }

        loop {
            match self.queue.pop() {
                Some(op) => match self.sink.start_send(op) {
                    Ok(AsyncSink::Ready) => continue,
                    Ok(AsyncSink::NotReady(op)) => {
                        self.queue.undo_pop(op);
                        return Ok(Async::NotReady);
                    }
                    Err(e) => {
                        let _ = self.fault.unbounded_send(e);
                        return Ok(Async::Ready(()));
                    }
                },
                None => {
                    match self.sink.poll_complete() {
                        Ok(Async::Ready(())) | Ok(Async::NotReady) => {}
                        Err(e) => {
                            let _ = self.fault.unbounded_send(e);
                            return Ok(Async::Ready(()));
                        }
                    }
                    if self.queue.park_writer() {
                        return Ok(Async::NotReady);
                    }
                }
            }
        }
    }
}

/// User-facing handle over the queue, also home of the PONG-waiter FIFO
/// that backs `flush()`.
#[derive(Clone, Debug)]
pub(crate) struct NatsClientSender {
    queue: OutboundQueue,
    pongs: Arc<Mutex<VecDeque<Option<oneshot::Sender<()>>>>>,
}

impl NatsClientSender {
    pub fn new(queue: OutboundQueue) -> Self {
        NatsClientSender {
            queue,
            pongs: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Enqueues an OP for the server.
    pub fn send(&self, op: Op) -> Result<Enqueue, NatsError> {
        debug!(target: "natrix", "Enqueueing OP: {:?}", op);
        self.queue.push(op)
    }

    /// Answers an unsolicited server `PING` ahead of buffered frames.
    pub fn pong(&self) -> Result<(), NatsError> {
        self.queue.push_front(Op::PONG).map(|_| ())
    }

    /// Sends a heartbeat `PING` with no waiter attached. The waiter slot
    /// and the frame go in under one lock so the PONG FIFO stays aligned
    /// with the PINGs actually on the wire.
    pub fn ping(&self) -> Result<(), NatsError> {
        let mut pongs = self.pongs.lock();
        pongs.push_back(None);
        if let Err(e) = self.queue.push(Op::PING) {
            pongs.pop_back();
            return Err(e);
        }
        Ok(())
    }

    /// Enqueues a `PING` and resolves once the matching `PONG` arrives,
    /// which means everything enqueued before it reached the transport.
    pub fn flush(&self) -> impl Future<Item = (), Error = NatsError> + Send {
        let (tx, rx) = oneshot::channel();
        let enqueued = {
            let mut pongs = self.pongs.lock();
            pongs.push_back(Some(tx));
            match self.queue.push(Op::PING) {
                Ok(_) => Ok(()),
                Err(e) => {
                    pongs.pop_back();
                    Err(e)
                }
            }
        };

        future::result(enqueued).and_then(move |_| rx.map_err(|_| NatsError::ConnectionClosed))
    }

    /// Resolves the oldest PONG waiter; called by the reader on `PONG`.
    pub fn pong_received(&self) {
        if let Some(waiter) = self.pongs.lock().pop_front() {
            if let Some(tx) = waiter {
                let _ = tx.send(());
            }
        }
    }

    /// Cancels every pending flush, failing their futures.
    pub fn cancel_pongs(&self) {
        self.pongs.lock().clear();
    }

    #[cfg(test)]
    fn pending_pongs(&self) -> usize {
        self.pongs.lock().len()
    }
}

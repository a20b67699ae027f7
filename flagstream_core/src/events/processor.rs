//! The event processor: a bounded inbox feeding one dispatcher, which
//! batches events and hands them to a fixed pool of flush workers.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use super::event::InsightEvent;
use super::sender::EventSender;

/// Events per POST body; larger payloads are split.
pub const MAX_EVENT_SIZE_PER_REQUEST: usize = 50;
/// Fixed size of the flush worker pool.
pub const MAX_FLUSH_WORKERS: usize = 5;
/// Default and maximum inbox capacity.
pub const MAX_EVENT_CAPACITY: usize = 10_000;
/// Default flush cadence.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Flush cadence upper bound.
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Accepts events produced by evaluations, identify calls and metric
/// tracking. Implementations must never block the caller.
pub trait InsightProcessor: Send + Sync {
    fn send(&self, event: InsightEvent);
    fn flush(&self);
    fn close(&self);
}

/// Inbox protocol. Consumers must be exhaustive over the three kinds.
enum EventMessage {
    Send(InsightEvent),
    Flush,
    Shutdown(SyncSender<()>),
}

#[derive(Debug, Clone, Copy)]
pub struct EventProcessorConfig {
    pub capacity: usize,
    pub flush_interval: Duration,
}

impl Default for EventProcessorConfig {
    fn default() -> EventProcessorConfig {
        EventProcessorConfig {
            capacity: MAX_EVENT_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl EventProcessorConfig {
    /// Build a config with out-of-range values clamped to the documented
    /// caps.
    pub fn new(capacity: usize, flush_interval: Duration) -> EventProcessorConfig {
        EventProcessorConfig {
            capacity: if capacity == 0 {
                MAX_EVENT_CAPACITY
            } else {
                capacity.min(MAX_EVENT_CAPACITY)
            },
            flush_interval: if flush_interval.is_zero() {
                DEFAULT_FLUSH_INTERVAL
            } else {
                flush_interval.min(MAX_FLUSH_INTERVAL)
            },
        }
    }
}

/// Tracks flush batches currently owned by workers so shutdown can wait
/// for them to drain.
#[derive(Default)]
struct ActiveFlushes {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveFlushes {
    fn add(&self) {
        let mut count = self.count.lock().expect("flush counter lock poisoned");
        *count += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().expect("flush counter lock poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().expect("flush counter lock poisoned");
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .expect("flush counter lock poisoned");
        }
    }
}

/// The default insight pipeline.
///
/// One dispatcher thread consumes the bounded inbox and accumulates
/// sendable events in the next-flush buffer. On a flush (periodic or
/// explicit) the buffer is handed to an idle worker through a rendezvous
/// outbox; if every worker is busy the buffer is kept and merged into the
/// next flush instead of being dropped.
pub struct EventProcessor {
    inbox: SyncSender<EventMessage>,
    closed: AtomicBool,
    sender: Arc<dyn EventSender>,
}

impl EventProcessor {
    /// Spawn the dispatcher and worker threads and return the handle used
    /// to feed them.
    pub fn start(
        event_uri: String,
        sender: Arc<dyn EventSender>,
        config: EventProcessorConfig,
    ) -> EventProcessor {
        let (inbox_tx, inbox_rx) = mpsc::sync_channel(config.capacity);
        // Rendezvous channel: a hand-off only succeeds when a worker is
        // parked waiting for work.
        let (outbox_tx, outbox_rx) = mpsc::sync_channel::<Vec<InsightEvent>>(0);
        let outbox_rx = Arc::new(Mutex::new(outbox_rx));
        let active = Arc::new(ActiveFlushes::default());

        for worker in 0..MAX_FLUSH_WORKERS {
            let outbox_rx = outbox_rx.clone();
            let active = active.clone();
            let sender = sender.clone();
            let event_uri = event_uri.clone();
            let _ = thread::Builder::new()
                .name(format!("flagstream-flush-{worker}"))
                .spawn(move || run_flush_worker(&event_uri, &*sender, &outbox_rx, &active));
        }

        {
            let active = active.clone();
            let flush_interval = config.flush_interval;
            let _ = thread::Builder::new()
                .name("flagstream-event-dispatcher".to_owned())
                .spawn(move || {
                    run_dispatcher(inbox_rx, outbox_tx, active, config.capacity, flush_interval)
                });
        }

        EventProcessor {
            inbox: inbox_tx,
            closed: AtomicBool::new(false),
            sender,
        }
    }

    /// Enqueue a message. Non-blocking for regular traffic: when the inbox
    /// is saturated the event is dropped with a log entry. Shutdown is the
    /// exception, it is retried until delivered because close completion
    /// depends on the dispatcher seeing it.
    fn put(&self, message: EventMessage) -> bool {
        let mut message = message;
        loop {
            match self.inbox.try_send(message) {
                Ok(()) => return true,
                Err(TrySendError::Full(returned)) => {
                    if matches!(returned, EventMessage::Shutdown(_)) {
                        message = returned;
                        thread::yield_now();
                        continue;
                    }
                    log::warn!(target: "flagstream",
                        "events are being produced faster than they can be processed; some events will be dropped");
                    return false;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

impl InsightProcessor for EventProcessor {
    fn send(&self, event: InsightEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.put(EventMessage::Send(event));
    }

    fn flush(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.put(EventMessage::Flush);
    }

    /// Flush what is buffered, wait for in-flight deliveries, then release
    /// the sender. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "flagstream", "insight processor is stopping");
        self.put(EventMessage::Flush);
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.put(EventMessage::Shutdown(ack_tx)) {
            let _ = ack_rx.recv();
        }
        self.sender.close();
    }
}

fn run_dispatcher(
    inbox: Receiver<EventMessage>,
    outbox: SyncSender<Vec<InsightEvent>>,
    active: Arc<ActiveFlushes>,
    capacity: usize,
    flush_interval: Duration,
) {
    log::debug!(target: "flagstream", "event dispatcher is working");
    let mut buffer: Vec<InsightEvent> = Vec::with_capacity(capacity.min(1024));
    let mut next_flush = Instant::now() + flush_interval;
    loop {
        let timeout = next_flush.saturating_duration_since(Instant::now());
        match inbox.recv_timeout(timeout) {
            Ok(EventMessage::Send(event)) => {
                if event.is_sendable() {
                    buffer.push(event);
                }
            }
            Ok(EventMessage::Flush) => trigger_flush(&mut buffer, &outbox, &active),
            Ok(EventMessage::Shutdown(ack)) => {
                log::debug!(target: "flagstream", "event dispatcher is stopping");
                active.wait_idle();
                if !buffer.is_empty() {
                    log::warn!(target: "flagstream",
                        "dropping {} undelivered events at shutdown", buffer.len());
                }
                drop(outbox);
                let _ = ack.send(());
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                trigger_flush(&mut buffer, &outbox, &active);
                next_flush = Instant::now() + flush_interval;
            }
            Err(RecvTimeoutError::Disconnected) => {
                drop(outbox);
                return;
            }
        }
    }
}

fn trigger_flush(
    buffer: &mut Vec<InsightEvent>,
    outbox: &SyncSender<Vec<InsightEvent>>,
    active: &ActiveFlushes,
) {
    if buffer.is_empty() {
        return;
    }
    let payload = buffer.clone();
    active.add();
    match outbox.try_send(payload) {
        Ok(()) => buffer.clear(),
        // No idle flush worker right now. Keep the buffer so the next
        // flush merges it, and take back the speculative increment.
        Err(_) => active.done(),
    }
}

fn run_flush_worker(
    event_uri: &str,
    sender: &dyn EventSender,
    outbox: &Mutex<Receiver<Vec<InsightEvent>>>,
    active: &ActiveFlushes,
) {
    loop {
        // Holding the lock while parked in recv marks this worker as the
        // one an outbox hand-off can reach.
        let payload = {
            let receiver = outbox.lock().expect("outbox lock poisoned");
            receiver.recv()
        };
        let Ok(events) = payload else {
            // Outbox closed: shutting down.
            return;
        };
        for chunk in events.chunks(MAX_EVENT_SIZE_PER_REQUEST) {
            match serde_json::to_vec(chunk) {
                Ok(body) => {
                    if let Err(err) = sender.post_json(event_uri, &body) {
                        log::warn!(target: "flagstream",
                            "events batch of {} dropped: {err}", chunk.len());
                    }
                }
                Err(err) => {
                    log::error!(target: "flagstream", "events serialization failed: {err}");
                }
            }
        }
        active.done();
    }
}

/// No-op processor used in offline mode. Stateless, so one shared instance
/// serves every client; close must stay side-effect free.
pub struct NullEventProcessor;

impl NullEventProcessor {
    pub fn shared() -> Arc<NullEventProcessor> {
        static INSTANCE: OnceLock<Arc<NullEventProcessor>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(NullEventProcessor)).clone()
    }
}

impl InsightProcessor for NullEventProcessor {
    fn send(&self, _event: InsightEvent) {}
    fn flush(&self) {}
    fn close(&self) {}
}

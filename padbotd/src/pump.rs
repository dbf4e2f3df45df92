use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use padbot_common::transport::{split_message, ChatTransport, OutboundMessage};

/// Bounds on the tick interval
pub const MIN_SLEEP_MS: u64 = 10;
pub const MAX_SLEEP_MS: u64 = 1000;

/// Bounded outbound chat queue
///
/// Producers clone an [`OutboundSender`]; the pump drains one message per
/// cooldown window. Overflow drops the oldest message so fresh chatter wins.
pub struct OutboundQueue {
    deque: Arc<Mutex<VecDeque<OutboundMessage>>>,
    cap: usize,
}

impl OutboundQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            deque: Arc::new(Mutex::new(VecDeque::new())),
            cap,
        }
    }

    pub fn sender(&self) -> OutboundSender {
        OutboundSender {
            deque: Arc::clone(&self.deque),
            cap: self.cap,
        }
    }

    pub fn len(&self) -> usize {
        self.deque.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().unwrap().is_empty()
    }

    pub fn pop(&self) -> Option<OutboundMessage> {
        self.deque.lock().unwrap().pop_front()
    }

    fn push_front(&self, msg: OutboundMessage) {
        self.deque.lock().unwrap().push_front(msg);
    }
}

/// Cloneable producer handle onto the outbound queue
#[derive(Clone)]
pub struct OutboundSender {
    deque: Arc<Mutex<VecDeque<OutboundMessage>>>,
    cap: usize,
}

impl OutboundSender {
    /// Enqueue a message, dropping the oldest on overflow
    pub fn send(&self, msg: OutboundMessage) {
        let mut deque = self.deque.lock().unwrap();
        if deque.len() >= self.cap {
            deque.pop_front();
            warn!("Outbound queue full, dropping oldest message");
        }
        deque.push_back(msg);
    }
}

/// Handle returned when a routine is registered
pub type RoutineHandle = usize;

/// A periodic routine driven by the pump
///
/// Routines run on the pump's owner task; keep each tick short.
#[async_trait::async_trait]
pub trait TickRoutine: Send {
    fn name(&self) -> &str;
    async fn tick(&mut self, now: Instant, outbound: &OutboundSender);
}

/// Cloneable handle for unregistering routines
///
/// Removal requested during a dispatch is deferred to the next tick, so a
/// routine may remove itself (or a sibling) without invalidating the
/// iteration.
#[derive(Clone, Default)]
pub struct RoutineRemover {
    pending: Arc<Mutex<Vec<RoutineHandle>>>,
}

impl RoutineRemover {
    pub fn remove(&self, handle: RoutineHandle) {
        self.pending.lock().unwrap().push(handle);
    }
}

/// Cooperative tick loop: outbound drain plus periodic routines
pub struct MessagePump {
    transport: Arc<dyn ChatTransport>,
    queue: OutboundQueue,
    routines: Vec<(RoutineHandle, Box<dyn TickRoutine>)>,
    next_handle: RoutineHandle,
    remover: RoutineRemover,
    tick_ms: u64,
    cooldown_ms: u64,
    char_limit: usize,
    last_send: Option<Instant>,
}

impl MessagePump {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        queue: OutboundQueue,
        tick_ms: u64,
        cooldown_ms: u64,
        char_limit: usize,
    ) -> Self {
        let clamped = tick_ms.clamp(MIN_SLEEP_MS, MAX_SLEEP_MS);
        if clamped != tick_ms {
            warn!(
                "Tick interval {}ms clamped to {}ms (supported range {}-{}ms)",
                tick_ms, clamped, MIN_SLEEP_MS, MAX_SLEEP_MS
            );
        }
        Self {
            transport,
            queue,
            routines: Vec::new(),
            next_handle: 0,
            remover: RoutineRemover::default(),
            tick_ms: clamped,
            cooldown_ms,
            char_limit,
            last_send: None,
        }
    }

    pub fn register_routine(&mut self, routine: Box<dyn TickRoutine>) -> RoutineHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        info!("Registered routine '{}' ({})", routine.name(), handle);
        self.routines.push((handle, routine));
        handle
    }

    pub fn remover(&self) -> RoutineRemover {
        self.remover.clone()
    }

    pub fn sender(&self) -> OutboundSender {
        self.queue.sender()
    }

    /// Run until the stop flag flips
    pub async fn run(mut self, stop: Arc<RwLock<bool>>) {
        info!("Message pump running at {}ms ticks", self.tick_ms);
        loop {
            if *stop.read().await {
                break;
            }

            let now = Instant::now();
            self.apply_removals();
            self.drain_one(now).await;

            let sender = self.queue.sender();
            for (_, routine) in &mut self.routines {
                routine.tick(now, &sender).await;
            }

            sleep(Duration::from_millis(self.tick_ms)).await;
        }
        info!("Message pump stopped");
    }

    fn apply_removals(&mut self) {
        let mut pending = self.remover.pending.lock().unwrap();
        if pending.is_empty() {
            return;
        }
        for handle in pending.drain(..) {
            self.routines.retain(|(h, _)| *h != handle);
            debug!("Removed routine {}", handle);
        }
    }

    /// Send at most one message per cooldown window
    async fn drain_one(&mut self, now: Instant) {
        // Buffer while the transport is down; reconnect handles recovery
        if !self.transport.is_connected() {
            return;
        }
        let cooled = match self.last_send {
            Some(at) => now.duration_since(at).as_millis() as u64 >= self.cooldown_ms,
            None => true,
        };
        if !cooled {
            return;
        }

        let Some(msg) = self.queue.pop() else { return };

        let mut parts = split_message(&msg.text, self.char_limit);
        let first = parts.remove(0);
        if !parts.is_empty() {
            // The remainder waits for its own cooldown window
            self.queue.push_front(OutboundMessage {
                channel: msg.channel.clone(),
                text: parts.join(" "),
            });
        }

        match self.transport.send_message(&msg.channel, &first).await {
            Ok(()) => {
                self.last_send = Some(now);
            }
            Err(e) => {
                warn!("Failed to send chat message: {}", e);
                // Requeue and let the reconnect routine do its work
                self.queue.push_front(OutboundMessage {
                    channel: msg.channel,
                    text: first,
                });
            }
        }
    }
}

/// Re-establishes the chat transport with exponential backoff and jitter
pub struct ReconnectRoutine {
    transport: Arc<dyn ChatTransport>,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_ms: u64,
    next_attempt: Option<Instant>,
}

impl ReconnectRoutine {
    pub fn new(transport: Arc<dyn ChatTransport>, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            transport,
            base_backoff_ms,
            max_backoff_ms,
            backoff_ms: base_backoff_ms,
            next_attempt: None,
        }
    }
}

#[async_trait::async_trait]
impl TickRoutine for ReconnectRoutine {
    fn name(&self) -> &str {
        "reconnect"
    }

    async fn tick(&mut self, now: Instant, _outbound: &OutboundSender) {
        if self.transport.is_connected() {
            self.backoff_ms = self.base_backoff_ms;
            self.next_attempt = None;
            return;
        }

        let due = match self.next_attempt {
            Some(at) => now >= at,
            None => true,
        };
        if !due {
            return;
        }

        match self.transport.connect().await {
            Ok(()) => {
                info!("Chat transport reconnected");
                self.backoff_ms = self.base_backoff_ms;
                self.next_attempt = None;
            }
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0..=self.backoff_ms / 4);
                warn!(
                    "Reconnect failed ({}), retrying in {}ms",
                    e,
                    self.backoff_ms + jitter
                );
                self.next_attempt = Some(now + Duration::from_millis(self.backoff_ms + jitter));
                self.backoff_ms = (self.backoff_ms * 2).min(self.max_backoff_ms);
            }
        }
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use padbot_common::transport::OutboundMessage;
use padbot_common::{Chord, DurationUnit, Input, InputSequence};

use crate::backend::PadError;
use crate::controller::{ControllerManager, PortError};
use crate::parser::{InputKind, Vocabulary};
use crate::pump::OutboundSender;

/// Sequence playback failures
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("sequence was cancelled")]
    Cancelled,
    #[error(transparent)]
    Pad(#[from] PadError),
    #[error(transparent)]
    Port(#[from] PortError),
}

/// Per-sequence cancel flag, polled between chords
pub type CancelFlag = Arc<RwLock<bool>>;

/// Executor tuning taken from settings at startup
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub frame_ms: u32,
    pub queue_depth: usize,
    pub hold_grace_ms: u64,
    pub channel: String,
}

/// One queued per-port part of a sequence
struct Job {
    user: String,
    sequence: InputSequence,
    /// The lane this part belongs to; every member resolves here
    port: usize,
    cancel: CancelFlag,
    /// Parts of the same submission still alive, for cancel bookkeeping
    parts_left: Arc<AtomicUsize>,
}

/// FIFO lane state shared between producers and one worker
struct LaneState {
    port: usize,
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    /// Signalled by cancel_all so a lane parked in its hold-grace window
    /// drops held state immediately
    purge: Notify,
}

/// Staged device operation for one chord edge
#[derive(Debug, Clone, Copy)]
enum DeviceOp {
    Press(u16),
    Release(u16),
    Axis(u16, i8),
}

/// Inputs a lane is currently latching: (port, input name) -> device control
type HeldMap = HashMap<(usize, String), InputKind>;

/// Plays input sequences against the controller pool
///
/// Each port gets its own worker and strictly FIFO queue; different ports run
/// in parallel. Enqueueing partitions a sequence by resolved port (`&p`
/// overrides the issuer's team), so every device operation for a port is
/// serialized on that port's own lane and per-port submission order holds no
/// matter which sequence the operation came from.
pub struct InputExecutor {
    manager: Arc<ControllerManager>,
    vocabulary: Arc<Vocabulary>,
    lanes: Vec<Arc<LaneState>>,
    active: Mutex<Vec<CancelFlag>>,
    busy: AtomicUsize,
    settings: ExecSettings,
    outbound: OutboundSender,
}

impl InputExecutor {
    /// Spawn one worker per acquired controller and return the executor
    pub fn start(
        manager: Arc<ControllerManager>,
        vocabulary: Arc<Vocabulary>,
        settings: ExecSettings,
        outbound: OutboundSender,
    ) -> Arc<Self> {
        let lanes: Vec<Arc<LaneState>> = (0..manager.count())
            .map(|port| {
                Arc::new(LaneState {
                    port,
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    purge: Notify::new(),
                })
            })
            .collect();

        let executor = Arc::new(Self {
            manager,
            vocabulary,
            lanes,
            active: Mutex::new(Vec::new()),
            busy: AtomicUsize::new(0),
            settings,
            outbound,
        });

        for lane in &executor.lanes {
            let lane = Arc::clone(lane);
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                executor.lane_worker(lane).await;
            });
        }

        executor
    }

    /// Queue a sequence, one part per resolved port
    ///
    /// All members referencing the same port are serialized on that port's
    /// lane; parts share one cancel flag. Overflow on a lane drops its oldest
    /// waiting job with a chat warning. Returns the sequence's cancel flag.
    pub async fn enqueue(
        &self,
        user: &str,
        sequence: InputSequence,
        default_port: usize,
    ) -> Result<CancelFlag, PortError> {
        if default_port >= self.lanes.len() {
            return Err(PortError::OutOfRange {
                port: default_port,
                count: self.lanes.len(),
            });
        }

        let cancel: CancelFlag = Arc::new(RwLock::new(false));
        let parts = partition_by_port(&sequence, default_port, self.settings.frame_ms);
        let parts_left = Arc::new(AtomicUsize::new(parts.len()));
        self.active.lock().await.push(Arc::clone(&cancel));

        for (port, part) in parts {
            let Some(lane) = self.lanes.get(port) else {
                // The parser bounds explicit ports to the pool
                warn!("Dropping inputs for unconnected joystick {}", port + 1);
                self.retire_part(&parts_left, &cancel).await;
                continue;
            };

            let mut dropped = None;
            {
                let mut queue = lane.queue.lock().await;
                if queue.len() >= self.settings.queue_depth {
                    if let Some(oldest) = queue.pop_front() {
                        warn!(
                            "Lane {} full, dropping {}'s oldest waiting sequence",
                            port + 1,
                            oldest.user
                        );
                        self.outbound.send(OutboundMessage {
                            channel: self.settings.channel.clone(),
                            text: format!(
                                "{}, joystick {} is backed up, your oldest waiting input was dropped",
                                oldest.user,
                                port + 1
                            ),
                        });
                        dropped = Some(oldest);
                    }
                }
                queue.push_back(Job {
                    user: user.to_string(),
                    sequence: part,
                    port,
                    cancel: Arc::clone(&cancel),
                    parts_left: Arc::clone(&parts_left),
                });
            }
            if let Some(oldest) = dropped {
                self.retire_part(&oldest.parts_left, &oldest.cancel).await;
            }
            lane.notify.notify_one();
        }
        Ok(cancel)
    }

    /// Drop one part's claim on its submission; the last part out removes
    /// the shared cancel flag from the active list
    async fn retire_part(&self, parts_left: &Arc<AtomicUsize>, cancel: &CancelFlag) {
        if parts_left.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.active
                .lock()
                .await
                .retain(|flag| !Arc::ptr_eq(flag, cancel));
        }
    }

    /// Flip every in-flight and queued cancel flag
    pub async fn cancel_all(&self) {
        let flags = self.active.lock().await;
        for flag in flags.iter() {
            *flag.write().await = true;
        }
        info!("Cancelled {} sequences", flags.len());
        drop(flags);
        for lane in &self.lanes {
            lane.purge.notify_one();
        }
    }

    /// Wait until every lane is idle, bounded by `timeout_ms`
    pub async fn drain(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let mut queued = 0;
            for lane in &self.lanes {
                queued += lane.queue.lock().await.len();
            }
            if queued == 0 && self.busy.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("Drain timed out with {} sequences outstanding", queued);
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn next_job(&self, lane: &LaneState) -> Job {
        loop {
            if let Some(job) = lane.queue.lock().await.pop_front() {
                return job;
            }
            lane.notify.notified().await;
        }
    }

    async fn lane_worker(&self, lane: Arc<LaneState>) {
        let mut held: HeldMap = HashMap::new();
        let mut pending: Option<Job> = None;
        let mut holding_busy = false;

        loop {
            let job = match pending.take() {
                Some(job) => job,
                None => self.next_job(&lane).await,
            };
            if !holding_busy {
                self.busy.fetch_add(1, Ordering::SeqCst);
                holding_busy = true;
            }

            match self.play_sequence(&job, &mut held).await {
                Ok(()) => {
                    debug!("Lane {}: finished {}'s sequence", lane.port + 1, job.user);
                }
                Err(ExecError::Cancelled) => {
                    info!("Lane {}: cancelled {}'s sequence", lane.port + 1, job.user);
                    self.release_held(&mut held).await;
                }
                Err(ExecError::Pad(e)) => {
                    error!("Lane {}: device failure: {}", lane.port + 1, e);
                    self.release_held(&mut held).await;
                    self.handle_device_loss(lane.port, &e).await;
                }
                Err(ExecError::Port(e)) => {
                    error!("Lane {}: {}", lane.port + 1, e);
                    self.release_held(&mut held).await;
                }
            }
            self.retire_part(&job.parts_left, &job.cancel).await;

            // Hold-grace window: a follow-up from the same user that starts
            // by releasing a latched input keeps that latch alive
            if !held.is_empty() {
                tokio::select! {
                    next = self.next_job(&lane) => {
                        if next.user == job.user {
                            self.release_unmatched_holds(&mut held, &next).await;
                        } else {
                            self.release_held(&mut held).await;
                        }
                        pending = Some(next);
                    }
                    _ = lane.purge.notified() => {
                        self.release_held(&mut held).await;
                    }
                    _ = sleep(Duration::from_millis(self.settings.hold_grace_ms)) => {
                        self.release_held(&mut held).await;
                    }
                }
            }

            if pending.is_none() {
                self.busy.fetch_sub(1, Ordering::SeqCst);
                holding_busy = false;
            }
        }
    }

    async fn play_sequence(&self, job: &Job, held: &mut HeldMap) -> Result<(), ExecError> {
        for chord in &job.sequence.steps {
            if *job.cancel.read().await {
                return Err(ExecError::Cancelled);
            }
            self.play_chord(job, chord, held).await?;
        }
        Ok(())
    }

    /// Play one chord: stage every edge, flush once per involved port, then
    /// release timed members as their deadlines expire
    async fn play_chord(&self, job: &Job, chord: &Chord, held: &mut HeldMap) -> Result<(), ExecError> {
        let frame_ms = self.settings.frame_ms;
        let mut initial: BTreeMap<usize, Vec<DeviceOp>> = BTreeMap::new();
        let mut timed: Vec<(u64, usize, DeviceOp)> = Vec::new();

        for input in &chord.inputs {
            // Partitioning already resolved every member onto this lane
            let port = input.port.unwrap_or(job.port);
            let Some(kind) = self.vocabulary.resolve(&input.name) else {
                // The parser only emits vocabulary names
                warn!("Unknown input '{}' reached the executor", input.name);
                continue;
            };

            match kind {
                InputKind::Wait => {}
                InputKind::Button(code) => {
                    if input.release {
                        initial.entry(port).or_default().push(DeviceOp::Release(code));
                        held.remove(&(port, input.name.clone()));
                    } else {
                        initial.entry(port).or_default().push(DeviceOp::Press(code));
                        if input.hold {
                            held.insert((port, input.name.clone()), kind);
                        } else {
                            timed.push((input.duration_ms(frame_ms), port, DeviceOp::Release(code)));
                        }
                    }
                }
                InputKind::Axis { code, direction } => {
                    if input.release {
                        initial.entry(port).or_default().push(DeviceOp::Axis(code, 0));
                        held.remove(&(port, input.name.clone()));
                    } else {
                        let percent = input.percent.unwrap_or(100) as i32;
                        let value = (direction as i32 * percent * 127 / 100) as i8;
                        initial.entry(port).or_default().push(DeviceOp::Axis(code, value));
                        if input.hold {
                            held.insert((port, input.name.clone()), kind);
                        } else {
                            timed.push((input.duration_ms(frame_ms), port, DeviceOp::Axis(code, 0)));
                        }
                    }
                }
            }
        }

        // One update per involved port makes the chord a single HID report
        self.apply_ops(&initial).await?;

        timed.sort_by_key(|(ms, _, _)| *ms);
        let total_ms = chord.duration_ms(frame_ms);
        let mut elapsed = 0u64;
        let mut i = 0;
        while i < timed.len() {
            let deadline = timed[i].0;
            if deadline > elapsed {
                sleep(Duration::from_millis(deadline - elapsed)).await;
                elapsed = deadline;
            }
            let mut batch: BTreeMap<usize, Vec<DeviceOp>> = BTreeMap::new();
            while i < timed.len() && timed[i].0 == deadline {
                batch.entry(timed[i].1).or_default().push(timed[i].2);
                i += 1;
            }
            self.apply_ops(&batch).await?;
        }
        if total_ms > elapsed {
            sleep(Duration::from_millis(total_ms - elapsed)).await;
        }
        Ok(())
    }

    async fn apply_ops(&self, ops: &BTreeMap<usize, Vec<DeviceOp>>) -> Result<(), ExecError> {
        for (port, port_ops) in ops {
            let pad = self.manager.get(*port)?;
            let mut pad = pad.lock().await;
            for op in port_ops {
                match op {
                    DeviceOp::Press(code) => pad.press(*code).await?,
                    DeviceOp::Release(code) => pad.release(*code).await?,
                    DeviceOp::Axis(code, value) => pad.set_axis(*code, *value).await?,
                }
            }
            pad.update().await?;
        }
        Ok(())
    }

    /// Best-effort release of everything the lane is latching
    async fn release_held(&self, held: &mut HeldMap) {
        if held.is_empty() {
            return;
        }
        let mut ops: BTreeMap<usize, Vec<DeviceOp>> = BTreeMap::new();
        for ((port, _), kind) in held.drain() {
            match kind {
                InputKind::Button(code) => ops.entry(port).or_default().push(DeviceOp::Release(code)),
                InputKind::Axis { code, .. } => {
                    ops.entry(port).or_default().push(DeviceOp::Axis(code, 0))
                }
                InputKind::Wait => {}
            }
        }
        if let Err(e) = self.apply_ops(&ops).await {
            warn!("Failed to release held inputs: {}", e);
        }
    }

    /// Keep latches the follow-up's first chord releases; drop the rest
    async fn release_unmatched_holds(&self, held: &mut HeldMap, next: &Job) {
        let empty = Chord::default();
        let first = next.sequence.steps.first().unwrap_or(&empty);
        let mut kept: HeldMap = HashMap::new();
        let mut dropped: HeldMap = HashMap::new();

        for ((port, name), kind) in held.drain() {
            let matched = first.inputs.iter().any(|input| {
                input.release
                    && input.name == name
                    && input.port.unwrap_or(next.port) == port
            });
            if matched {
                kept.insert((port, name), kind);
            } else {
                dropped.insert((port, name), kind);
            }
        }

        self.release_held(&mut dropped).await;
        *held = kept;
    }

    /// One-shot notice and degraded marking after a device loss
    async fn handle_device_loss(&self, port: usize, error: &PadError) {
        if matches!(error, PadError::DeviceGone) && !self.manager.is_degraded(port).await {
            self.manager.mark_degraded(port).await;
            self.outbound.send(OutboundMessage {
                channel: self.settings.channel.clone(),
                text: format!(
                    "Joystick {} stopped responding, inputs for it are paused",
                    port + 1
                ),
            });
        }
    }
}

/// Split a sequence into per-port parts that preserve step pacing
///
/// Every member lands on the lane of its resolved port. Steps a part does
/// not participate in (or only partially fills) are padded with a wait of
/// the original step length, so all parts advance on the sequence's own
/// timeline and the total duration is unchanged.
fn partition_by_port(
    sequence: &InputSequence,
    default_port: usize,
    frame_ms: u32,
) -> Vec<(usize, InputSequence)> {
    let ports: BTreeSet<usize> = sequence
        .steps
        .iter()
        .flat_map(|chord| chord.inputs.iter().map(|i| i.port.unwrap_or(default_port)))
        .collect();
    if ports.is_empty() {
        return vec![(default_port, sequence.clone())];
    }

    let mut parts: Vec<(usize, Vec<Chord>)> =
        ports.iter().map(|port| (*port, Vec::new())).collect();
    for chord in &sequence.steps {
        let step_ms = chord.duration_ms(frame_ms);
        for (port, steps) in &mut parts {
            let mut inputs: Vec<Input> = chord
                .inputs
                .iter()
                .filter(|input| input.port.unwrap_or(default_port) == *port)
                .cloned()
                .map(|mut input| {
                    input.port = None;
                    input
                })
                .collect();
            let own_ms = inputs
                .iter()
                .filter(|input| input.is_timed())
                .map(|input| input.duration_ms(frame_ms))
                .max()
                .unwrap_or(0);
            if own_ms < step_ms {
                inputs.push(Input {
                    name: ".".to_string(),
                    port: None,
                    duration: u32::try_from(step_ms).unwrap_or(u32::MAX),
                    unit: DurationUnit::Millis,
                    hold: false,
                    release: false,
                    percent: None,
                });
            }
            steps.push(Chord { inputs });
        }
    }

    parts
        .into_iter()
        .map(|(port, steps)| {
            (
                port,
                InputSequence {
                    steps,
                    duration_ms: sequence.duration_ms,
                },
            )
        })
        .collect()
}

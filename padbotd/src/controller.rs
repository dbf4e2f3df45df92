use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use padbot_common::transport::OutboundMessage;

use crate::backend::GamepadBackend;
use crate::pump::{OutboundSender, TickRoutine};

/// Platform bounds on the virtual pad pool
pub const MIN_CONTROLLERS: usize = 1;
pub const MAX_CONTROLLERS: usize = 8;

/// Shared handle to one virtual pad slot
pub type PadHandle = Arc<Mutex<Box<dyn GamepadBackend>>>;

/// Port routing failures
#[derive(Debug, Error)]
pub enum PortError {
    #[error("invalid joystick number {}, only {count} connected", .port + 1)]
    OutOfRange { port: usize, count: usize },
    #[error("joystick {} is degraded, waiting for reacquisition", .port + 1)]
    Degraded { port: usize },
}

/// Owns the ordered pool of virtual pads
///
/// Ports are 0-based internally; every user-facing message prints `port + 1`.
pub struct ControllerManager {
    pads: Vec<PadHandle>,
    degraded: Vec<Arc<RwLock<bool>>>,
}

impl ControllerManager {
    /// Acquire up to `count` pads built by `factory`
    ///
    /// The requested count is clamped to the platform bounds with a warning.
    /// Acquisition stops at the first failure and the pool keeps whatever was
    /// acquired so far; an empty pool is the caller's fatal condition, not
    /// ours.
    pub async fn init<F>(count: usize, factory: F) -> Self
    where
        F: Fn(usize) -> Box<dyn GamepadBackend>,
    {
        let clamped = count.clamp(MIN_CONTROLLERS, MAX_CONTROLLERS);
        if clamped != count {
            warn!(
                "Requested {} controllers, clamped to {} (supported range {}-{})",
                count, clamped, MIN_CONTROLLERS, MAX_CONTROLLERS
            );
        }

        let mut pads = Vec::new();
        for index in 0..clamped {
            let mut pad = factory(index);
            match pad.acquire().await {
                Ok(()) => pads.push(Arc::new(Mutex::new(pad))),
                Err(e) => {
                    error!("Failed to acquire controller {}: {}", index + 1, e);
                    break;
                }
            }
        }

        info!("Acquired {} of {} virtual controllers", pads.len(), clamped);
        let degraded = (0..pads.len())
            .map(|_| Arc::new(RwLock::new(false)))
            .collect();
        Self { pads, degraded }
    }

    pub fn count(&self) -> usize {
        self.pads.len()
    }

    /// Look up the pad on `port`, rejecting out-of-range ports
    pub fn get(&self, port: usize) -> Result<PadHandle, PortError> {
        self.pads.get(port).cloned().ok_or(PortError::OutOfRange {
            port,
            count: self.pads.len(),
        })
    }

    /// Mark a port degraded after a device loss; its lane skips it until
    /// reacquired
    pub async fn mark_degraded(&self, port: usize) {
        if let Some(flag) = self.degraded.get(port) {
            *flag.write().await = true;
            warn!("Controller {} marked degraded", port + 1);
        }
    }

    pub async fn is_degraded(&self, port: usize) -> bool {
        match self.degraded.get(port) {
            Some(flag) => *flag.read().await,
            None => false,
        }
    }

    /// Try to reacquire a degraded port's device
    pub async fn reacquire(&self, port: usize) -> Result<(), PortError> {
        let pad = self.get(port)?;
        let mut pad = pad.lock().await;
        match pad.acquire().await {
            Ok(()) => {
                if let Some(flag) = self.degraded.get(port) {
                    *flag.write().await = false;
                }
                info!("Controller {} reacquired", port + 1);
                Ok(())
            }
            Err(e) => {
                error!("Failed to reacquire controller {}: {}", port + 1, e);
                Err(PortError::Degraded { port })
            }
        }
    }

    pub async fn any_degraded(&self) -> bool {
        for flag in &self.degraded {
            if *flag.read().await {
                return true;
            }
        }
        false
    }

    /// Reset and release every pad in the pool
    pub async fn cleanup(&self) {
        for (port, pad) in self.pads.iter().enumerate() {
            let mut pad = pad.lock().await;
            if let Err(e) = pad.reset().await {
                warn!("Failed to reset controller {}: {}", port + 1, e);
            }
            if let Err(e) = pad.release_device().await {
                warn!("Failed to release controller {}: {}", port + 1, e);
            }
        }
        info!("Released {} virtual controllers", self.pads.len());
    }
}

/// Periodic retry of degraded ports, run off the message pump
pub struct ReacquireRoutine {
    manager: Arc<ControllerManager>,
    channel: String,
    interval_ms: u64,
    last_attempt: Option<Instant>,
}

impl ReacquireRoutine {
    pub fn new(manager: Arc<ControllerManager>, channel: String, interval_ms: u64) -> Self {
        Self {
            manager,
            channel,
            interval_ms,
            last_attempt: None,
        }
    }
}

#[async_trait::async_trait]
impl TickRoutine for ReacquireRoutine {
    fn name(&self) -> &str {
        "reacquire"
    }

    async fn tick(&mut self, now: Instant, outbound: &OutboundSender) {
        if !self.manager.any_degraded().await {
            return;
        }
        let due = match self.last_attempt {
            Some(at) => now.duration_since(at).as_millis() as u64 >= self.interval_ms,
            None => true,
        };
        if !due {
            return;
        }
        self.last_attempt = Some(now);

        for port in 0..self.manager.count() {
            if self.manager.is_degraded(port).await
                && self.manager.reacquire(port).await.is_ok()
            {
                outbound.send(OutboundMessage {
                    channel: self.channel.clone(),
                    text: format!("Joystick {} is responding again", port + 1),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockPad, PadEvent, BTN_SOUTH};
    use crate::pump::OutboundQueue;

    #[tokio::test]
    async fn test_init_acquires_requested_count() {
        let manager = ControllerManager::init(2, |_| Box::new(MockPad::new())).await;
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn test_init_clamps_to_platform_bounds() {
        let manager = ControllerManager::init(64, |_| Box::new(MockPad::new())).await;
        assert_eq!(manager.count(), MAX_CONTROLLERS);

        let manager = ControllerManager::init(0, |_| Box::new(MockPad::new())).await;
        assert_eq!(manager.count(), MIN_CONTROLLERS);
    }

    #[tokio::test]
    async fn test_partial_acquisition_keeps_smaller_pool() {
        let manager = ControllerManager::init(4, |index| {
            let mut pad = MockPad::new();
            pad.fail_acquire = index >= 2;
            Box::new(pad)
        })
        .await;
        assert_eq!(manager.count(), 2);
    }

    #[tokio::test]
    async fn test_get_rejects_out_of_range_port() {
        let manager = ControllerManager::init(2, |_| Box::new(MockPad::new())).await;
        assert!(manager.get(1).is_ok());

        let err = match manager.get(2) {
            Err(e) => e,
            Ok(_) => panic!("expected out-of-range error"),
        };
        // User-facing text is 1-based
        assert_eq!(err.to_string(), "invalid joystick number 3, only 2 connected");
    }

    #[tokio::test]
    async fn test_degraded_flag_roundtrip() {
        let manager = ControllerManager::init(1, |_| Box::new(MockPad::new())).await;
        assert!(!manager.is_degraded(0).await);

        manager.mark_degraded(0).await;
        assert!(manager.is_degraded(0).await);
        assert!(manager.any_degraded().await);

        manager.reacquire(0).await.unwrap();
        assert!(!manager.is_degraded(0).await);
    }

    #[tokio::test]
    async fn test_reacquire_routine_restores_port() {
        let manager = Arc::new(ControllerManager::init(1, |_| Box::new(MockPad::new())).await);
        manager.mark_degraded(0).await;

        let queue = OutboundQueue::new(8);
        let mut routine =
            ReacquireRoutine::new(Arc::clone(&manager), "#stream".into(), 1_000);
        routine.tick(Instant::now(), &queue.sender()).await;

        assert!(!manager.is_degraded(0).await);
        let notice = queue.pop().unwrap();
        assert!(notice.text.contains("responding again"), "{}", notice.text);
    }

    #[tokio::test]
    async fn test_cleanup_resets_pads() {
        let probe = MockPad::new();
        let manager = ControllerManager::init(1, |_| Box::new(probe.clone())).await;

        {
            let pad = manager.get(0).unwrap();
            let mut pad = pad.lock().await;
            pad.press(BTN_SOUTH).await.unwrap();
        }
        manager.cleanup().await;

        let events = probe.events();
        assert!(events.contains(&PadEvent::Release(BTN_SOUTH)));
    }
}

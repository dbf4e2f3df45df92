use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

// Linux input event constants
pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;
pub const SYN_REPORT: u16 = 0x00;

// Gamepad button codes
pub const BTN_SOUTH: u16 = 0x130;
pub const BTN_EAST: u16 = 0x131;
pub const BTN_NORTH: u16 = 0x133;
pub const BTN_WEST: u16 = 0x134;
pub const BTN_TL: u16 = 0x136;
pub const BTN_TR: u16 = 0x137;
pub const BTN_TL2: u16 = 0x138;
pub const BTN_TR2: u16 = 0x139;
pub const BTN_SELECT: u16 = 0x13a;
pub const BTN_START: u16 = 0x13b;
pub const BTN_THUMBL: u16 = 0x13d;
pub const BTN_THUMBR: u16 = 0x13e;
pub const BTN_DPAD_UP: u16 = 0x220;
pub const BTN_DPAD_DOWN: u16 = 0x221;
pub const BTN_DPAD_LEFT: u16 = 0x222;
pub const BTN_DPAD_RIGHT: u16 = 0x223;

// Gamepad axis codes
pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_RX: u16 = 0x03;
pub const ABS_RY: u16 = 0x04;

// uinput ioctl constants
const UI_SET_EVBIT: u64 = 0x40045564; // _IOW('U', 100, int)
const UI_SET_KEYBIT: u64 = 0x40045565; // _IOW('U', 101, int)
const UI_SET_ABSBIT: u64 = 0x40045567; // _IOW('U', 103, int)
const UI_DEV_CREATE: u64 = 0x5501; // _IO('U', 1)
const UI_DEV_DESTROY: u64 = 0x5502; // _IO('U', 2)

/// Buttons every virtual pad exposes
pub const PAD_BUTTONS: [u16; 16] = [
    BTN_SOUTH,
    BTN_EAST,
    BTN_NORTH,
    BTN_WEST,
    BTN_TL,
    BTN_TR,
    BTN_TL2,
    BTN_TR2,
    BTN_SELECT,
    BTN_START,
    BTN_THUMBL,
    BTN_THUMBR,
    BTN_DPAD_UP,
    BTN_DPAD_DOWN,
    BTN_DPAD_LEFT,
    BTN_DPAD_RIGHT,
];

/// Axes every virtual pad exposes, range -127..=127
pub const PAD_AXES: [u16; 4] = [ABS_X, ABS_Y, ABS_RX, ABS_RY];

/// Virtual gamepad failures
#[derive(Debug, Error)]
pub enum PadError {
    #[error("device is not acquired")]
    NotAcquired,
    #[error("device is gone")]
    DeviceGone,
    #[error("device I/O failed: {0}")]
    Io(String),
}

/// Trait for virtual gamepad devices
///
/// `press`/`release`/`set_axis` stage events; `update` flushes them as a
/// single HID report so a chord lands atomically. Pressing a pressed button
/// is idempotent and releasing an unpressed one is a no-op.
#[async_trait::async_trait]
pub trait GamepadBackend: Send {
    async fn acquire(&mut self) -> Result<(), PadError>;
    async fn press(&mut self, code: u16) -> Result<(), PadError>;
    async fn release(&mut self, code: u16) -> Result<(), PadError>;
    async fn set_axis(&mut self, code: u16, value: i8) -> Result<(), PadError>;
    async fn update(&mut self) -> Result<(), PadError>;
    async fn reset(&mut self) -> Result<(), PadError>;
    async fn release_device(&mut self) -> Result<(), PadError>;
}

/// Linux input_event structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct InputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Real uinput-backed virtual gamepad
pub struct UinputPad {
    index: usize,
    fd: Option<RawFd>,
    pressed: HashSet<u16>,
    axes: HashMap<u16, i8>,
}

impl UinputPad {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            fd: None,
            pressed: HashSet::new(),
            axes: HashMap::new(),
        }
    }

    fn fd(&self) -> Result<RawFd, PadError> {
        self.fd.ok_or(PadError::NotAcquired)
    }

    /// Write one raw event without a sync report
    fn write_event(&self, type_: u16, code: u16, value: i32) -> Result<(), PadError> {
        let fd = self.fd()?;

        let mut event: InputEvent = unsafe { mem::zeroed() };
        unsafe {
            libc::gettimeofday(&mut event.time, std::ptr::null_mut());
        }
        event.type_ = type_;
        event.code = code;
        event.value = value;

        unsafe {
            let event_ptr = &event as *const InputEvent as *const libc::c_void;
            let written = libc::write(fd, event_ptr, mem::size_of::<InputEvent>());
            if written < 0 {
                let err = std::io::Error::last_os_error();
                return Err(match err.raw_os_error() {
                    Some(libc::ENODEV) | Some(libc::EBADF) => PadError::DeviceGone,
                    _ => PadError::Io(err.to_string()),
                });
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl GamepadBackend for UinputPad {
    /// Open /dev/uinput and create the virtual gamepad device
    async fn acquire(&mut self) -> Result<(), PadError> {
        if self.fd.is_some() {
            return Ok(());
        }

        info!("Creating virtual gamepad {}", self.index + 1);

        let uinput_file = OpenOptions::new()
            .write(true)
            .open("/dev/uinput")
            .map_err(|e| PadError::Io(format!("failed to open /dev/uinput: {}", e)))?;

        let fd = uinput_file.as_raw_fd();
        // Keep the fd valid past this scope; closed in release_device/Drop
        mem::forget(uinput_file);

        unsafe {
            if libc::ioctl(fd, UI_SET_EVBIT, EV_KEY as libc::c_int) < 0 {
                return Err(PadError::Io("failed to set EV_KEY bit".into()));
            }
            if libc::ioctl(fd, UI_SET_EVBIT, EV_ABS as libc::c_int) < 0 {
                return Err(PadError::Io("failed to set EV_ABS bit".into()));
            }
            if libc::ioctl(fd, UI_SET_EVBIT, EV_SYN as libc::c_int) < 0 {
                return Err(PadError::Io("failed to set EV_SYN bit".into()));
            }

            for btn in PAD_BUTTONS {
                if libc::ioctl(fd, UI_SET_KEYBIT, btn as libc::c_int) < 0 {
                    warn!("Failed to set keybit for button {:#x}", btn);
                }
            }
            for axis in PAD_AXES {
                if libc::ioctl(fd, UI_SET_ABSBIT, axis as libc::c_int) < 0 {
                    warn!("Failed to set absbit for axis {:#x}", axis);
                }
            }
        }

        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let name = format!("padbot Virtual Gamepad {}", self.index + 1);
        let name_bytes = name.as_bytes();
        dev.name[..name_bytes.len()].copy_from_slice(name_bytes);
        dev.id.bustype = 0x03; // BUS_USB
        dev.id.vendor = 0x16c0;
        dev.id.product = 0x05e1;
        dev.id.version = 1;
        for axis in PAD_AXES {
            dev.absmin[axis as usize] = -127;
            dev.absmax[axis as usize] = 127;
        }

        unsafe {
            let dev_ptr = &dev as *const UinputUserDev as *const libc::c_void;
            if libc::write(fd, dev_ptr, mem::size_of::<UinputUserDev>()) < 0 {
                return Err(PadError::Io("failed to write uinput device structure".into()));
            }
            if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
                return Err(PadError::Io("failed to create uinput device".into()));
            }
        }

        info!("Created virtual gamepad: {}", name);
        self.fd = Some(fd);

        // Let the device settle before anything reads it
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        Ok(())
    }

    async fn press(&mut self, code: u16) -> Result<(), PadError> {
        if self.pressed.contains(&code) {
            return Ok(());
        }
        debug!("pad {}: press {:#x}", self.index + 1, code);
        self.write_event(EV_KEY, code, 1)?;
        self.pressed.insert(code);
        Ok(())
    }

    async fn release(&mut self, code: u16) -> Result<(), PadError> {
        if !self.pressed.contains(&code) {
            return Ok(());
        }
        debug!("pad {}: release {:#x}", self.index + 1, code);
        self.write_event(EV_KEY, code, 0)?;
        self.pressed.remove(&code);
        Ok(())
    }

    async fn set_axis(&mut self, code: u16, value: i8) -> Result<(), PadError> {
        debug!("pad {}: axis {:#x} = {}", self.index + 1, code, value);
        self.write_event(EV_ABS, code, value as i32)?;
        self.axes.insert(code, value);
        Ok(())
    }

    /// Flush staged events as one HID report
    async fn update(&mut self) -> Result<(), PadError> {
        self.write_event(EV_SYN, SYN_REPORT, 0)
    }

    /// Release every button and center every axis
    async fn reset(&mut self) -> Result<(), PadError> {
        let pressed: Vec<u16> = self.pressed.iter().copied().collect();
        for code in pressed {
            self.release(code).await?;
        }
        let moved: Vec<u16> = self
            .axes
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(c, _)| *c)
            .collect();
        for code in moved {
            self.set_axis(code, 0).await?;
        }
        self.update().await
    }

    async fn release_device(&mut self) -> Result<(), PadError> {
        if let Some(fd) = self.fd.take() {
            info!("Destroying virtual gamepad {}", self.index + 1);
            unsafe {
                libc::ioctl(fd, UI_DEV_DESTROY);
                libc::close(fd);
            }
            self.pressed.clear();
            self.axes.clear();
        }
        Ok(())
    }
}

impl Drop for UinputPad {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            info!("Destroying virtual gamepad {} on drop", self.index + 1);
            unsafe {
                libc::ioctl(fd, UI_DEV_DESTROY);
                libc::close(fd);
            }
        }
    }
}

/// Event record produced by [`MockPad`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PadEvent {
    Press(u16),
    Release(u16),
    Axis(u16, i8),
    Update,
}

/// In-memory pad used by tests and headless development runs
///
/// Records every event into a shared log and honors the same idempotency
/// rules as the real device. Flipping the `dead` flag makes every subsequent
/// call fail with [`PadError::DeviceGone`].
#[derive(Clone, Default)]
pub struct MockPad {
    pub log: Arc<Mutex<Vec<PadEvent>>>,
    pub dead: Arc<Mutex<bool>>,
    pub fail_acquire: bool,
    acquired: bool,
    pressed: HashSet<u16>,
}

impl MockPad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PadEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Net press count per button across the recorded log
    pub fn net_presses(&self) -> HashMap<u16, i64> {
        let mut net = HashMap::new();
        for event in self.log.lock().unwrap().iter() {
            match event {
                PadEvent::Press(code) => *net.entry(*code).or_insert(0) += 1,
                PadEvent::Release(code) => *net.entry(*code).or_insert(0) -= 1,
                _ => {}
            }
        }
        net
    }

    fn check_alive(&self) -> Result<(), PadError> {
        if *self.dead.lock().unwrap() {
            return Err(PadError::DeviceGone);
        }
        if !self.acquired {
            return Err(PadError::NotAcquired);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl GamepadBackend for MockPad {
    async fn acquire(&mut self) -> Result<(), PadError> {
        if self.fail_acquire {
            return Err(PadError::Io("mock acquire failure".into()));
        }
        self.acquired = true;
        Ok(())
    }

    async fn press(&mut self, code: u16) -> Result<(), PadError> {
        self.check_alive()?;
        if self.pressed.insert(code) {
            self.log.lock().unwrap().push(PadEvent::Press(code));
        }
        Ok(())
    }

    async fn release(&mut self, code: u16) -> Result<(), PadError> {
        self.check_alive()?;
        if self.pressed.remove(&code) {
            self.log.lock().unwrap().push(PadEvent::Release(code));
        }
        Ok(())
    }

    async fn set_axis(&mut self, code: u16, value: i8) -> Result<(), PadError> {
        self.check_alive()?;
        self.log.lock().unwrap().push(PadEvent::Axis(code, value));
        Ok(())
    }

    async fn update(&mut self) -> Result<(), PadError> {
        self.check_alive()?;
        self.log.lock().unwrap().push(PadEvent::Update);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), PadError> {
        let pressed: Vec<u16> = self.pressed.iter().copied().collect();
        for code in pressed {
            self.release(code).await?;
        }
        self.update().await
    }

    async fn release_device(&mut self) -> Result<(), PadError> {
        self.acquired = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_press_is_idempotent() {
        let mut pad = MockPad::new();
        pad.acquire().await.unwrap();

        pad.press(BTN_SOUTH).await.unwrap();
        pad.press(BTN_SOUTH).await.unwrap();
        pad.update().await.unwrap();

        assert_eq!(
            pad.events(),
            vec![PadEvent::Press(BTN_SOUTH), PadEvent::Update]
        );
    }

    #[tokio::test]
    async fn test_mock_release_of_unpressed_is_noop() {
        let mut pad = MockPad::new();
        pad.acquire().await.unwrap();

        pad.release(BTN_START).await.unwrap();
        assert!(pad.events().is_empty());
    }

    #[tokio::test]
    async fn test_mock_requires_acquisition() {
        let mut pad = MockPad::new();
        assert!(matches!(
            pad.press(BTN_SOUTH).await,
            Err(PadError::NotAcquired)
        ));
    }

    #[tokio::test]
    async fn test_mock_reports_device_gone() {
        let mut pad = MockPad::new();
        pad.acquire().await.unwrap();
        *pad.dead.lock().unwrap() = true;
        assert!(matches!(
            pad.press(BTN_SOUTH).await,
            Err(PadError::DeviceGone)
        ));
    }

    #[tokio::test]
    async fn test_mock_reset_balances_presses() {
        let mut pad = MockPad::new();
        pad.acquire().await.unwrap();

        pad.press(BTN_SOUTH).await.unwrap();
        pad.press(BTN_EAST).await.unwrap();
        pad.reset().await.unwrap();

        for (_, net) in pad.net_presses() {
            assert_eq!(net, 0);
        }
    }
}

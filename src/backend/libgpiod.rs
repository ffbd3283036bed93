use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::yield_now;
use std::time::{Duration, Instant};

use libgpiod::{chip::Chip, line, line::EventClock, request};
use log::{debug, warn};
use parking_lot::{FairMutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinConfig};
use crate::debounce::{DebounceMonitor, DebounceSettings};
use crate::edge::{Edge, EdgeEventSource, Level, RawEdgeEvent};
use crate::error::AppError;
use crate::gpio::{EventHandler, GpioBackend, GpioState, PinSettings};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
// the request lock is held for at most one slice so value reads are not starved
const LIBGPIOD_BACKEND_EVENT_WAIT_SLICE: Duration = Duration::from_millis(10);

pub struct LibgpiodBackend {
    pins: RwLock<FxHashMap<u32, RwLock<PinHandle>>>, // keyed by pin id
}

struct PinHandle {
    line: u32,
    settings: PinSettings,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    monitor: Option<DebounceMonitor<GpiodLine>>,
}

impl PinHandle {
    fn new(line: u32, settings: PinSettings, gpiod_handle: Arc<FairMutex<GpiodHandle>>) -> Self {
        Self {
            line,
            settings,
            gpiod_handle,
            monitor: None,
        }
    }

    fn stop_monitor(&mut self) -> Result<(), AppError> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown()?;
        }
        Ok(())
    }

    fn start_monitor(
        &mut self,
        pin_id: u32,
        handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        if self.settings.edge == EdgeDetect::None {
            return Ok(());
        }
        let Some(handler) = handler else {
            return Ok(());
        };

        let source = GpiodLine::new(self.line, self.gpiod_handle.clone());
        let debounce =
            DebounceSettings::new(self.settings.debounce()).with_notify(self.settings.edge);
        self.monitor = Some(DebounceMonitor::start(pin_id, source, debounce, handler)?);
        Ok(())
    }
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }

    fn level(&self, offset: u32) -> Result<Level, AppError> {
        let value = self
            .request
            .value(offset)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }
}

/// Edge source over a line request shared with the owning pin.
pub struct GpiodLine {
    offset: u32,
    gpiod_handle: Option<Arc<FairMutex<GpiodHandle>>>,
    buffer: Option<request::Buffer>,
    pending: VecDeque<RawEdgeEvent>,
    // monotonic reading taken at arm time, used if the clock read fails later
    clock_anchor: Option<(Duration, Instant)>,
}

impl GpiodLine {
    fn new(offset: u32, gpiod_handle: Arc<FairMutex<GpiodHandle>>) -> Self {
        Self {
            offset,
            gpiod_handle: Some(gpiod_handle),
            buffer: None,
            pending: VecDeque::new(),
            clock_anchor: None,
        }
    }
}

impl EdgeEventSource for GpiodLine {
    fn arm(&mut self) -> Result<(), AppError> {
        if self.gpiod_handle.is_none() {
            return Err(AppError::InvalidState(format!(
                "line {} already released",
                self.offset
            )));
        }
        let buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;
        self.clock_anchor = Some((monotonic_now()?, Instant::now()));
        self.buffer = Some(buffer);
        Ok(())
    }

    fn wait_for_edge(&mut self, timeout: Duration) -> Result<Option<RawEdgeEvent>, AppError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let (Some(gpiod_handle), Some(buffer)) = (self.gpiod_handle.as_ref(), self.buffer.as_mut())
        else {
            return Err(AppError::InvalidState(format!(
                "line {} is not armed",
                self.offset
            )));
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(LIBGPIOD_BACKEND_EVENT_WAIT_SLICE);
            {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event = req
                    .wait_edge_events(Some(slice))
                    .map_err(|e| AppError::Gpio(format!("wait edge events: {e}")))?;
                if has_event {
                    let events = req
                        .read_edge_events(buffer)
                        .map_err(|e| AppError::Gpio(format!("read edge events: {e}")))?;
                    for evt in events {
                        let evt = evt.map_err(|e| AppError::Gpio(format!("edge event: {e}")))?;
                        let edge = match evt
                            .event_type()
                            .map_err(|e| AppError::Gpio(format!("edge kind: {e}")))?
                        {
                            line::EdgeKind::Rising => Edge::Rising,
                            line::EdgeKind::Falling => Edge::Falling,
                        };
                        self.pending.push_back(RawEdgeEvent {
                            edge,
                            timestamp: evt.timestamp(),
                        });
                    }
                }
            }

            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if remaining <= slice {
                return Ok(None);
            }
            yield_now();
        }
    }

    fn read_level(&self) -> Result<Level, AppError> {
        let gpiod_handle = self.gpiod_handle.as_ref().ok_or_else(|| {
            AppError::InvalidState(format!("line {} already released", self.offset))
        })?;
        gpiod_handle.lock().level(self.offset)
    }

    fn release(&mut self) -> Result<(), AppError> {
        self.pending.clear();
        self.buffer = None;
        if self.gpiod_handle.take().is_some() {
            debug!("released edge watch on line {}", self.offset);
        }
        Ok(())
    }

    fn now(&self) -> Duration {
        match monotonic_now() {
            Ok(now) => now,
            Err(e) => {
                warn!("line {}: {e}", self.offset);
                self.clock_anchor
                    .map(|(mono, at)| mono + at.elapsed())
                    .unwrap_or_default()
            }
        }
    }
}

/// Same clock the kernel stamps line events with.
fn monotonic_now() -> Result<Duration, AppError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(AppError::Gpio(format!(
            "read monotonic clock: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(settings: &PinSettings) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        let (direction, drive, bias) = match settings.state {
            GpioState::Error | GpioState::Disabled => {
                return Err(AppError::InvalidState(
                    "cannot create settings for error or disabled state".into(),
                ));
            }
            GpioState::PushPull => (line::Direction::Output, Some(line::Drive::PushPull), None),
            GpioState::OpenDrain => (line::Direction::Output, Some(line::Drive::OpenDrain), None),
            GpioState::OpenSource => {
                (line::Direction::Output, Some(line::Drive::OpenSource), None)
            }
            GpioState::Floating => (line::Direction::Input, None, None),
            GpioState::PullUp => (line::Direction::Input, None, Some(line::Bias::PullUp)),
            GpioState::PullDown => (line::Direction::Input, None, Some(line::Bias::PullDown)),
        };

        ls.set_direction(direction)
            .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
        if let Some(drive) = drive {
            ls.set_drive(drive)
                .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
        }
        if settings.state.is_edge_detectable() {
            ls.set_bias(bias)
                .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;
        }

        // both edges are always watched so the debounced state tracks the line;
        // the configured edge only filters notifications
        if settings.edge != EdgeDetect::None && settings.state.is_edge_detectable() {
            ls.set_edge_detection(Some(line::Edge::Both))
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, AppError> {
        let pins = self.pins.read();

        Ok(pins
            .get(&pin_id)
            .map(|handle| handle.read().settings.clone())
            .unwrap_or_default())
    }

    fn set_settings(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        settings.validate()?;

        let pins = self.pins.upgradable_read();

        // fast path for disabling pin
        if settings.state == GpioState::Disabled {
            if let Some(handle) = pins.get(&pin_id) {
                // the monitor must be stopped before the request it watches goes away
                handle.write().stop_monitor()?;
                let _ = RwLockUpgradableReadGuard::upgrade(pins).remove(&pin_id);
            }
            return Ok(());
        }

        match pins.get(&pin_id) {
            Some(handle) => {
                let mut handle = handle.write();
                handle.stop_monitor()?;

                let line_settings = Self::make_line_settings(settings)?;
                let line_cfg = Self::make_line_config(handle.line, line_settings)?;

                handle
                    .gpiod_handle
                    .lock()
                    .request
                    .reconfigure_lines(&line_cfg)
                    .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))?;

                handle.settings = settings.clone();
                handle.start_monitor(pin_id, event_handler)?;
            }
            None => {
                // the upgradable read lock is exclusive to this thread, so the new
                // handle can be built before upgrading
                let line_settings = Self::make_line_settings(settings)?;
                let line_cfg = Self::make_line_config(pin.line, line_settings)?;

                let gpiod_handle =
                    Arc::new(FairMutex::new(GpiodHandle::new(&pin.chip, &line_cfg)?));
                let mut handle = PinHandle::new(pin.line, settings.clone(), gpiod_handle);
                handle.start_monitor(pin_id, event_handler)?;

                let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
                pins.insert(pin_id, RwLock::new(handle));
            }
        }

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .read();

        handle.gpiod_handle.lock().level(handle.line)
    }

    fn write_value(&self, pin_id: u32, value: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let handle = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .read();

        if !handle.settings.state.is_writable() {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                handle.line,
                match value {
                    Level::Low => line::Value::InActive,
                    Level::High => line::Value::Active,
                },
            )
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        for handle in pins.values_mut() {
            handle.get_mut().stop_monitor()?;
        }
        pins.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_reads_and_advances() {
        let first = monotonic_now().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = monotonic_now().unwrap();
        assert!(second > first);
    }
}

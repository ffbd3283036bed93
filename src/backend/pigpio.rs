//! Backend driving a pigpio-style daemon over its socket command protocol.
//!
//! All request/response traffic goes through one shared [`CommandChannel`].
//! Each watched input gets its own notification connection that streams
//! 12-byte level reports after `NOIB`.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::channel::{ChannelOptions, CommandChannel};
use crate::config::{EdgeDetect, PigpioConfig, PinConfig};
use crate::debounce::{DebounceMonitor, DebounceSettings};
use crate::edge::{Edge, EdgeEventSource, Level, RawEdgeEvent};
use crate::error::AppError;
use crate::gpio::{EventHandler, GpioBackend, GpioState, PinSettings};
use crate::packet::{self, BackendCode, Command, FRAME_SIZE, Packet};

const PI_INPUT: i32 = 0;
const PI_OUTPUT: i32 = 1;

const PI_PUD_OFF: i32 = 0;
const PI_PUD_DOWN: i32 = 1;
const PI_PUD_UP: i32 = 2;

const REPORT_SIZE: usize = 12;
const PI_NTFY_FLAGS_WDOG: u16 = 1 << 5;
const PI_NTFY_FLAGS_ALIVE: u16 = 1 << 6;
const PI_NTFY_FLAGS_EVENT: u16 = 1 << 7;

pub struct PigpioBackend {
    config: PigpioConfig,
    channel: Arc<CommandChannel>,
    pins: RwLock<FxHashMap<u32, Mutex<PigpioPin>>>, // keyed by pin id
}

struct PigpioPin {
    gpio: u32,
    settings: PinSettings,
    monitor: Option<DebounceMonitor<PigpioNotifyLine>>,
}

impl PigpioPin {
    fn stop_monitor(&mut self) -> Result<(), AppError> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown()?;
        }
        Ok(())
    }
}

fn execute(channel: &CommandChannel, command: Command, p1: i32, p2: i32) -> Result<i32, AppError> {
    channel
        .send(&Packet::request(command, p1, p2))?
        .outcome()
        .map_err(|code| AppError::from_backend(command, code))
}

impl PigpioBackend {
    pub fn connect(config: &PigpioConfig) -> Result<Self, AppError> {
        let channel = CommandChannel::connect(config.address(), config.channel_options())?;
        let version = execute(&channel, Command::Version, 0, 0)?;
        info!("connected to pigpio daemon {} (version {version})", channel.peer());

        Ok(Self::with_channel(config.clone(), Arc::new(channel)))
    }

    pub fn with_channel(config: PigpioConfig, channel: Arc<CommandChannel>) -> Self {
        Self {
            config,
            channel,
            pins: RwLock::new(FxHashMap::default()),
        }
    }

    fn gpio(pin: &PinConfig) -> Result<i32, AppError> {
        i32::try_from(pin.line)
            .map_err(|_| AppError::InvalidValue(format!("line {} out of range", pin.line)))
    }

    fn apply_state(&self, gpio: i32, state: GpioState) -> Result<(), AppError> {
        let (mode, pud) = match state {
            GpioState::Error => {
                return Err(AppError::InvalidState(
                    "cannot set pin to error state".into(),
                ));
            }
            GpioState::OpenDrain | GpioState::OpenSource => {
                return Err(AppError::InvalidState(
                    "pigpio supports push-pull outputs only".into(),
                ));
            }
            GpioState::PushPull => (PI_OUTPUT, None),
            GpioState::Disabled | GpioState::Floating => (PI_INPUT, Some(PI_PUD_OFF)),
            GpioState::PullUp => (PI_INPUT, Some(PI_PUD_UP)),
            GpioState::PullDown => (PI_INPUT, Some(PI_PUD_DOWN)),
        };

        execute(&self.channel, Command::SetMode, gpio, mode)?;
        if let Some(pud) = pud {
            execute(&self.channel, Command::SetPullUpDown, gpio, pud)?;
        }
        Ok(())
    }
}

impl GpioBackend for PigpioBackend {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, AppError> {
        let pins = self.pins.read();

        Ok(pins
            .get(&pin_id)
            .map(|pin| pin.lock().settings.clone())
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
        let gpio = Self::gpio(pin)?;

        let mut pins = self.pins.write();

        if settings.state == GpioState::Disabled {
            if let Some(mut existing) = pins.remove(&pin_id) {
                existing.get_mut().stop_monitor()?;
                self.apply_state(gpio, GpioState::Disabled)?;
            }
            return Ok(());
        }

        let entry = pins.entry(pin_id).or_insert_with(|| {
            Mutex::new(PigpioPin {
                gpio: pin.line,
                settings: PinSettings::default(),
                monitor: None,
            })
        });
        let state = entry.get_mut();

        state.stop_monitor()?;
        self.apply_state(gpio, settings.state)?;
        state.settings = settings.clone();

        if settings.edge != EdgeDetect::None
            && let Some(handler) = event_handler
        {
            let line = PigpioNotifyLine::open(&self.config, self.channel.clone(), pin.line)?;
            let debounce = DebounceSettings::new(settings.debounce()).with_notify(settings.edge);
            state.monitor = Some(DebounceMonitor::start(pin_id, line, debounce, handler)?);
        }

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let gpio = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .lock()
            .gpio;

        let value = execute(&self.channel, Command::Read, gpio as i32, 0)?;
        Ok(Level::from(value != 0))
    }

    fn write_value(&self, pin_id: u32, value: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let pin = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?
            .lock();

        if !pin.settings.state.is_writable() {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        execute(
            &self.channel,
            Command::Write,
            pin.gpio as i32,
            value.as_u8() as i32,
        )?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        for pin in pins.values_mut() {
            pin.get_mut().stop_monitor()?;
        }
        pins.clear();
        self.channel.close();
        Ok(())
    }
}

/// Edge source fed by a daemon notification stream for a single GPIO.
///
/// Reports are timestamped on receipt with a local monotonic clock, since the
/// daemon's tick counter is not readable without a round trip.
pub struct PigpioNotifyLine {
    gpio: u32,
    channel: Arc<CommandChannel>,
    stream: Option<TcpStream>,
    options: ChannelOptions,
    handle: Option<i32>,
    level: Level,
    report: [u8; REPORT_SIZE],
    filled: usize,
    epoch: Instant,
}

impl PigpioNotifyLine {
    /// Claim `gpio` by opening a dedicated notification connection.
    pub fn open(
        config: &PigpioConfig,
        channel: Arc<CommandChannel>,
        gpio: u32,
    ) -> Result<Self, AppError> {
        let options = config.channel_options();
        let address = config.address();
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| AppError::Connect(format!("resolve {address}: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => return Self::with_stream(stream, channel, gpio, options),
                Err(e) => last_err = Some(format!("notification stream to {addr}: {e}")),
            }
        }

        Err(AppError::Connect(last_err.unwrap_or_else(|| {
            format!("notification stream to {address}: address resolved to nothing")
        })))
    }

    pub fn with_stream(
        stream: TcpStream,
        channel: Arc<CommandChannel>,
        gpio: u32,
        options: ChannelOptions,
    ) -> Result<Self, AppError> {
        if gpio > 31 {
            return Err(AppError::InvalidValue(format!(
                "gpio {gpio} is outside the notification bank"
            )));
        }

        Ok(Self {
            gpio,
            channel,
            stream: Some(stream),
            options,
            handle: None,
            level: Level::Low,
            report: [0; REPORT_SIZE],
            filled: 0,
            epoch: Instant::now(),
        })
    }

    fn open_notifications(
        stream: &mut TcpStream,
        options: &ChannelOptions,
    ) -> Result<i32, AppError> {
        stream
            .set_read_timeout(options.response_timeout)
            .map_err(|e| AppError::Transport(format!("notification timeout: {e}")))?;

        let request = Packet::request(Command::NotifyOpenInBand, 0, 0);
        trace!("[NOTIFY TX] -> {request}");
        stream
            .write_all(&request.to_bytes())
            .map_err(|e| AppError::Transport(format!("write NOIB: {e}")))?;

        let mut frame = [0u8; FRAME_SIZE];
        stream
            .read_exact(&mut frame)
            .map_err(|e| AppError::Transport(format!("read NOIB response: {e}")))?;
        let response = packet::decode(&frame)?;
        trace!("[NOTIFY RX] <- {response}");

        response
            .outcome()
            .map_err(|code| AppError::from_backend(Command::NotifyOpenInBand, code))
    }
}

/// Watched level from one report, or `None` for keep-alive, watchdog and event reports.
fn report_level(report: &[u8; REPORT_SIZE], gpio: u32) -> Option<Level> {
    let flags = u16::from_le_bytes([report[2], report[3]]);
    if flags & (PI_NTFY_FLAGS_WDOG | PI_NTFY_FLAGS_ALIVE | PI_NTFY_FLAGS_EVENT) != 0 {
        return None;
    }
    let levels = u32::from_le_bytes([report[8], report[9], report[10], report[11]]);
    Some(Level::from(levels & (1 << gpio) != 0))
}

impl EdgeEventSource for PigpioNotifyLine {
    fn arm(&mut self) -> Result<(), AppError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            AppError::InvalidState(format!("gpio {} already released", self.gpio))
        })?;
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = Self::open_notifications(stream, &self.options)?;
        self.handle = Some(handle);

        self.level = Level::from(execute(&self.channel, Command::Read, self.gpio as i32, 0)? != 0);
        execute(
            &self.channel,
            Command::NotifyBegin,
            handle,
            (1u32 << self.gpio) as i32,
        )?;
        debug!(
            "notifications for gpio {} on handle {handle}, level {:?}",
            self.gpio, self.level
        );
        Ok(())
    }

    fn wait_for_edge(&mut self, timeout: Duration) -> Result<Option<RawEdgeEvent>, AppError> {
        let (Some(stream), Some(_)) = (self.stream.as_mut(), self.handle) else {
            return Err(AppError::InvalidState(format!(
                "gpio {} is not armed",
                self.gpio
            )));
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            stream
                .set_read_timeout(Some(remaining))
                .map_err(|e| AppError::Transport(format!("notification timeout: {e}")))?;

            match stream.read(&mut self.report[self.filled..]) {
                Ok(0) => {
                    return Err(AppError::Transport(format!(
                        "notification stream for gpio {} closed",
                        self.gpio
                    )));
                }
                Ok(n) => {
                    self.filled += n;
                    if self.filled < REPORT_SIZE {
                        continue;
                    }
                    self.filled = 0;

                    let Some(level) = report_level(&self.report, self.gpio) else {
                        continue;
                    };
                    if let Some(edge) = Edge::between(self.level, level) {
                        self.level = level;
                        return Ok(Some(RawEdgeEvent {
                            edge,
                            timestamp: self.epoch.elapsed(),
                        }));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(AppError::Transport(format!(
                        "notification stream for gpio {}: {e}",
                        self.gpio
                    )));
                }
            }
        }
    }

    fn read_level(&self) -> Result<Level, AppError> {
        let value = execute(&self.channel, Command::Read, self.gpio as i32, 0)?;
        Ok(Level::from(value != 0))
    }

    fn release(&mut self) -> Result<(), AppError> {
        // NC must reach the daemon before the socket goes, which reaps the handle
        let closed = match self.handle.take() {
            Some(handle) => {
                debug!("closing notification handle {handle} for gpio {}", self.gpio);
                match execute(&self.channel, Command::NotifyClose, handle, 0) {
                    Ok(_) => Ok(()),
                    Err(AppError::Backend {
                        code: BackendCode::BAD_HANDLE,
                        ..
                    }) => {
                        debug!("notification handle {handle} was already released");
                        Ok(())
                    }
                    Err(e) => {
                        warn!("close notification handle {handle}: {e}");
                        Err(e)
                    }
                }
            }
            None => Ok(()),
        };

        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        closed
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

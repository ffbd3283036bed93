use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{EdgeDetect, PinConfig};
use crate::debounce::{DebounceMonitor, DebounceSettings};
use crate::edge::{Edge, EdgeEventSource, Level, RawEdgeEvent};
use crate::error::AppError;
use crate::gpio::{EventHandler, GpioBackend, GpioState, PinSettings};

/// In-memory backend. Input levels are driven with [`set_input_level`] or raw
/// [`inject_edge`] calls, which feed the pin's debounce monitor.
///
/// [`set_input_level`]: MockGpioBackend::set_input_level
/// [`inject_edge`]: MockGpioBackend::inject_edge
#[derive(Default)]
pub struct MockGpioBackend {
    pins: RwLock<FxHashMap<u32, Mutex<MockPinState>>>, // keyed by pin id
}

struct MockPinState {
    settings: PinSettings,
    value: Level,
    wire: Arc<MockWire>,
    monitor: Option<DebounceMonitor<MockLine>>,
}

impl MockPinState {
    fn new() -> Self {
        Self {
            settings: PinSettings::default(),
            value: Level::Low,
            wire: Arc::new(MockWire::new()),
            monitor: None,
        }
    }

    fn stop_monitor(&mut self) -> Result<(), AppError> {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown()?;
        }
        Ok(())
    }
}

/// The simulated electrical side of one pin.
struct MockWire {
    epoch: Instant,
    pending: Mutex<VecDeque<RawEdgeEvent>>,
    arrived: Condvar,
}

impl MockWire {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            pending: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn push(&self, edge: Edge) {
        let event = RawEdgeEvent {
            edge,
            timestamp: self.now(),
        };
        self.pending.lock().push_back(event);
        self.arrived.notify_all();
    }
}

/// Edge source over a [`MockWire`].
pub struct MockLine {
    wire: Arc<MockWire>,
    level: Level,
    armed: bool,
    released: bool,
}

impl MockLine {
    fn new(wire: Arc<MockWire>, level: Level) -> Self {
        Self {
            wire,
            level,
            armed: false,
            released: false,
        }
    }
}

impl EdgeEventSource for MockLine {
    fn arm(&mut self) -> Result<(), AppError> {
        if self.released {
            return Err(AppError::InvalidState("mock line already released".into()));
        }
        // edges from before arming are not ours
        self.wire.pending.lock().clear();
        self.armed = true;
        Ok(())
    }

    fn wait_for_edge(&mut self, timeout: Duration) -> Result<Option<RawEdgeEvent>, AppError> {
        if !self.armed || self.released {
            return Err(AppError::InvalidState("mock line is not armed".into()));
        }

        let deadline = Instant::now() + timeout;
        let mut pending = self.wire.pending.lock();
        loop {
            if let Some(event) = pending.pop_front() {
                self.level = event.edge.level();
                return Ok(Some(event));
            }
            if self.wire.arrived.wait_until(&mut pending, deadline).timed_out() {
                return Ok(pending.pop_front().inspect(|event| {
                    self.level = event.edge.level();
                }));
            }
        }
    }

    fn read_level(&self) -> Result<Level, AppError> {
        Ok(self.level)
    }

    fn release(&mut self) -> Result<(), AppError> {
        if !self.released {
            self.released = true;
            self.armed = false;
        }
        Ok(())
    }

    fn now(&self) -> Duration {
        self.wire.now()
    }
}

impl MockGpioBackend {
    /// Drive an input pin to `level`, producing an edge if it changed.
    pub fn set_input_level(&self, pin_id: u32, level: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let entry = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?;
        let mut pin = entry.lock();

        if !pin.settings.state.is_edge_detectable() {
            return Err(AppError::InvalidState(
                "pin must be in input mode to drive its level".into(),
            ));
        }

        if let Some(edge) = Edge::between(pin.value, level) {
            pin.value = level;
            pin.wire.push(edge);
        }
        Ok(())
    }

    /// Push a raw edge regardless of the current level, as contact bounce does.
    pub fn inject_edge(&self, pin_id: u32, edge: Edge) -> Result<(), AppError> {
        let pins = self.pins.read();
        let entry = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?;
        let mut pin = entry.lock();

        pin.value = edge.level();
        pin.wire.push(edge);
        Ok(())
    }
}

impl GpioBackend for MockGpioBackend {
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
        _pin: &PinConfig,
        settings: &PinSettings,
        event_handler: Option<EventHandler>,
    ) -> Result<(), AppError> {
        settings.validate()?;

        let mut pins = self.pins.write();
        let entry = pins
            .entry(pin_id)
            .or_insert_with(|| Mutex::new(MockPinState::new()));
        let pin = entry.get_mut();

        pin.stop_monitor()?;
        pin.settings = settings.clone();

        if settings.state == GpioState::Disabled {
            pin.value = Level::Low;
            return Ok(());
        }

        if settings.edge != EdgeDetect::None
            && let Some(handler) = event_handler
        {
            let line = MockLine::new(pin.wire.clone(), pin.value);
            let debounce = DebounceSettings::new(settings.debounce()).with_notify(settings.edge);
            pin.monitor = Some(DebounceMonitor::start(pin_id, line, debounce, handler)?);
            debug!("mock pin {pin_id} watching edges");
        }

        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<Level, AppError> {
        let pins = self.pins.read();
        let entry = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?;
        let pin = entry.lock();

        if pin.settings.state == GpioState::Disabled {
            return Err(AppError::InvalidState(
                "pin is disabled and cannot be read".to_string(),
            ));
        }
        Ok(pin.value)
    }

    fn write_value(&self, pin_id: u32, value: Level) -> Result<(), AppError> {
        let pins = self.pins.read();
        let entry = pins
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidState("pin not configured, set state first".into()))?;
        let mut pin = entry.lock();

        if !pin.settings.state.is_writable() {
            return Err(AppError::InvalidState(
                "pin must be in output mode to set value".into(),
            ));
        }

        pin.value = value;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), AppError> {
        let mut pins = self.pins.write();
        for pin in pins.values_mut() {
            pin.get_mut().stop_monitor()?;
        }
        pins.clear();
        Ok(())
    }
}

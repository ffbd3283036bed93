use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{AppConfig, EdgeDetect, GpioCapability, PinConfig};
use crate::edge::Level;
use crate::error::AppError;

pub type GpioManager<B> = GenericGpioManager<B>;

pub type GpioState = GpioCapability;

impl GpioState {
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            GpioState::PushPull | GpioState::OpenDrain | GpioState::OpenSource
        )
    }

    pub fn is_edge_detectable(&self) -> bool {
        matches!(
            self,
            GpioState::Floating | GpioState::PullUp | GpioState::PullDown
        )
    }
}

/// A validated, debounced level change on one pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChangeEvent {
    pub pin_id: u32,
    pub state: Level,
    pub timestamp_ms: u64,
}

/// Receives state changes from debounce monitors.
pub trait StateChangeSink: Send + Sync {
    fn dispatch(&self, event: StateChangeEvent);
}

pub type EventHandler = Arc<dyn StateChangeSink>;

/// Keeps a bounded per-pin history and fans events out to subscribers.
pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<StateChangeEvent>,
    event_history: FxHashMap<u32, RwLock<VecDeque<StateChangeEvent>>>,
    event_history_capacity: usize,
}

impl EventCallbackHandler {
    pub fn new(
        event_tx: broadcast::Sender<StateChangeEvent>,
        event_history: FxHashMap<u32, RwLock<VecDeque<StateChangeEvent>>>,
        event_history_capacity: usize,
    ) -> Self {
        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }
}

impl StateChangeSink for EventCallbackHandler {
    fn dispatch(&self, event: StateChangeEvent) {
        if let Some(history_lock) = self.event_history.get(&event.pin_id) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinSettings {
    pub state: GpioState,
    pub edge: EdgeDetect,
    /// Debounce window applied to edge notifications.
    pub debounce_ms: u64,
}

impl PinSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Reject combinations no backend can apply.
    pub fn validate(&self) -> Result<(), AppError> {
        match self.state {
            GpioState::Error => Err(AppError::InvalidState(
                "cannot set pin to error state".into(),
            )),
            GpioState::Disabled => {
                if self.edge != EdgeDetect::None {
                    return Err(AppError::InvalidState(
                        "cannot set edge detection on disabled pin".into(),
                    ));
                }
                if self.debounce_ms != 0 {
                    return Err(AppError::InvalidState(
                        "cannot set debounce on disabled pin".into(),
                    ));
                }
                Ok(())
            }
            _ => {
                match self.edge {
                    EdgeDetect::None => {
                        if self.debounce_ms != 0 {
                            return Err(AppError::InvalidState(
                                "debouncing requires edge detection to be enabled".into(),
                            ));
                        }
                    }
                    _ => {
                        if !self.state.is_edge_detectable() {
                            return Err(AppError::InvalidState(
                                "edge detection requires an input-capable state".into(),
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            state: GpioState::Disabled,
            edge: EdgeDetect::None,
            debounce_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinDescriptor {
    pub info: PinConfig,
    pub settings: PinSettings,
}

pub trait GpioBackend: Send + Sync {
    fn get_settings(&self, pin_id: u32) -> Result<PinSettings, AppError>;
    fn set_settings(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        settings: &PinSettings,
        event_callback: Option<EventHandler>,
    ) -> Result<(), AppError>;
    fn read_value(&self, pin_id: u32) -> Result<Level, AppError>;
    fn write_value(&self, pin_id: u32, value: Level) -> Result<(), AppError>;
    /// Release every configured pin, stopping its monitor first.
    fn shutdown(&self) -> Result<(), AppError>;
}

pub struct GenericGpioManager<B: GpioBackend + ?Sized> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    event_handler: Arc<EventCallbackHandler>,
}

impl<B: GpioBackend + ?Sized> GenericGpioManager<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let mut history = FxHashMap::default();
        for id in config.gpios.keys() {
            history.insert(*id, RwLock::new(VecDeque::new()));
        }

        let event_handler = Arc::new(EventCallbackHandler::new(
            event_tx,
            history,
            config.event_history_capacity,
        ));

        Self {
            config,
            backend,
            event_handler,
        }
    }

    fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.config
            .gpios
            .get(&pin_id)
            .ok_or_else(|| AppError::NotFoundPin(pin_id.to_string()))
    }

    fn capability_matches(state: GpioState, caps: &HashSet<GpioState>) -> bool {
        match state {
            GpioState::Error => false,
            GpioState::Disabled => true,
            _ => caps.contains(&state),
        }
    }

    pub async fn list_pins(&self) -> HashMap<u32, PinDescriptor> {
        self.config
            .gpios
            .iter()
            .map(|(id, cfg)| {
                let settings = self.backend.get_settings(*id).unwrap_or_default();
                (
                    *id,
                    PinDescriptor {
                        info: cfg.clone(),
                        settings,
                    },
                )
            })
            .collect()
    }

    pub async fn get_pin_descriptor(&self, pin_id: u32) -> Result<PinDescriptor, AppError> {
        let cfg = self.pin_config(pin_id)?.clone();
        let settings = self.backend.get_settings(pin_id).unwrap_or_default();

        Ok(PinDescriptor {
            info: cfg,
            settings,
        })
    }

    pub async fn get_pin_info(&self, pin_id: u32) -> Result<PinConfig, AppError> {
        self.pin_config(pin_id).cloned()
    }

    pub async fn get_pin_settings(&self, pin_id: u32) -> Result<PinSettings, AppError> {
        self.pin_config(pin_id)?;
        self.backend.get_settings(pin_id)
    }

    pub async fn set_pin_settings(
        &self,
        pin_id: u32,
        settings: &PinSettings,
    ) -> Result<(), AppError> {
        let cfg = self.pin_config(pin_id)?;

        if !Self::capability_matches(settings.state, &cfg.capabilities) {
            return Err(AppError::InvalidState(format!(
                "State not supported by pin {pin_id}"
            )));
        }

        let handler: Option<EventHandler> = if settings.edge != EdgeDetect::None {
            if !settings.state.is_edge_detectable() {
                return Err(AppError::InvalidState(format!(
                    "Edge detection requires an input-capable state by pin {pin_id}",
                )));
            }
            Some(self.event_handler.clone() as EventHandler)
        } else {
            None
        };

        self.backend.set_settings(pin_id, cfg, settings, handler)
    }

    pub async fn read_value(&self, pin_id: u32) -> Result<Level, AppError> {
        self.pin_config(pin_id)?;
        self.backend.read_value(pin_id)
    }

    pub async fn write_value(&self, pin_id: u32, value: Level) -> Result<(), AppError> {
        self.pin_config(pin_id)?;
        self.backend.write_value(pin_id, value)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.event_handler.event_tx.subscribe()
    }

    pub async fn get_events(
        &self,
        pin_id: u32,
        limit: Option<usize>,
    ) -> Result<Vec<StateChangeEvent>, AppError> {
        self.pin_config(pin_id)?;
        let Some(history) = self.event_handler.event_history.get(&pin_id) else {
            return Ok(Vec::new());
        };

        // oldest first, keeping only the newest `limit`
        let history = history.read();
        let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
        Ok(history.iter().skip(skip).cloned().collect())
    }

    pub async fn get_last_event(&self, pin_id: u32) -> Result<Option<StateChangeEvent>, AppError> {
        self.pin_config(pin_id)?;
        let map = &self.event_handler.event_history;

        Ok(map.get(&pin_id).and_then(|d| d.read().back().cloned()))
    }

    pub fn shutdown(&self) -> Result<(), AppError> {
        self.backend.shutdown()
    }
}

pub mod backend;
pub mod channel;
pub mod config;
pub mod debounce;
pub mod edge;
pub mod error;
pub mod gpio;
pub mod packet;
pub mod routes;

pub use channel::{ChannelOptions, ChannelState, ChannelStream, CommandChannel};
pub use config::{
    AppConfig, BackendConfig, EdgeDetect, GpioCapability, HttpConfig, PigpioConfig, PinConfig,
};
pub use debounce::{DebounceMonitor, DebounceSettings, MonitorState};
pub use edge::{Edge, EdgeEventSource, Level, RawEdgeEvent};
pub use error::AppError;
pub use gpio::{
    EventCallbackHandler, EventHandler, GpioBackend, GpioManager, GpioState, PinDescriptor,
    PinSettings, StateChangeEvent, StateChangeSink,
};
pub use packet::{BackendCode, Command, Packet};
pub use routes::{AppState, api_scope};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, PigpioBackend};

#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
pub mod pigpio;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::{GpiodLine, LibgpiodBackend};
pub use mock::{MockGpioBackend, MockLine};
pub use pigpio::{PigpioBackend, PigpioNotifyLine};

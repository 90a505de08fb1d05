//! Ambient utilities shared by the `usbmuxd` daemon: logging setup, the
//! enumerator thread bridge, and the raw device shapes the bridge carries.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{
    EnumeratorBridge, EnumeratorCommand, EnumeratorWorkerChannel, create_enumerator_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{RawDeviceNode, RawHotplugEvent};

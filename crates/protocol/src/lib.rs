//! Wire vocabulary for the usbmuxd RPC surface.
//!
//! This crate defines the typed arguments, results, and notifications that
//! cross the RPC boundary described in §6 of the daemon specification. It
//! intentionally carries no transport: framing and IPC mechanics are a
//! contract-only collaborator of the core and are not implemented here.

pub mod error;
pub mod ids;
pub mod rpc;
pub mod types;

pub use error::{ProtocolError, Result, parse_hex_u16};
pub use ids::{pack_device_id, unpack_device_id};
pub use rpc::{DeviceInfoResult, RpcHandler, SetRuleArgs, SetRuleBasicArgs};
pub use types::{
    DeviceId, DeviceInfo, DeviceState, DeviceTypeMask, Notification, RuleCommand, RuleRecord,
};

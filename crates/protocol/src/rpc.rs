//! The RPC surface contract, §6.1.
//!
//! `RpcHandler` is the trait the core implements; the RPC transport itself
//! (framing, the IPC mechanism a management UI actually speaks) is a
//! contract-only collaborator and is not implemented anywhere in this crate
//! or in the daemon — only this typed verb vocabulary is.

use crate::types::{DeviceId, DeviceState, DeviceTypeMask, RuleCommand};

/// `(name, state, assigned_vm, detail)` result of `get_device_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoResult {
    pub name: String,
    pub state: DeviceState,
    pub assigned_vm: Option<String>,
    pub detail: String,
}

/// Arguments to `policy_set_rule` / `policy_set_rule_basic` / `policy_set_rule_advanced`.
#[derive(Debug, Clone, Default)]
pub struct SetRuleArgs {
    pub pos: u16,
    pub command: RuleCommand_,
    pub description: String,
    pub vendor_hex: Option<String>,
    pub product_hex: Option<String>,
    pub serial: Option<String>,
    pub required_type: DeviceTypeMask,
    pub forbidden_type: DeviceTypeMask,
    pub sysattrs: Vec<(String, String)>,
    pub properties: Vec<(String, String)>,
    pub vm_uuid: Option<String>,
}

/// Placeholder default for `RuleCommand` inside `SetRuleArgs::default()`; the
/// real type has no meaningful default so callers always set it explicitly
/// before dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCommand_(pub RuleCommand);

impl Default for RuleCommand_ {
    fn default() -> Self {
        RuleCommand_(RuleCommand::Deny)
    }
}

/// Arguments to `policy_set_rule_basic`: the vendor/product/serial/command/
/// vm-uuid subset a simple device-row editor needs, with no sysattr/property
/// matchers or type masks.
#[derive(Debug, Clone, Default)]
pub struct SetRuleBasicArgs {
    pub pos: u16,
    pub command: RuleCommand_,
    pub description: String,
    pub vendor_hex: Option<String>,
    pub product_hex: Option<String>,
    pub serial: Option<String>,
    pub vm_uuid: Option<String>,
}

impl SetRuleBasicArgs {
    fn into_set_rule_args(self) -> SetRuleArgs {
        SetRuleArgs {
            pos: self.pos,
            command: self.command,
            description: self.description,
            vendor_hex: self.vendor_hex,
            product_hex: self.product_hex,
            serial: self.serial,
            required_type: DeviceTypeMask::NONE,
            forbidden_type: DeviceTypeMask::NONE,
            sysattrs: Vec::new(),
            properties: Vec::new(),
            vm_uuid: self.vm_uuid,
        }
    }
}

/// The core's RPC surface. Implemented by the daemon's dispatcher; generic
/// over the implementor's error type since `protocol` has no visibility
/// into the daemon's `DaemonError` taxonomy.
pub trait RpcHandler {
    type Error;

    async fn new_vm(&mut self, domid: u32, uuid: String) -> Result<(), Self::Error>;
    async fn vm_stopped(&mut self, domid: u32) -> Result<(), Self::Error>;
    async fn list_devices(&self) -> Result<Vec<DeviceId>, Self::Error>;
    async fn get_device_info(
        &self,
        dev_id: DeviceId,
        vm_uuid: String,
    ) -> Result<DeviceInfoResult, Self::Error>;
    async fn assign_device(&mut self, dev_id: DeviceId, vm_uuid: String)
    -> Result<(), Self::Error>;
    async fn unassign_device(&mut self, dev_id: DeviceId) -> Result<(), Self::Error>;
    async fn set_sticky(&mut self, dev_id: DeviceId, sticky: bool) -> Result<(), Self::Error>;
    async fn name_device(&mut self, dev_id: DeviceId, name: String) -> Result<(), Self::Error>;
    async fn policy_list(&self) -> Result<Vec<u16>, Self::Error>;
    async fn policy_get_rule(
        &self,
        pos: u16,
    ) -> Result<crate::types::RuleRecord, Self::Error>;
    async fn policy_get_rules(&self) -> Result<Vec<crate::types::RuleRecord>, Self::Error>;
    async fn policy_set_rule(&mut self, args: SetRuleArgs) -> Result<(), Self::Error>;
    async fn policy_remove_rule(&mut self, pos: u16) -> Result<(), Self::Error>;
    async fn reload_policy(&mut self) -> Result<(), Self::Error>;
    async fn state(&self) -> Result<String, Self::Error>;

    /// Sugar over `policy_set_rule` for callers editing only the basic
    /// vendor/product/serial/command/vm-uuid fields (§6.1).
    async fn policy_set_rule_basic(
        &mut self,
        args: SetRuleBasicArgs,
    ) -> Result<(), Self::Error> {
        self.policy_set_rule(args.into_set_rule_args()).await
    }

    /// Sugar over `policy_set_rule` for callers that already have the full
    /// matcher set (type masks, sysattrs, properties) in hand (§6.1).
    async fn policy_set_rule_advanced(&mut self, args: SetRuleArgs) -> Result<(), Self::Error> {
        self.policy_set_rule(args).await
    }
}

//! The policy engine, §4.4.
//!
//! Owns the in-memory rule list; the settings bridge that persists it is
//! stateless (§3.3). Kept behind an `Arc<RwLock<_>>` at the dispatcher layer
//! only because the RPC surface and the hotplug path both need shared
//! access to it from separate `tokio` tasks — the policy engine itself has
//! no internal synchronization and assumes a single caller at a time,
//! consistent with §5's "single mutator" model.

use std::collections::BTreeMap;

use usbmuxd_protocol::RuleCommand;

use crate::device::{Device, DeviceRegistry};
use crate::error::{DaemonError, Result};
use crate::rule::Rule;
use crate::settings_bridge::{self, SettingsStore};
use crate::vm::{Vm, VmRegistry};

/// Default `pos` synthesised sticky rules start from, §4.4.6.
const DEFAULT_STICKY_POS: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAssignOutcome {
    /// The device is ambiguous; auto-assignment is refused outright.
    Ambiguous,
    /// No sticky/default rule and no focused VM accepting devices.
    NoTarget,
    /// Policy denied the pairing (no notify-worthy bind happened).
    Denied,
    /// Bind to this domid; caller should now run the attach protocol.
    Bind(i32),
}

#[derive(Debug, Default)]
pub struct PolicyEngine {
    rules: BTreeMap<u16, Rule>,
    ui_vm_uuid: String,
}

impl PolicyEngine {
    pub fn new(ui_vm_uuid: impl Into<String>) -> Self {
        Self {
            rules: BTreeMap::new(),
            ui_vm_uuid: ui_vm_uuid.into(),
        }
    }

    // ---- §4.4.3 verbs -----------------------------------------------

    pub fn get_rule(&self, pos: u16) -> Option<&Rule> {
        self.rules.get(&pos)
    }

    /// Inserts preserving ascending order; on exact `pos` collision,
    /// replaces in place.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.insert(rule.pos, rule);
    }

    pub fn remove_rule(&mut self, pos: u16) -> Result<Rule> {
        self.rules
            .remove(&pos)
            .ok_or_else(|| DaemonError::NotFound(format!("rule {pos}")))
    }

    pub fn list_rules(&self) -> Vec<u16> {
        self.rules.keys().copied().collect()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub async fn reload_from_store<S: SettingsStore>(&mut self, store: &S) -> Result<()> {
        let rules = settings_bridge::reload_from_store(store).await?;
        self.rules = rules.into_iter().map(|r| (r.pos, r)).collect();
        Ok(())
    }

    pub async fn persist<S: SettingsStore>(&self, store: &S) -> Result<()> {
        let ordered: Vec<Rule> = self.rules.values().cloned().collect();
        settings_bridge::persist(store, &ordered).await
    }

    // ---- §4.4.4 decision functions ------------------------------------

    /// Walks the sorted list; on the first rule matching both device and
    /// VM, returns `(command != deny, Some(pos))`. No match: `(false,
    /// None)` (the implicit trailing deny).
    pub fn is_allowed(&self, device: &Device, vm: &Vm) -> (bool, Option<u16>) {
        for rule in self.rules.values() {
            if rule.matches(device, vm) {
                return (rule.command != RuleCommand::Deny, Some(rule.pos));
            }
        }
        (false, None)
    }

    pub fn sticky_lookup(&self, device: &Device) -> Option<&Rule> {
        self.rules
            .values()
            .find(|r| r.command == RuleCommand::Always && r.matches_device(device))
    }

    pub fn default_lookup(&self, device: &Device) -> Option<&Rule> {
        self.rules
            .values()
            .find(|r| r.command == RuleCommand::Default && r.matches_device(device))
    }

    pub fn sticky_uuid_for(&self, device: &Device) -> Option<String> {
        self.sticky_lookup(device).and_then(|r| r.vm_uuid.clone())
    }

    // ---- §4.4.5 auto-assignment on device arrival ---------------------

    /// `focused` is the management UI's currently focused VM and whether it
    /// accepts auto-bound devices while focused; this attribute lives
    /// outside the core's own entities (§3.1 names no such field on `Vm`)
    /// so it is supplied by the caller rather than invented on the model.
    pub fn auto_assign_new_device(
        &self,
        device: &Device,
        device_is_ambiguous: bool,
        vms: &VmRegistry,
        focused: Option<(&Vm, bool)>,
    ) -> AutoAssignOutcome {
        if device_is_ambiguous {
            return AutoAssignOutcome::Ambiguous;
        }

        let target_uuid = self
            .sticky_lookup(device)
            .or_else(|| self.default_lookup(device))
            .and_then(|r| r.vm_uuid.clone());

        let vm = if let Some(uuid) = target_uuid {
            vms.lookup_by_uuid(&uuid)
        } else {
            match focused {
                Some((vm, true)) => Some(vm),
                _ => None,
            }
        };

        let Some(vm) = vm else {
            return AutoAssignOutcome::NoTarget;
        };

        if vm.domid < 0 || vm.uuid == self.ui_vm_uuid {
            return AutoAssignOutcome::NoTarget;
        }

        let (allowed, _) = self.is_allowed(device, vm);
        if !allowed {
            return AutoAssignOutcome::Denied;
        }

        AutoAssignOutcome::Bind(vm.domid)
    }

    // ---- §4.4.6 sticky creation ----------------------------------------

    /// Synthesises a new `always` rule for `device` bound to `vm_uuid`.
    /// Refuses if the device is ambiguous. The disabled "already sticky"
    /// pre-check from the source is intentionally not reinstated (see
    /// DESIGN.md, Open Question 2): calling this twice for the same device
    /// simply creates a second `always` rule.
    pub fn set_sticky(
        &mut self,
        device: &Device,
        device_is_ambiguous: bool,
        vm_uuid: &str,
    ) -> Result<u16> {
        if device_is_ambiguous {
            return Err(DaemonError::Validation(
                "device is ambiguous, refusing to create a sticky rule".into(),
            ));
        }

        let pos = match self.rules.keys().next().copied() {
            Some(lowest) if lowest <= DEFAULT_STICKY_POS => lowest - 1,
            _ => DEFAULT_STICKY_POS,
        };

        let rule = Rule {
            pos,
            command: RuleCommand::Always,
            description: device.short_name.clone(),
            vendor_id: Some(device.vendor_id),
            product_id: Some(device.product_id),
            serial: device.serial.clone(),
            required_type: usbmuxd_protocol::DeviceTypeMask::NONE,
            forbidden_type: usbmuxd_protocol::DeviceTypeMask::NONE,
            sysattrs: Vec::new(),
            properties: Vec::new(),
            vm_uuid: Some(vm_uuid.to_string()),
        };
        self.rules.insert(pos, rule);
        Ok(pos)
    }

    /// Removes the sticky rule matching `device`, if any.
    pub fn unset_sticky(&mut self, device: &Device) -> Result<()> {
        let pos = self
            .sticky_lookup(device)
            .map(|r| r.pos)
            .ok_or_else(|| DaemonError::NotFound("no sticky rule for device".into()))?;
        self.rules.remove(&pos);
        Ok(())
    }

    // ---- §4.4.7 auto-assignment on VM start -----------------------------

    /// For every `always`/`default` rule matching `vm`, iterates the device
    /// registry and binds matching devices per §4.4.7. Returns `(aggregate,
    /// binds, rules_removed)`: `aggregate` is non-zero (integrity-violation
    /// bit) if a matched device was already bound elsewhere; `binds` lists
    /// `(bus, device, domid)` pairs the caller should now attach;
    /// `rules_removed` is true iff an ambiguous match cleansed a rule, in
    /// which case the caller must persist the rule list (§4.4.7: "remove
    /// any rules so marked and persist").
    pub fn auto_assign_devices_to_new_vm(
        &mut self,
        vm: &Vm,
        devices: &DeviceRegistry,
    ) -> (u32, Vec<(u8, u8, i32)>, bool) {
        const INTEGRITY_VIOLATION: u32 = 1;

        let mut aggregate = 0u32;
        let mut binds = Vec::new();
        let mut rules_to_remove = Vec::new();

        let matching_rule_positions: Vec<u16> = self
            .rules
            .values()
            .filter(|r| {
                matches!(r.command, RuleCommand::Always | RuleCommand::Default) && r.matches_vm(vm)
            })
            .map(|r| r.pos)
            .collect();

        for pos in matching_rule_positions {
            let Some(rule) = self.rules.get(&pos) else {
                continue;
            };
            for device in devices.iter() {
                if !rule.matches_device(device) {
                    continue;
                }
                if device.assigned_vm == Some(vm.domid) {
                    continue;
                }
                if let Some(other_domid) = device.assigned_vm {
                    tracing::error!(
                        bus = device.bus,
                        dev = device.device,
                        assigned_to = other_domid,
                        target = vm.domid,
                        "always/default rule matches a device already bound elsewhere"
                    );
                    aggregate |= INTEGRITY_VIOLATION;
                    continue;
                }
                if devices.is_ambiguous(device.bus, device.device) {
                    rules_to_remove.push(pos);
                    continue;
                }
                binds.push((device.bus, device.device, vm.domid));
            }
        }

        let rules_removed = !rules_to_remove.is_empty();
        for pos in rules_to_remove {
            self.rules.remove(&pos);
        }

        (aggregate, binds, rules_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usbmuxd_common::RawDeviceNode;
    use usbmuxd_protocol::DeviceTypeMask;

    fn device(vendor: u16, product: u16, serial: Option<&str>) -> Device {
        Device {
            bus: 1,
            device: 1,
            vendor_id: vendor,
            product_id: product,
            serial: serial.map(String::from),
            short_name: "dev".into(),
            long_name: "vendor".into(),
            sysname: "1-1".into(),
            device_type: DeviceTypeMask::NONE,
            node: RawDeviceNode::default(),
            assigned_vm: None,
        }
    }

    fn rule(pos: u16, command: RuleCommand, vendor: u16, vm_uuid: Option<&str>) -> Rule {
        Rule {
            pos,
            command,
            description: String::new(),
            vendor_id: Some(vendor),
            product_id: None,
            serial: None,
            required_type: DeviceTypeMask::NONE,
            forbidden_type: DeviceTypeMask::NONE,
            sysattrs: Vec::new(),
            properties: Vec::new(),
            vm_uuid: vm_uuid.map(String::from),
        }
    }

    #[test]
    fn deny_wins_over_later_allow() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(10, RuleCommand::Deny, 0x1234, None));
        engine.add_rule(rule(20, RuleCommand::Allow, 0x1234, Some("U")));

        let dev = device(0x1234, 1, None);
        let vm = Vm {
            domid: 1,
            uuid: "U".into(),
        };
        let (allowed, pos) = engine.is_allowed(&dev, &vm);
        assert!(!allowed);
        assert_eq!(pos, Some(10));
    }

    #[test]
    fn sticky_set_then_unset_clears_lookup() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        let dev = device(0x046d, 0xc534, Some("S1"));
        engine.set_sticky(&dev, false, "U").unwrap();
        assert!(engine.sticky_lookup(&dev).is_some());
        engine.unset_sticky(&dev).unwrap();
        assert!(engine.sticky_lookup(&dev).is_none());
    }

    #[test]
    fn set_sticky_refuses_ambiguous_device() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        let dev = device(0x046d, 0xc534, None);
        assert!(engine.set_sticky(&dev, true, "U").is_err());
    }

    #[test]
    fn set_sticky_decrements_pos_below_existing_low_rule() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(500, RuleCommand::Allow, 0x1234, None));
        let dev = device(0x046d, 0xc534, None);
        let pos = engine.set_sticky(&dev, false, "U").unwrap();
        assert_eq!(pos, 499);
    }

    #[test]
    fn add_rule_replace_preserves_order() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(5, RuleCommand::Allow, 1, None));
        engine.add_rule(rule(10, RuleCommand::Allow, 1, None));
        engine.add_rule(rule(20, RuleCommand::Allow, 1, None));
        engine.add_rule(rule(10, RuleCommand::Deny, 99, None));

        assert_eq!(engine.list_rules(), vec![5, 10, 20]);
        assert_eq!(engine.get_rule(10).unwrap().vendor_id, Some(99));
    }

    #[test]
    fn auto_assign_refuses_ambiguous_device() {
        let engine = PolicyEngine::new("ui-vm-uuid");
        let dev = device(0x046d, 0xc534, None);
        let vms = VmRegistry::new();
        let outcome = engine.auto_assign_new_device(&dev, true, &vms, None);
        assert_eq!(outcome, AutoAssignOutcome::Ambiguous);
    }

    #[test]
    fn auto_assign_binds_to_sticky_target() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(10, RuleCommand::Always, 0x046d, Some("U")));
        let dev = device(0x046d, 0xc534, None);
        let mut vms = VmRegistry::new();
        vms.add(5, "U").unwrap();
        let outcome = engine.auto_assign_new_device(&dev, false, &vms, None);
        assert_eq!(outcome, AutoAssignOutcome::Bind(5));
    }

    #[test]
    fn auto_assign_never_targets_ui_vm() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(10, RuleCommand::Always, 0x046d, Some("ui-vm-uuid")));
        let dev = device(0x046d, 0xc534, None);
        let mut vms = VmRegistry::new();
        vms.add(5, "ui-vm-uuid").unwrap();
        let outcome = engine.auto_assign_new_device(&dev, false, &vms, None);
        assert_eq!(outcome, AutoAssignOutcome::NoTarget);
    }

    #[test]
    fn vm_start_autobind_clears_rule_on_ambiguous_match() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(50, RuleCommand::Always, 0x046d, Some("U")));

        let mut devices = DeviceRegistry::new();
        devices.add(device(0x046d, 0xc534, Some("S1"))).unwrap();
        let mut ambiguous_dev = device(0x046d, 0xc534, None);
        ambiguous_dev.device = 2;
        devices.add(ambiguous_dev).unwrap();

        let vm = Vm {
            domid: 9,
            uuid: "U".into(),
        };
        let (aggregate, binds, rules_removed) = engine.auto_assign_devices_to_new_vm(&vm, &devices);
        assert!(binds.is_empty());
        assert!(engine.get_rule(50).is_none());
        assert_eq!(aggregate, 0);
        assert!(rules_removed);
    }

    #[test]
    fn vm_start_autobind_flags_integrity_violation() {
        let mut engine = PolicyEngine::new("ui-vm-uuid");
        engine.add_rule(rule(50, RuleCommand::Always, 0x046d, Some("U")));

        let mut devices = DeviceRegistry::new();
        let mut bound = device(0x046d, 0xc534, Some("S1"));
        bound.assigned_vm = Some(42);
        devices.add(bound).unwrap();

        let vm = Vm {
            domid: 9,
            uuid: "U".into(),
        };
        let (aggregate, binds, rules_removed) = engine.auto_assign_devices_to_new_vm(&vm, &devices);
        assert!(binds.is_empty());
        assert_eq!(aggregate, 1);
        assert!(!rules_removed);
    }
}

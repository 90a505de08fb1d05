//! The state dump, §4.9 / §6.3.
//!
//! One implementation backs both the `state` RPC verb and the `--state` CLI
//! flag: a human-readable snapshot of VMs, devices, and rules, plus the
//! per-device state resolution `get_device_info` reports over RPC.

use std::fmt::Write as _;

use usbmuxd_protocol::DeviceState;

use crate::device::{Device, DeviceRegistry};
use crate::policy::PolicyEngine;
use crate::vm::VmRegistry;

/// §6.3's resolution table: bound devices resolve from the caller's
/// perspective (`vm_uuid`); unbound devices resolve from whether a sticky
/// rule exists for them, and if so whether it targets the caller
/// (`always-only-this`) or some other VM (`assigned`). `blocked`/
/// `platform`/`hid-*` are never produced — see DESIGN.md, Open Question 4.
pub fn resolve_device_state(
    device: &Device,
    vm_uuid: &str,
    policy: &PolicyEngine,
    vms: &VmRegistry,
) -> DeviceState {
    let sticky = policy.sticky_lookup(device);

    if let Some(bound_domid) = device.assigned_vm {
        let sticky_matches_caller = sticky
            .and_then(|r| r.vm_uuid.as_deref())
            .map(|uuid| uuid == vm_uuid)
            .unwrap_or(false);
        if sticky_matches_caller {
            return DeviceState::ThisAlways;
        }
        let caller_is_bound_vm = vms
            .lookup(bound_domid)
            .map(|vm| vm.uuid == vm_uuid)
            .unwrap_or(false);
        if caller_is_bound_vm {
            return DeviceState::This;
        }
        return DeviceState::InUse;
    }

    if let Some(sticky) = sticky {
        if device
            .device_type
            .contains(usbmuxd_protocol::DeviceTypeMask::OPTICAL)
        {
            return DeviceState::CdAlways;
        }
        let sticky_targets_caller = sticky.vm_uuid.as_deref() == Some(vm_uuid);
        return if sticky_targets_caller {
            DeviceState::AlwaysOnlyThis
        } else {
            DeviceState::Assigned
        };
    }

    if device
        .device_type
        .contains(usbmuxd_protocol::DeviceTypeMask::OPTICAL)
    {
        return DeviceState::CdDom0;
    }

    DeviceState::Unused
}

/// Renders the full diagnostic dump: VM list, device list, rule list.
pub fn dump_state(vms: &VmRegistry, devices: &DeviceRegistry, policy: &PolicyEngine) -> String {
    let mut out = String::new();

    writeln!(out, "vms:").ok();
    for vm in vms.iter() {
        writeln!(out, "  domid={} uuid={}", vm.domid, vm.uuid).ok();
    }

    writeln!(out, "devices:").ok();
    for device in devices.iter() {
        writeln!(
            out,
            "  {}.{} {:04x}:{:04x} \"{}\" type={:#x} assigned_vm={}",
            device.bus,
            device.device,
            device.vendor_id,
            device.product_id,
            device.short_name,
            device.device_type.0,
            device
                .assigned_vm
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
        )
        .ok();
    }

    writeln!(out, "rules:").ok();
    for rule in policy.rules() {
        writeln!(
            out,
            "  pos={} command={} vendor={:?} product={:?} serial={:?} vm={:?} \"{}\"",
            rule.pos,
            rule.command.as_str(),
            rule.vendor_id,
            rule.product_id,
            rule.serial,
            rule.vm_uuid,
            rule.description,
        )
        .ok();
    }

    out
}

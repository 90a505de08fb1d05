//! The rule entity and device/VM matching, §3.1/§4.4.2.

use usbmuxd_protocol::{DeviceTypeMask, RuleCommand, RuleRecord};

use crate::device::Device;
use crate::vm::Vm;

/// A policy record. An entirely empty matcher set matches any device and
/// any VM.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pos: u16,
    pub command: RuleCommand,
    pub description: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial: Option<String>,
    pub required_type: DeviceTypeMask,
    pub forbidden_type: DeviceTypeMask,
    pub sysattrs: Vec<(String, String)>,
    pub properties: Vec<(String, String)>,
    pub vm_uuid: Option<String>,
}

impl Rule {
    /// A rule matches a device when every non-empty criterion matches.
    pub fn matches_device(&self, device: &Device) -> bool {
        if let Some(vendor) = self.vendor_id {
            if vendor != 0 && device.vendor_id != vendor {
                return false;
            }
        }
        if let Some(product) = self.product_id {
            if product != 0 && device.product_id != product {
                return false;
            }
        }
        if let Some(serial) = &self.serial {
            match &device.serial {
                Some(dev_serial) if dev_serial == serial => {}
                _ => return false,
            }
        }
        if !self.required_type.is_empty() && !device.device_type.contains(self.required_type) {
            return false;
        }
        if !self.forbidden_type.is_empty() && device.device_type.intersects(self.forbidden_type) {
            return false;
        }
        for (key, value) in &self.sysattrs {
            let found = device
                .node
                .iter_self_and_descendants()
                .any(|n| n.sysattr(key) == Some(value.as_str()));
            if !found {
                return false;
            }
        }
        for (key, value) in &self.properties {
            let found = device
                .node
                .iter_self_and_descendants()
                .any(|n| n.property(key) == Some(value.as_str()));
            if !found {
                return false;
            }
        }
        true
    }

    /// A rule matches a VM when `vm_uuid` is absent or equal to the VM's
    /// uuid.
    pub fn matches_vm(&self, vm: &Vm) -> bool {
        match &self.vm_uuid {
            None => true,
            Some(uuid) => uuid == &vm.uuid,
        }
    }

    pub fn matches(&self, device: &Device, vm: &Vm) -> bool {
        self.matches_device(device) && self.matches_vm(vm)
    }

    pub fn to_record(&self) -> RuleRecord {
        RuleRecord {
            pos: self.pos,
            command: self.command,
            description: self.description.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial: self.serial.clone(),
            required_type: self.required_type,
            forbidden_type: self.forbidden_type,
            sysattrs: self.sysattrs.clone(),
            properties: self.properties.clone(),
            vm_uuid: self.vm_uuid.clone(),
        }
    }

    pub fn from_record(record: RuleRecord) -> Rule {
        Rule {
            pos: record.pos,
            command: record.command,
            description: record.description,
            vendor_id: record.vendor_id,
            product_id: record.product_id,
            serial: record.serial,
            required_type: record.required_type,
            forbidden_type: record.forbidden_type,
            sysattrs: record.sysattrs,
            properties: record.properties,
            vm_uuid: record.vm_uuid,
        }
    }
}

//! The device entity and the in-memory device registry, §3.1/§4.2.
//!
//! Devices are held in a stable ordered list (insertion order), per the
//! Design Notes' guidance to model the source's intrusive list as "a stable
//! ordered list for devices" rather than a hash table that reorders on
//! removal.

use usbmuxd_common::RawDeviceNode;
use usbmuxd_protocol::DeviceTypeMask;

/// A physical USB device currently present on this host.
#[derive(Debug, Clone)]
pub struct Device {
    pub bus: u8,
    pub device: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// Product-facing name, e.g. "Logitech USB Receiver".
    pub short_name: String,
    /// Manufacturer name.
    pub long_name: String,
    pub sysname: String,
    pub device_type: DeviceTypeMask,
    /// The enumerator's raw record, retained for advanced rule matching
    /// (sysattr/property lookups) after classification.
    pub node: RawDeviceNode,
    /// Domid of the VM this device is bound to, absent means "attached to
    /// the control domain".
    pub assigned_vm: Option<i32>,
}

impl Device {
    fn key(&self) -> (u8, u8) {
        (self.bus, self.device)
    }

    /// True iff `self` lacks a usable serial (null, empty, or missing).
    fn has_no_usable_serial(&self) -> bool {
        match &self.serial {
            None => true,
            Some(s) => s.is_empty(),
        }
    }
}

/// The authoritative in-memory index of connected devices, §4.2.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_by_bus_dev(&self, bus: u8, dev: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.key() == (bus, dev))
    }

    pub fn lookup_by_bus_dev_mut(&mut self, bus: u8, dev: u8) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.key() == (bus, dev))
    }

    /// If the caller's serial is absent, or either side's serial is absent,
    /// serial is ignored for the match.
    pub fn lookup_by_attributes(
        &self,
        vendor: u16,
        product: u16,
        serial: Option<&str>,
    ) -> Option<&Device> {
        self.devices.iter().find(|d| {
            if d.vendor_id != vendor || d.product_id != product {
                return false;
            }
            match (serial, d.serial.as_deref()) {
                (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => a == b,
                _ => true,
            }
        })
    }

    /// True iff another record shares `(vendor, product)` and either record
    /// lacks a usable serial.
    pub fn is_ambiguous(&self, bus: u8, dev: u8) -> bool {
        let Some(target) = self.lookup_by_bus_dev(bus, dev) else {
            return false;
        };
        self.devices.iter().any(|other| {
            other.key() != target.key()
                && other.vendor_id == target.vendor_id
                && other.product_id == target.product_id
                && (target.has_no_usable_serial() || other.has_no_usable_serial())
        })
    }

    /// Rejects duplicates on `(bus, dev)`.
    pub fn add(&mut self, device: Device) -> crate::error::Result<()> {
        if self.lookup_by_bus_dev(device.bus, device.device).is_some() {
            return Err(crate::error::DaemonError::Validation(format!(
                "device {}.{} already registered",
                device.bus, device.device
            )));
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn remove(&mut self, bus: u8, dev: u8) -> crate::error::Result<Device> {
        let idx = self
            .devices
            .iter()
            .position(|d| d.key() == (bus, dev))
            .ok_or_else(|| {
                crate::error::DaemonError::NotFound(format!("device {}.{}", bus, dev))
            })?;
        Ok(self.devices.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.iter_mut()
    }

    /// Detaches every device bound to `domid` through the caller-supplied
    /// detach closure, clearing the VM back-reference. Aggregates
    /// per-device failures into a bitwise-or return code; a clean run
    /// returns 0.
    pub fn unplug_all_from_vm<F>(&mut self, domid: i32, mut detach: F) -> u32
    where
        F: FnMut(&Device) -> u32,
    {
        let mut aggregate = 0u32;
        for device in self.devices.iter_mut() {
            if device.assigned_vm == Some(domid) {
                aggregate |= detach(device);
                device.assigned_vm = None;
            }
        }
        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(bus: u8, dev: u8, vendor: u16, product: u16, serial: Option<&str>) -> Device {
        Device {
            bus,
            device: dev,
            vendor_id: vendor,
            product_id: product,
            serial: serial.map(String::from),
            short_name: "Test device".into(),
            long_name: "Test vendor".into(),
            sysname: format!("{}-{}", bus, dev),
            device_type: DeviceTypeMask::NONE,
            node: RawDeviceNode::default(),
            assigned_vm: None,
        }
    }

    #[test]
    fn add_rejects_duplicate_bus_dev() {
        let mut reg = DeviceRegistry::new();
        reg.add(device(1, 1, 0x046d, 0xc534, None)).unwrap();
        assert!(reg.add(device(1, 1, 0x1234, 0x5678, None)).is_err());
    }

    #[test]
    fn remove_returns_not_found_when_absent() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.remove(9, 9).is_err());
    }

    #[test]
    fn lookup_by_attributes_ignores_absent_serial() {
        let mut reg = DeviceRegistry::new();
        reg.add(device(1, 1, 0x046d, 0xc534, None)).unwrap();
        assert!(
            reg.lookup_by_attributes(0x046d, 0xc534, Some("S1"))
                .is_some()
        );
    }

    #[test]
    fn is_ambiguous_true_when_serials_missing_on_either_side() {
        let mut reg = DeviceRegistry::new();
        reg.add(device(1, 1, 0x046d, 0xc534, Some("S1"))).unwrap();
        reg.add(device(1, 2, 0x046d, 0xc534, None)).unwrap();
        assert!(reg.is_ambiguous(1, 1));
        assert!(reg.is_ambiguous(1, 2));
    }

    #[test]
    fn is_ambiguous_false_when_both_serials_present_and_distinct() {
        let mut reg = DeviceRegistry::new();
        reg.add(device(1, 1, 0x046d, 0xc534, Some("S1"))).unwrap();
        reg.add(device(1, 2, 0x046d, 0xc534, Some("S2"))).unwrap();
        assert!(!reg.is_ambiguous(1, 1));
        assert!(!reg.is_ambiguous(1, 2));
    }

    #[test]
    fn is_ambiguous_is_symmetric_under_device_pairs() {
        let mut reg = DeviceRegistry::new();
        reg.add(device(1, 1, 0x046d, 0xc534, None)).unwrap();
        reg.add(device(1, 2, 0x046d, 0xc534, None)).unwrap();
        assert_eq!(reg.is_ambiguous(1, 1), reg.is_ambiguous(1, 2));
    }

    #[test]
    fn unplug_all_from_vm_clears_back_reference_and_aggregates() {
        let mut reg = DeviceRegistry::new();
        let mut a = device(1, 1, 0x046d, 0xc534, None);
        a.assigned_vm = Some(7);
        let mut b = device(1, 2, 0x1234, 0x5678, None);
        b.assigned_vm = Some(7);
        reg.add(a).unwrap();
        reg.add(b).unwrap();

        let aggregate = reg.unplug_all_from_vm(7, |_| 0);
        assert_eq!(aggregate, 0);
        assert!(reg.iter().all(|d| d.assigned_vm.is_none()));
    }
}

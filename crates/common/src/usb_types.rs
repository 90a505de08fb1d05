//! The raw shapes produced by the [`DeviceEnumerator`](crate::channel) contract
//! and consumed by the classifier.
//!
//! These mirror what a udev-backed enumerator would expose (sysattrs,
//! properties, a devtype, and a child-device walk) so the classifier logic in
//! the `usbmuxd` crate stays independent of which concrete enumerator
//! backend produced the data.

use std::collections::BTreeMap;

/// A single raw node from the device enumerator: either the `usb_device`
/// itself or one of its descendants (an interface, a `scsi_host`, a block
/// device) encountered during the children walk of classifier step 6.
#[derive(Debug, Clone, Default)]
pub struct RawDeviceNode {
    pub devtype: String,
    pub sysname: String,
    pub sysattrs: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub children: Vec<RawDeviceNode>,
}

impl RawDeviceNode {
    pub fn sysattr(&self, key: &str) -> Option<&str> {
        self.sysattrs.get(key).map(String::as_str)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Depth-first iterator over this node and every descendant, used by the
    /// classifier's children walk and by rule sysattr/property matching,
    /// which must check "some ancestor or descendant" of the device.
    pub fn iter_self_and_descendants(&self) -> Box<dyn Iterator<Item = &RawDeviceNode> + '_> {
        let children_iter = self
            .children
            .iter()
            .flat_map(|c| c.iter_self_and_descendants());
        Box::new(std::iter::once(self).chain(children_iter))
    }
}

/// A hotplug event as produced by the enumerator, pre-classification.
#[derive(Debug, Clone)]
pub enum RawHotplugEvent {
    Added(RawDeviceNode),
    Removed { bus: u8, address: u8 },
}

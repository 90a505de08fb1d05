//! The hotplug classifier, §4.3.
//!
//! Turns a raw enumerator node (`subsystem=usb, devtype=usb_device`) into a
//! fully populated [`Device`]. Operates purely over [`RawDeviceNode`] so it
//! stays independent of whichever concrete enumerator backend produced the
//! tree, and so it can be driven from hand-built fixtures in tests without a
//! real udev socket or USB bus.

use std::time::Duration;

use usbmuxd_common::RawDeviceNode;
use usbmuxd_protocol::DeviceTypeMask;

use crate::device::Device;
use crate::usb_probe::{self, DescriptorProber};

const HUB_CLASS: u8 = 0x09;
const MASS_STORAGE_CLASS: u8 = 0x08;

const REQUIRED_SYSATTRS: &[&str] = &[
    "busnum",
    "devnum",
    "idVendor",
    "idProduct",
    "bDeviceClass",
    "bDeviceSubClass",
    "bDeviceProtocol",
];

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SETTLE_MAX_ITERATIONS: u32 = 10;
const SETTLE_FALLBACK_SLEEP: Duration = Duration::from_millis(100);
const OPTICAL_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The enumerator's hotplug queue, consulted only for the settle step.
/// `None` from `queue_is_empty` means the facility is unavailable, in which
/// case settle falls back to a single fixed sleep.
pub trait EnumeratorQueue {
    fn queue_is_empty(&self) -> Option<bool>;
}

/// The block/disk watch collaborator used by the optical probe, §4.3 step 7.
pub trait OpticalWatcher {
    /// Waits up to `timeout` for a `subsystem=block, devtype=disk` add
    /// event, settles, then returns the device's current (possibly
    /// refreshed) child tree regardless of whether the wait succeeded.
    async fn wait_and_rescan(&self, sysname: &str, timeout: Duration) -> Vec<RawDeviceNode>;
}

/// Step 1: wait until the enumerator queue is empty, polling every 50ms up
/// to 10 iterations; if the facility is unavailable, sleep 100ms once.
pub async fn settle<Q: EnumeratorQueue>(queue: &Q) {
    match queue.queue_is_empty() {
        None => {
            tokio::time::sleep(SETTLE_FALLBACK_SLEEP).await;
        }
        Some(mut empty) => {
            let mut iterations = 0;
            while !empty && iterations < SETTLE_MAX_ITERATIONS {
                tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
                empty = queue.queue_is_empty().unwrap_or(true);
                iterations += 1;
            }
        }
    }
}

/// Step 2: reject configurations/interfaces and devices missing required
/// attributes or belonging to the hub class.
fn is_eligible(node: &RawDeviceNode) -> bool {
    if node.sysname.contains(':') || node.sysname.is_empty() {
        return false;
    }
    if REQUIRED_SYSATTRS
        .iter()
        .any(|key| node.sysattr(key).is_none())
    {
        return false;
    }
    if parse_hex_attr(node, "bDeviceClass") == Some(HUB_CLASS) {
        return false;
    }
    true
}

fn parse_hex_attr(node: &RawDeviceNode, key: &str) -> Option<u8> {
    let raw = node.sysattr(key)?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u8::from_str_radix(digits, 16).ok()
}

fn parse_dec_attr(node: &RawDeviceNode, key: &str) -> Option<u8> {
    node.sysattr(key)?.parse().ok()
}

/// True iff `s` is a pure hex (optionally `0x`-prefixed) or decimal string
/// of at most 4 characters — the placeholder-looking product names the
/// naming step falls back away from, per §4.3 step 3.
fn is_short_numeric_placeholder(s: &str) -> bool {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    digits.len() <= 4
        && !digits.is_empty()
        && (digits.chars().all(|c| c.is_ascii_hexdigit())
            || digits.chars().all(|c| c.is_ascii_digit()))
}

/// Step 4: the embedded USB class table. Covers the commonly seen classes
/// and the subclass/protocol pairs needed to resolve the vendor-fallback
/// name and the diagnostics dump; not the full USB-IF database.
fn class_name(class: u8) -> Option<&'static str> {
    match class {
        0x01 => Some("Audio"),
        0x02 => Some("Communications"),
        0x03 => Some("Human Interface Device"),
        0x06 => Some("Imaging"),
        0x07 => Some("Printer"),
        0x08 => Some("Mass Storage"),
        0x09 => Some("Hub"),
        0x0a => Some("CDC Data"),
        0x0e => Some("Video"),
        0xe0 => Some("Wireless Controller"),
        0xef => Some("Miscellaneous"),
        0xfe => Some("Application Specific"),
        0xff => Some("Vendor Specific"),
        _ => None,
    }
}

fn subclass_name(class: u8, subclass: u8) -> Option<&'static str> {
    match (class, subclass) {
        (0x08, 0x06) => Some("SCSI"),
        (0x03, 0x01) => Some("Boot Interface"),
        _ => None,
    }
}

fn protocol_name(class: u8, subclass: u8, protocol: u8) -> Option<&'static str> {
    match (class, subclass, protocol) {
        (0x03, 0x01, 0x01) => Some("Keyboard"),
        (0x03, 0x01, 0x02) => Some("Mouse"),
        _ => None,
    }
}

/// Step 4: returns the most specific known level, rendered `"<class> -
/// <leaf>"` at the two deeper levels, `"<class>"` at the top.
fn type_string(class: u8, subclass: u8, protocol: u8) -> Option<String> {
    let class_name = class_name(class)?;
    if let Some(leaf) = protocol_name(class, subclass, protocol) {
        return Some(format!("{class_name} - {leaf}"));
    }
    if let Some(leaf) = subclass_name(class, subclass) {
        return Some(format!("{class_name} - {leaf}"));
    }
    Some(class_name.to_string())
}

struct Names {
    long_name: String,
    short_name: String,
}

/// Step 3.
fn derive_names(node: &RawDeviceNode, class: u8, subclass: u8, protocol: u8) -> Names {
    let manufacturer = node
        .sysattr("manufacturer")
        .or_else(|| node.property("ID_VENDOR_FROM_DATABASE"))
        .unwrap_or("Unknown")
        .to_string();

    let product = node
        .sysattr("product")
        .or_else(|| node.property("ID_MODEL_FROM_DATABASE"));

    let short_name = match product {
        Some(p) if !is_short_numeric_placeholder(p) => p.to_string(),
        _ => {
            let vendor_hex = node.sysattr("idVendor").unwrap_or("0000");
            let product_hex = node.sysattr("idProduct").unwrap_or("0000");
            match type_string(class, subclass, protocol) {
                Some(type_str) => format!("{manufacturer} device ({type_str})"),
                None => format!("{manufacturer} device ({vendor_hex}:{product_hex})"),
            }
        }
    };

    Names {
        long_name: manufacturer,
        short_name,
    }
}

/// Step 6: walks child devices, deriving keyboard/mouse/game-controller/
/// mass-storage bits. Optical and NIC/Bluetooth bits are set separately by
/// the optical probe and the descriptor prober.
fn children_walk(node: &RawDeviceNode) -> DeviceTypeMask {
    let mut mask = DeviceTypeMask::NONE;
    for child in &node.children {
        let input_nonzero = child
            .property("ID_INPUT")
            .map(|v| v != "0")
            .unwrap_or(false);
        if input_nonzero {
            if child.property("ID_INPUT_KEYBOARD").map(|v| v != "0") == Some(true) {
                mask.insert(DeviceTypeMask::KEYBOARD);
            }
            if child.property("ID_INPUT_MOUSE").map(|v| v != "0") == Some(true)
                || child.property("ID_INPUT_TOUCHPAD").map(|v| v != "0") == Some(true)
            {
                mask.insert(DeviceTypeMask::MOUSE);
            }
            if child.property("ID_INPUT_JOYSTICK").map(|v| v != "0") == Some(true) {
                mask.insert(DeviceTypeMask::GAME_CONTROLLER);
            }
        }

        let child_class = parse_hex_attr(child, "bDeviceClass")
            .or_else(|| parse_hex_attr(child, "bInterfaceClass"));
        if child_class == Some(MASS_STORAGE_CLASS) {
            mask.insert(DeviceTypeMask::MASS_STORAGE);
        }
    }
    mask
}

/// Step 7: optical detection, skipped for devices found during startup
/// rescanning. On timeout the `optical` bit is simply left unset — a
/// preserved behavioral quirk (see DESIGN.md, Open Question 1).
async fn optical_probe<W: OpticalWatcher>(
    node: &RawDeviceNode,
    watcher: &W,
    is_new_device: bool,
) -> bool {
    if !is_new_device {
        return false;
    }
    let has_scsi_host = node.children.iter().any(|c| c.devtype == "scsi_host");
    if !has_scsi_host {
        return false;
    }
    let refreshed = watcher
        .wait_and_rescan(&node.sysname, OPTICAL_PROBE_TIMEOUT)
        .await;
    refreshed
        .iter()
        .flat_map(|n| n.iter_self_and_descendants())
        .any(|n| n.sysattr("ID_CDROM").is_some())
}

/// Runs the full classifier procedure. Returns `None` when the device is
/// ineligible (step 2).
pub async fn classify<Q, W>(
    node: RawDeviceNode,
    queue: &Q,
    optical_watcher: &W,
    prober: &dyn DescriptorProber,
    is_new_device: bool,
) -> Option<Device>
where
    Q: EnumeratorQueue,
    W: OpticalWatcher,
{
    settle(queue).await;

    if !is_eligible(&node) {
        return None;
    }

    let bus = parse_dec_attr(&node, "busnum")?;
    let device_on_bus = parse_dec_attr(&node, "devnum")?;
    let vendor_id = parse_hex16_attr(&node, "idVendor").unwrap_or(0);
    let product_id = parse_hex16_attr(&node, "idProduct").unwrap_or(0);
    let class = parse_hex_attr(&node, "bDeviceClass")?;
    let subclass = parse_hex_attr(&node, "bDeviceSubClass")?;
    let protocol = parse_hex_attr(&node, "bDeviceProtocol")?;

    let names = derive_names(&node, class, subclass, protocol);
    let serial = node.sysattr("serial").map(String::from);

    let mut device_type = children_walk(&node);

    if optical_probe(&node, optical_watcher, is_new_device).await {
        device_type.insert(DeviceTypeMask::OPTICAL);
    }

    if let Ok(probe) = usb_probe::probe_nic_and_bluetooth(prober, bus, device_on_bus) {
        if probe.is_nic {
            device_type.insert(DeviceTypeMask::NIC);
        }
        if probe.is_bluetooth {
            device_type.insert(DeviceTypeMask::BLUETOOTH);
        }
    }

    let sysname = node.sysname.clone();
    Some(Device {
        bus,
        device: device_on_bus,
        vendor_id,
        product_id,
        serial,
        short_name: names.short_name,
        long_name: names.long_name,
        sysname,
        device_type,
        node,
        assigned_vm: None,
    })
}

fn parse_hex16_attr(node: &RawDeviceNode, key: &str) -> Option<u16> {
    let raw = node.sysattr(key)?;
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u16::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct AlwaysEmptyQueue;
    impl EnumeratorQueue for AlwaysEmptyQueue {
        fn queue_is_empty(&self) -> Option<bool> {
            Some(true)
        }
    }

    struct NoOpticalWatcher;
    impl OpticalWatcher for NoOpticalWatcher {
        async fn wait_and_rescan(&self, _sysname: &str, _timeout: Duration) -> Vec<RawDeviceNode> {
            Vec::new()
        }
    }

    struct NoInterfaces;
    impl DescriptorProber for NoInterfaces {
        fn interface_classes(
            &self,
            _bus: u8,
            _device: u8,
        ) -> crate::error::Result<Vec<usb_probe::InterfaceClass>> {
            Ok(Vec::new())
        }
    }

    fn base_node() -> RawDeviceNode {
        let mut sysattrs = BTreeMap::new();
        sysattrs.insert("busnum".into(), "1".into());
        sysattrs.insert("devnum".into(), "3".into());
        sysattrs.insert("idVendor".into(), "046d".into());
        sysattrs.insert("idProduct".into(), "c534".into());
        sysattrs.insert("bDeviceClass".into(), "00".into());
        sysattrs.insert("bDeviceSubClass".into(), "00".into());
        sysattrs.insert("bDeviceProtocol".into(), "00".into());
        sysattrs.insert("manufacturer".into(), "Logitech".into());
        sysattrs.insert("product".into(), "USB Receiver".into());
        RawDeviceNode {
            devtype: "usb_device".into(),
            sysname: "1-3".into(),
            sysattrs,
            properties: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    #[tokio::test]
    async fn classifies_a_basic_eligible_device() {
        let node = base_node();
        let device = classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
            .await
            .unwrap();
        assert_eq!(device.bus, 1);
        assert_eq!(device.device, 3);
        assert_eq!(device.vendor_id, 0x046d);
        assert_eq!(device.product_id, 0xc534);
        assert_eq!(device.short_name, "USB Receiver");
        assert_eq!(device.long_name, "Logitech");
    }

    #[tokio::test]
    async fn rejects_interface_sysnames() {
        let mut node = base_node();
        node.sysname = "1-3:1.0".into();
        assert!(
            classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn rejects_hub_class() {
        let mut node = base_node();
        node.sysattrs.insert("bDeviceClass".into(), "09".into());
        assert!(
            classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn rejects_device_missing_required_attribute() {
        let mut node = base_node();
        node.sysattrs.remove("idProduct");
        assert!(
            classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn falls_back_to_vendor_device_name_for_numeric_product() {
        let mut node = base_node();
        node.sysattrs.insert("product".into(), "0x1".into());
        let device = classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
            .await
            .unwrap();
        assert!(device.short_name.starts_with("Logitech device"));
    }

    #[tokio::test]
    async fn children_walk_sets_keyboard_and_mouse_bits() {
        let mut node = base_node();
        let mut kb = RawDeviceNode::default();
        kb.properties.insert("ID_INPUT".into(), "1".into());
        kb.properties.insert("ID_INPUT_KEYBOARD".into(), "1".into());
        let mut mouse = RawDeviceNode::default();
        mouse.properties.insert("ID_INPUT".into(), "1".into());
        mouse.properties.insert("ID_INPUT_MOUSE".into(), "1".into());
        node.children.push(kb);
        node.children.push(mouse);

        let device = classify(node, &AlwaysEmptyQueue, &NoOpticalWatcher, &NoInterfaces, true)
            .await
            .unwrap();
        assert!(device.device_type.contains(DeviceTypeMask::KEYBOARD));
        assert!(device.device_type.contains(DeviceTypeMask::MOUSE));
    }

    #[tokio::test]
    async fn optical_probe_skipped_for_existing_devices() {
        struct PanicsIfCalled;
        impl OpticalWatcher for PanicsIfCalled {
            async fn wait_and_rescan(
                &self,
                _sysname: &str,
                _timeout: Duration,
            ) -> Vec<RawDeviceNode> {
                panic!("optical probe must be skipped for rescanned devices");
            }
        }
        let mut node = base_node();
        node.children.push(RawDeviceNode {
            devtype: "scsi_host".into(),
            ..Default::default()
        });
        let device = classify(node, &AlwaysEmptyQueue, &PanicsIfCalled, &NoInterfaces, false)
            .await
            .unwrap();
        assert!(!device.device_type.contains(DeviceTypeMask::OPTICAL));
    }

    #[tokio::test]
    async fn optical_probe_sets_bit_when_cdrom_found() {
        struct FindsCdrom;
        impl OpticalWatcher for FindsCdrom {
            async fn wait_and_rescan(
                &self,
                _sysname: &str,
                _timeout: Duration,
            ) -> Vec<RawDeviceNode> {
                let mut disk = RawDeviceNode::default();
                disk.sysattrs.insert("ID_CDROM".into(), "1".into());
                vec![disk]
            }
        }
        let mut node = base_node();
        node.children.push(RawDeviceNode {
            devtype: "scsi_host".into(),
            ..Default::default()
        });
        let device = classify(node, &AlwaysEmptyQueue, &FindsCdrom, &NoInterfaces, true)
            .await
            .unwrap();
        assert!(device.device_type.contains(DeviceTypeMask::OPTICAL));
    }
}

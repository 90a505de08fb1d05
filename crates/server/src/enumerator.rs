//! The device enumerator contract and its `rusb`-backed implementation,
//! §1/§2 ("Device enumerator").
//!
//! The hotplug facility is consumed read-only: it hands the dispatcher
//! [`RawHotplugEvent`]s and, on request, the current child-device tree for a
//! still-present device (used by the classifier's optical probe rescan).
//! `rusb`'s hotplug support blocks the calling thread inside
//! `handle_events`, so the concrete implementation runs it on a dedicated OS
//! thread and bridges events across [`usbmuxd_common::EnumeratorBridge`],
//! mirroring the hybrid sync/async worker-thread split the starting
//! repository uses for its own USB event loop.

use std::time::Duration;

use rusb::{Context, Hotplug, HotplugBuilder, UsbContext};
use tracing::{debug, info, warn};

use usbmuxd_common::usb_types::{RawDeviceNode, RawHotplugEvent};
use usbmuxd_common::{EnumeratorCommand, EnumeratorWorkerChannel, create_enumerator_bridge};

use crate::classifier::{self, EnumeratorQueue};

/// A udev-style `subsystem=usb, devtype=usb_device` HID interface class,
/// used to approximate the children a real udev tree would expose for
/// input/mass-storage classification without an actual child-device walk.
const HID_CLASS: u8 = 0x03;
const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
const HID_PROTOCOL_MOUSE: u8 = 0x02;
const MASS_STORAGE_CLASS: u8 = 0x08;

/// Builds the best-effort [`RawDeviceNode`] a `rusb` backend can produce for
/// a device at `(bus, address)`: the top-level node carries the
/// classifier's required sysattrs, and one child node per USB interface
/// approximates the udev child-device walk of §4.3 step 6 — real udev
/// exposes separate input/block child devices; `rusb` only exposes interface
/// descriptors, so interface class/protocol stands in for them.
pub fn build_raw_node<T: UsbContext>(device: &rusb::Device<T>) -> Option<RawDeviceNode> {
    let desc = device.device_descriptor().ok()?;
    let bus = device.bus_number();
    let address = device.address();

    let mut sysattrs = std::collections::BTreeMap::new();
    sysattrs.insert("busnum".to_string(), bus.to_string());
    sysattrs.insert("devnum".to_string(), address.to_string());
    sysattrs.insert("idVendor".to_string(), format!("{:04x}", desc.vendor_id()));
    sysattrs.insert(
        "idProduct".to_string(),
        format!("{:04x}", desc.product_id()),
    );
    sysattrs.insert(
        "bDeviceClass".to_string(),
        format!("{:02x}", desc.class_code()),
    );
    sysattrs.insert(
        "bDeviceSubClass".to_string(),
        format!("{:02x}", desc.sub_class_code()),
    );
    sysattrs.insert(
        "bDeviceProtocol".to_string(),
        format!("{:02x}", desc.protocol_code()),
    );

    if let Ok(handle) = device.open() {
        if let Some(idx) = desc.manufacturer_string_index() {
            if let Ok(s) = handle.read_string_descriptor_ascii(idx) {
                sysattrs.insert("manufacturer".to_string(), s);
            }
        }
        if let Some(idx) = desc.product_string_index() {
            if let Ok(s) = handle.read_string_descriptor_ascii(idx) {
                sysattrs.insert("product".to_string(), s);
            }
        }
        if let Some(idx) = desc.serial_number_string_index() {
            if let Ok(s) = handle.read_string_descriptor_ascii(idx) {
                sysattrs.insert("serial".to_string(), s);
            }
        }
    }

    let mut children = Vec::new();
    for cfg_idx in 0..desc.num_configurations() {
        let Ok(config) = device.config_descriptor(cfg_idx) else {
            continue;
        };
        for iface in config.interfaces() {
            for iface_desc in iface.descriptors() {
                let class = iface_desc.class_code();
                let subclass = iface_desc.sub_class_code();
                let protocol = iface_desc.protocol_code();

                let mut child_sysattrs = std::collections::BTreeMap::new();
                child_sysattrs.insert("bInterfaceClass".to_string(), format!("{class:02x}"));
                child_sysattrs
                    .insert("bInterfaceSubClass".to_string(), format!("{subclass:02x}"));
                child_sysattrs
                    .insert("bInterfaceProtocol".to_string(), format!("{protocol:02x}"));

                let mut properties = std::collections::BTreeMap::new();
                if class == HID_CLASS && protocol == HID_PROTOCOL_KEYBOARD {
                    properties.insert("ID_INPUT".to_string(), "1".to_string());
                    properties.insert("ID_INPUT_KEYBOARD".to_string(), "1".to_string());
                } else if class == HID_CLASS && protocol == HID_PROTOCOL_MOUSE {
                    properties.insert("ID_INPUT".to_string(), "1".to_string());
                    properties.insert("ID_INPUT_MOUSE".to_string(), "1".to_string());
                }

                let devtype = if class == MASS_STORAGE_CLASS {
                    "scsi_host".to_string()
                } else {
                    "usb_interface".to_string()
                };

                children.push(RawDeviceNode {
                    devtype,
                    sysname: format!("{bus}-{address}:{}.{}", iface.number(), iface_desc.setting_number()),
                    sysattrs: child_sysattrs,
                    properties,
                    children: Vec::new(),
                });
            }
        }
    }

    Some(RawDeviceNode {
        devtype: "usb_device".to_string(),
        sysname: format!("{bus}-{address}"),
        sysattrs,
        properties: std::collections::BTreeMap::new(),
        children,
    })
}

/// A `usb.filters` entry from `DaemonConfig`: `None` in either slot is a
/// wildcard. An empty filter list means every device is considered.
pub type DeviceFilter = (Option<u16>, Option<u16>);

fn passes_filters(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
    filters.is_empty()
        || filters.iter().any(|(vid, pid)| {
            vid.map(|v| v == vendor_id).unwrap_or(true) && pid.map(|p| p == product_id).unwrap_or(true)
        })
}

/// `rusb`'s hotplug callback: translates libusb arrival/departure calls into
/// [`RawHotplugEvent`]s pushed across the worker-side channel half. Cannot
/// build the full [`RawDeviceNode`] for a departed device (it may already be
/// gone by the time the dispatcher drains the channel), so departures only
/// ever carry the `(bus, address)` key — exactly what
/// `DeviceRegistry::remove` needs. An arrival outside `filters` is dropped
/// before it ever reaches the channel, per `DaemonConfig`'s `usb.filters`.
struct HotplugCallback {
    channel: std::sync::Arc<EnumeratorWorkerChannel>,
    filters: std::sync::Arc<Vec<DeviceFilter>>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: rusb::Device<T>) {
        let bus = device.bus_number();
        let address = device.address();
        match build_raw_node(&device) {
            Some(node) => {
                let vendor_id = node
                    .sysattr("idVendor")
                    .and_then(|s| u16::from_str_radix(s, 16).ok())
                    .unwrap_or(0);
                let product_id = node
                    .sysattr("idProduct")
                    .and_then(|s| u16::from_str_radix(s, 16).ok())
                    .unwrap_or(0);
                if !passes_filters(&self.filters, vendor_id, product_id) {
                    debug!(bus, address, vendor_id, product_id, "device excluded by usb.filters");
                    return;
                }
                if let Err(e) = self.channel.send_event(RawHotplugEvent::Added(node)) {
                    warn!("failed to forward hotplug arrival: {e}");
                }
            }
            None => warn!(bus, address, "could not read descriptors for arrived device"),
        }
    }

    fn device_left(&mut self, device: rusb::Device<T>) {
        let bus = device.bus_number();
        let address = device.address();
        if let Err(e) = self
            .channel
            .send_event(RawHotplugEvent::Removed { bus, address })
        {
            warn!("failed to forward hotplug departure: {e}");
        }
    }
}

/// Queue-empty facility backing the classifier's settle step, §4.3 step 1.
/// `rusb` exposes no "is my hotplug queue empty" primitive, so this always
/// reports the facility unavailable and the classifier falls back to its
/// single fixed sleep — a documented, deliberate simplification of the
/// udev-backed original.
pub struct NoQueueFacility;

impl EnumeratorQueue for NoQueueFacility {
    fn queue_is_empty(&self) -> Option<bool> {
        None
    }
}

/// The real [`OpticalWatcher`] backend: `rusb` has no way to watch the
/// kernel block-device subsystem, so there is no production source of the
/// `subsystem=block, devtype=disk` add event step 7 of the optical probe
/// waits for. This always "times out" immediately, which per DESIGN.md
/// Open Question 1 just leaves the `optical` bit unset rather than erroring.
pub struct NoOpticalWatcher;

impl classifier::OpticalWatcher for NoOpticalWatcher {
    async fn wait_and_rescan(&self, _sysname: &str, _timeout: Duration) -> Vec<RawDeviceNode> {
        Vec::new()
    }
}

/// Runs the blocking `rusb` event loop on the calling thread until a
/// [`EnumeratorCommand::Shutdown`] is received. Intended to be spawned onto
/// its own OS thread by [`spawn_enumerator_worker`].
fn run_worker(
    context: Context,
    channel: EnumeratorWorkerChannel,
    filters: Vec<DeviceFilter>,
) -> rusb::Result<()> {
    let channel = std::sync::Arc::new(channel);
    let callback = HotplugCallback {
        channel: channel.clone(),
        filters: std::sync::Arc::new(filters),
    };

    let _registration = if rusb::has_hotplug() {
        Some(
            HotplugBuilder::new()
                .enumerate(true)
                .register(&context, Box::new(callback))?,
        )
    } else {
        warn!("libusb hotplug support unavailable on this platform");
        None
    };

    info!("enumerator worker thread started");
    loop {
        if matches!(channel.try_recv_command(), Some(EnumeratorCommand::Shutdown)) {
            break;
        }
        match context.handle_events(Some(Duration::from_millis(100))) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("hotplug event handling interrupted"),
            Err(e) => {
                warn!("error handling hotplug events: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("enumerator worker thread stopped");
    Ok(())
}

/// Spawns the dedicated hotplug thread and returns the async-facing bridge
/// half plus the thread's join handle. `filters` is `DaemonConfig`'s
/// `usb.filters`, already parsed into `(vendor, product)` wildcards.
pub fn spawn_enumerator_worker(
    filters: Vec<DeviceFilter>,
) -> rusb::Result<(usbmuxd_common::EnumeratorBridge, std::thread::JoinHandle<rusb::Result<()>>)> {
    let context = Context::new()?;
    let (bridge, worker_channel) = create_enumerator_bridge();

    let handle = std::thread::Builder::new()
        .name("enumerator-worker".to_string())
        .spawn(move || run_worker(context, worker_channel, filters))
        .expect("failed to spawn enumerator worker thread");

    Ok((bridge, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_queue_facility_reports_unavailable() {
        assert_eq!(NoQueueFacility.queue_is_empty(), None);
    }

    #[test]
    fn empty_filter_list_passes_everything() {
        assert!(passes_filters(&[], 0x046d, 0xc534));
    }

    #[test]
    fn exact_vendor_and_product_filter_matches_only_that_pair() {
        let filters = vec![(Some(0x046d), Some(0xc534))];
        assert!(passes_filters(&filters, 0x046d, 0xc534));
        assert!(!passes_filters(&filters, 0x046d, 0x0001));
        assert!(!passes_filters(&filters, 0x1234, 0xc534));
    }

    #[test]
    fn vendor_wildcard_filter_matches_any_product() {
        let filters = vec![(Some(0x046d), None)];
        assert!(passes_filters(&filters, 0x046d, 0x0001));
        assert!(!passes_filters(&filters, 0x1234, 0x0001));
    }

    #[tokio::test]
    async fn no_optical_watcher_returns_empty_without_blocking() {
        let children = NoOpticalWatcher
            .wait_and_rescan("1-3", Duration::from_secs(5))
            .await;
        assert!(children.is_empty());
    }
}

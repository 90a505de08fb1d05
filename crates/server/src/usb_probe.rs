//! The USB-descriptor prober, §4.3 step 8.
//!
//! Refines NIC/Bluetooth classification by walking a device's
//! config × interface × alt-setting descriptor tree. Modeled as a trait so
//! the classifier never depends on a concrete USB stack directly; the
//! `rusb`-backed implementation is the only one wired up at bootstrap.

/// One alt-setting's interface-class triple, as read off the descriptor tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

const CLASS_COMMUNICATIONS: u8 = 0x02;
const SUBCLASS_ETHERNET_NETWORKING: u8 = 0x06;
const CLASS_WIRELESS: u8 = 0xE0;
const SUBCLASS_RF: u8 = 0x01;
const PROTOCOL_BLUETOOTH: u8 = 0x01;

const MAX_INTERFACE_ITERATIONS: usize = 1000;

impl InterfaceClass {
    fn is_ethernet(&self) -> bool {
        self.class == CLASS_COMMUNICATIONS && self.subclass == SUBCLASS_ETHERNET_NETWORKING
    }

    fn is_bluetooth(&self) -> bool {
        self.class == CLASS_WIRELESS
            && self.subclass == SUBCLASS_RF
            && self.protocol == PROTOCOL_BLUETOOTH
    }

    fn is_wireless_non_bluetooth(&self) -> bool {
        self.class == CLASS_WIRELESS && !self.is_bluetooth()
    }
}

/// Result of walking a device's descriptor tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub is_nic: bool,
    pub is_bluetooth: bool,
}

/// The external descriptor-reading collaborator.
///
/// Returns the flattened list of `(config, interface, altsetting)` interface
/// classes for a device identified by its bus/device-on-bus pair; capped by
/// the caller at [`MAX_INTERFACE_ITERATIONS`] entries, matching the source's
/// hard iteration ceiling.
pub trait DescriptorProber {
    fn interface_classes(&self, bus: u8, device: u8) -> crate::error::Result<Vec<InterfaceClass>>;
}

/// Walks the interface classes yielded by `prober` and derives NIC/Bluetooth
/// marks per §4.3 step 8.
pub fn probe_nic_and_bluetooth(
    prober: &dyn DescriptorProber,
    bus: u8,
    device: u8,
) -> crate::error::Result<ProbeResult> {
    let classes = prober.interface_classes(bus, device)?;
    let mut result = ProbeResult::default();

    for iface in classes.into_iter().take(MAX_INTERFACE_ITERATIONS) {
        if iface.is_ethernet() || iface.is_wireless_non_bluetooth() {
            result.is_nic = true;
        }
        if iface.is_bluetooth() {
            result.is_bluetooth = true;
        }
    }

    Ok(result)
}

/// `rusb`-backed [`DescriptorProber`]: opens the device matching `(bus,
/// device)` among the host's currently attached devices and walks its
/// config/interface/alt-setting descriptors.
pub struct RusbDescriptorProber;

impl DescriptorProber for RusbDescriptorProber {
    fn interface_classes(&self, bus: u8, device: u8) -> crate::error::Result<Vec<InterfaceClass>> {
        let devices = rusb::devices().map_err(|e| {
            crate::error::DaemonError::TransientExternal(format!("libusb enumerate: {e}"))
        })?;

        let mut classes = Vec::new();
        for dev in devices.iter() {
            if dev.bus_number() != bus || dev.address() != device {
                continue;
            }
            let config_count = dev
                .device_descriptor()
                .map_err(|e| {
                    crate::error::DaemonError::TransientExternal(format!(
                        "device descriptor: {e}"
                    ))
                })?
                .num_configurations();

            for cfg_idx in 0..config_count {
                let Ok(config) = dev.config_descriptor(cfg_idx) else {
                    continue;
                };
                for iface in config.interfaces() {
                    for desc in iface.descriptors() {
                        classes.push(InterfaceClass {
                            class: desc.class_code(),
                            subclass: desc.sub_class_code(),
                            protocol: desc.protocol_code(),
                        });
                        if classes.len() >= MAX_INTERFACE_ITERATIONS {
                            return Ok(classes);
                        }
                    }
                }
            }
            break;
        }
        Ok(classes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProber(Vec<InterfaceClass>);

    impl DescriptorProber for FakeProber {
        fn interface_classes(
            &self,
            _bus: u8,
            _device: u8,
        ) -> crate::error::Result<Vec<InterfaceClass>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn marks_nic_for_ethernet_interface() {
        let prober = FakeProber(vec![InterfaceClass {
            class: CLASS_COMMUNICATIONS,
            subclass: SUBCLASS_ETHERNET_NETWORKING,
            protocol: 0,
        }]);
        let result = probe_nic_and_bluetooth(&prober, 1, 1).unwrap();
        assert!(result.is_nic);
        assert!(!result.is_bluetooth);
    }

    #[test]
    fn marks_nic_for_wireless_non_bluetooth() {
        let prober = FakeProber(vec![InterfaceClass {
            class: CLASS_WIRELESS,
            subclass: 0x02,
            protocol: 0x01,
        }]);
        let result = probe_nic_and_bluetooth(&prober, 1, 1).unwrap();
        assert!(result.is_nic);
        assert!(!result.is_bluetooth);
    }

    #[test]
    fn marks_bluetooth_and_not_nic_for_wireless_rf_bluetooth() {
        let prober = FakeProber(vec![InterfaceClass {
            class: CLASS_WIRELESS,
            subclass: SUBCLASS_RF,
            protocol: PROTOCOL_BLUETOOTH,
        }]);
        let result = probe_nic_and_bluetooth(&prober, 1, 1).unwrap();
        assert!(!result.is_nic);
        assert!(result.is_bluetooth);
    }

    #[test]
    fn unrelated_interface_marks_neither() {
        let prober = FakeProber(vec![InterfaceClass {
            class: 0x03,
            subclass: 0x01,
            protocol: 0x02,
        }]);
        let result = probe_nic_and_bluetooth(&prober, 1, 1).unwrap();
        assert!(!result.is_nic);
        assert!(!result.is_bluetooth);
    }
}

//! The event dispatcher, §4.7.
//!
//! [`Core`] is the single mutator of §5: the device registry, VM registry,
//! and policy engine are all owned here with no internal synchronization,
//! because only one async task — [`run_dispatcher`]'s loop — ever calls a
//! `&mut self` method on it. The RPC surface (`rpc.rs`) never touches `Core`
//! directly; it sends [`DispatcherCommand`]s down a channel and awaits a
//! reply, the same way the enumerator's hotplug thread only ever produces
//! [`RawHotplugEvent`]s across [`usbmuxd_common::EnumeratorBridge`].

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use usbmuxd_common::usb_types::RawHotplugEvent;
use usbmuxd_common::EnumeratorBridge;
use usbmuxd_protocol::{
    pack_device_id, unpack_device_id, DeviceId, DeviceInfoResult, Notification, RuleRecord,
    SetRuleArgs,
};

use crate::attach::{self, AttachTarget, PassthroughDriver};
use crate::classifier::{self, EnumeratorQueue, OpticalWatcher};
use crate::device::{Device, DeviceRegistry};
use crate::error::{DaemonError, Result};
use crate::policy::{AutoAssignOutcome, PolicyEngine};
use crate::rule::Rule;
use crate::settings_bridge::SettingsStore;
use crate::shared_store::SharedStore;
use crate::usb_probe::DescriptorProber;
use crate::vm::{Vm, VmRegistry};

/// Requests the RPC surface sends to the dispatcher task, one per
/// [`usbmuxd_protocol::RpcHandler`] verb. Each carries a reply channel so
/// the sender can await the result without blocking the dispatcher loop on
/// anything but the work itself.
pub enum DispatcherCommand {
    NewVm {
        domid: i32,
        uuid: String,
        reply: oneshot::Sender<Result<()>>,
    },
    VmStopped {
        domid: i32,
        reply: oneshot::Sender<Result<()>>,
    },
    ListDevices {
        reply: oneshot::Sender<Result<Vec<DeviceId>>>,
    },
    GetDeviceInfo {
        dev_id: DeviceId,
        vm_uuid: String,
        reply: oneshot::Sender<Result<DeviceInfoResult>>,
    },
    AssignDevice {
        dev_id: DeviceId,
        vm_uuid: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UnassignDevice {
        dev_id: DeviceId,
        reply: oneshot::Sender<Result<()>>,
    },
    SetSticky {
        dev_id: DeviceId,
        sticky: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    NameDevice {
        dev_id: DeviceId,
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    PolicyList {
        reply: oneshot::Sender<Result<Vec<u16>>>,
    },
    PolicyGetRule {
        pos: u16,
        reply: oneshot::Sender<Result<RuleRecord>>,
    },
    PolicyGetRules {
        reply: oneshot::Sender<Result<Vec<RuleRecord>>>,
    },
    PolicySetRule {
        args: SetRuleArgs,
        reply: oneshot::Sender<Result<()>>,
    },
    PolicyRemoveRule {
        pos: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    ReloadPolicy {
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<Result<String>>,
    },
}

/// Where in the shared-store tree a VM's frontend lives, and who backs it.
/// Fixed at construction: every VM hangs off the same dom0 backend in this
/// daemon's topology, per §4.5's worked example.
pub struct AttachTopology {
    pub vm_root_prefix: String,
    pub backend_root: String,
    pub backend_domid: i32,
}

/// The core's owned state plus its external collaborators, §4.2/§4.4/§4.5/§4.6.
pub struct Core<S: SharedStore, T: SettingsStore, D: PassthroughDriver> {
    pub devices: DeviceRegistry,
    pub vms: VmRegistry,
    pub policy: PolicyEngine,
    store: S,
    settings: T,
    driver: D,
    notify_tx: async_channel::Sender<Notification>,
    topology: AttachTopology,
    state_wait_timeout: std::time::Duration,
}

impl<S: SharedStore, T: SettingsStore, D: PassthroughDriver> Core<S, T, D> {
    pub fn new(
        ui_vm_uuid: impl Into<String>,
        store: S,
        settings: T,
        driver: D,
        notify_tx: async_channel::Sender<Notification>,
        topology: AttachTopology,
        state_wait_timeout: std::time::Duration,
    ) -> Self {
        Self {
            devices: DeviceRegistry::new(),
            vms: VmRegistry::new(),
            policy: PolicyEngine::new(ui_vm_uuid),
            store,
            settings,
            driver,
            notify_tx,
            topology,
            state_wait_timeout,
        }
    }

    fn attach_target<'a>(&'a self, device: &'a Device, vm_root: &'a str, vm: &'a Vm) -> AttachTarget<'a> {
        AttachTarget {
            vm_root,
            backend_root: &self.topology.backend_root,
            backend_domid: self.topology.backend_domid,
            frontend_domid: vm.domid,
            vm_name: &vm.uuid,
            bus: device.bus,
            device: device.device,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
        }
    }

    fn vm_root(&self, domid: i32) -> String {
        format!("{}/{}", self.topology.vm_root_prefix, domid)
    }

    async fn notify(&self, notification: Notification) {
        if self.notify_tx.send(notification).await.is_err() {
            warn!("notification channel closed; dropping notification");
        }
    }

    // ---- hotplug path, §4.7 "add"/"remove" ---------------------------

    /// Runs the classifier over a raw hotplug event and, on arrival,
    /// auto-assigns and attaches the resulting device. Mirrors §4.7:
    /// `classify -> device_registry.add -> policy.auto_assign_new_device ->
    /// attach_protocol.plug -> notify` for adds, `attach_protocol.detach_if_bound
    /// -> device_registry.remove -> notify` for removals.
    pub async fn handle_hotplug_event<Q, W>(
        &mut self,
        event: RawHotplugEvent,
        queue: &Q,
        optical_watcher: &W,
        prober: &dyn DescriptorProber,
        is_new_device: bool,
    ) -> Result<()>
    where
        Q: EnumeratorQueue,
        W: OpticalWatcher,
    {
        match event {
            RawHotplugEvent::Added(node) => {
                let Some(device) =
                    classifier::classify(node, queue, optical_watcher, prober, is_new_device).await
                else {
                    return Ok(());
                };
                self.bind_new_device(device).await
            }
            RawHotplugEvent::Removed { bus, address } => self.handle_removed(bus, address).await,
        }
    }

    async fn bind_new_device(&mut self, device: Device) -> Result<()> {
        let bus = device.bus;
        let dev_on_bus = device.device;
        let vendor_id = device.vendor_id;
        let product_id = device.product_id;
        let is_optical = device
            .device_type
            .contains(usbmuxd_protocol::DeviceTypeMask::OPTICAL);
        self.devices.add(device)?;

        if is_optical {
            self.notify(Notification::OpticalDeviceDetected).await;
        }

        let ambiguous = self.devices.is_ambiguous(bus, dev_on_bus);
        let outcome = {
            let device = self.devices.lookup_by_bus_dev(bus, dev_on_bus).unwrap();
            self.policy
                .auto_assign_new_device(device, ambiguous, &self.vms, None)
        };

        match outcome {
            AutoAssignOutcome::Bind(domid) => {
                if let Err(e) = self.attach_device_to_vm(bus, dev_on_bus, domid).await {
                    error!(bus, device = dev_on_bus, "auto-attach failed: {e}");
                    self.notify(Notification::DeviceRejected {
                        name: format!("{vendor_id:04x}:{product_id:04x}"),
                        reason: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
                let dev_id = pack_device_id(bus as u32, dev_on_bus as u32);
                self.notify(Notification::DeviceAdded {
                    dev_id: DeviceId(dev_id),
                })
                .await;
            }
            AutoAssignOutcome::Denied => {
                self.notify(Notification::DeviceRejected {
                    name: format!("{vendor_id:04x}:{product_id:04x}"),
                    reason: "policy denied auto-assignment".into(),
                })
                .await;
            }
            AutoAssignOutcome::Ambiguous | AutoAssignOutcome::NoTarget => {}
        }

        self.notify(Notification::DevicesChanged).await;
        Ok(())
    }

    async fn attach_device_to_vm(&mut self, bus: u8, dev_on_bus: u8, domid: i32) -> Result<()> {
        let vm = self
            .vms
            .lookup(domid)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("vm {domid}")))?;
        let vm_root = self.vm_root(domid);
        {
            let device = self
                .devices
                .lookup_by_bus_dev(bus, dev_on_bus)
                .ok_or_else(|| DaemonError::NotFound(format!("device {bus}.{dev_on_bus}")))?;
            let target = self.attach_target(device, &vm_root, &vm);
            attach::plug(&self.store, &self.driver, &target, self.state_wait_timeout).await?;
        }
        let device = self
            .devices
            .lookup_by_bus_dev_mut(bus, dev_on_bus)
            .ok_or_else(|| DaemonError::NotFound(format!("device {bus}.{dev_on_bus}")))?;
        device.assigned_vm = Some(domid);
        Ok(())
    }

    async fn detach_device_from_vm(&mut self, bus: u8, dev_on_bus: u8) -> Result<()> {
        let domid = self
            .devices
            .lookup_by_bus_dev(bus, dev_on_bus)
            .and_then(|d| d.assigned_vm);
        let Some(domid) = domid else {
            return Ok(());
        };
        let vm = self
            .vms
            .lookup(domid)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("vm {domid}")))?;
        let vm_root = self.vm_root(domid);
        {
            let device = self
                .devices
                .lookup_by_bus_dev(bus, dev_on_bus)
                .ok_or_else(|| DaemonError::NotFound(format!("device {bus}.{dev_on_bus}")))?;
            let target = self.attach_target(device, &vm_root, &vm);
            attach::unplug(&self.store, &self.driver, &target, self.state_wait_timeout).await?;
        }
        if let Some(device) = self.devices.lookup_by_bus_dev_mut(bus, dev_on_bus) {
            device.assigned_vm = None;
        }
        Ok(())
    }

    async fn handle_removed(&mut self, bus: u8, address: u8) -> Result<()> {
        if self.devices.lookup_by_bus_dev(bus, address).is_none() {
            warn!(bus, address, "removal for an unknown device ignored");
            return Ok(());
        }

        if let Err(e) = self.detach_device_from_vm(bus, address).await {
            error!(bus, device = address, "detach-on-removal failed: {e}");
        }
        self.devices.remove(bus, address)?;
        self.notify(Notification::DevicesChanged).await;
        Ok(())
    }

    // ---- RPC verbs, §6.1 ----------------------------------------------

    pub async fn new_vm(&mut self, domid: i32, uuid: String) -> Result<()> {
        self.vms.add(domid, &uuid)?;
        let vm = self.vms.lookup(domid).cloned().expect("just inserted");
        let (aggregate, binds, rules_removed) = self
            .policy
            .auto_assign_devices_to_new_vm(&vm, &self.devices);
        if aggregate != 0 {
            warn!(domid, "auto-assignment on vm start hit an integrity violation");
        }
        if rules_removed {
            if let Err(e) = self.persist_policy().await {
                error!("failed to persist policy after vm-start rule cleanse: {e}");
            }
        }
        for (bus, dev_on_bus, target_domid) in binds {
            if let Err(e) = self.attach_device_to_vm(bus, dev_on_bus, target_domid).await {
                error!(bus, device = dev_on_bus, "auto-attach on vm start failed: {e}");
                continue;
            }
            let dev_id = pack_device_id(bus as u32, dev_on_bus as u32);
            self.notify(Notification::DeviceAdded {
                dev_id: DeviceId(dev_id),
            })
            .await;
        }
        self.notify(Notification::DevicesChanged).await;
        Ok(())
    }

    pub async fn vm_stopped(&mut self, domid: i32) -> Result<()> {
        let targets: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| d.assigned_vm == Some(domid))
            .cloned()
            .collect();

        let vm = self.vms.lookup(domid).cloned();
        let mut failures: HashMap<(u8, u8), u32> = HashMap::new();
        if let Some(vm) = &vm {
            let vm_root = self.vm_root(domid);
            for device in &targets {
                let target = self.attach_target(device, &vm_root, vm);
                if let Err(e) =
                    attach::unplug(&self.store, &self.driver, &target, self.state_wait_timeout).await
                {
                    error!(
                        bus = device.bus,
                        device = device.device,
                        "detach during vm stop failed: {e}"
                    );
                    failures.insert((device.bus, device.device), 1);
                }
            }
        }

        let aggregate = self
            .devices
            .unplug_all_from_vm(domid, |d| *failures.get(&(d.bus, d.device)).unwrap_or(&0));
        let _ = self.vms.remove(domid);
        self.notify(Notification::DevicesChanged).await;

        if aggregate != 0 {
            return Err(DaemonError::IntegrityViolation(format!(
                "vm {domid} stop: one or more devices failed to detach cleanly"
            )));
        }
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .map(|d| DeviceId(pack_device_id(d.bus as u32, d.device as u32)))
            .collect()
    }

    pub fn get_device_info(&self, dev_id: DeviceId, vm_uuid: &str) -> Result<DeviceInfoResult> {
        let (bus, dev_on_bus) = unpack_device_id(dev_id.0);
        let device = self
            .devices
            .lookup_by_bus_dev(bus as u8, dev_on_bus as u8)
            .ok_or_else(|| DaemonError::NotFound(format!("device {dev_id:?}")))?;
        let state = crate::diagnostics::resolve_device_state(device, vm_uuid, &self.policy, &self.vms);
        let assigned_vm = device
            .assigned_vm
            .and_then(|domid| self.vms.lookup(domid))
            .map(|vm| vm.uuid.clone());
        Ok(DeviceInfoResult {
            name: device.short_name.clone(),
            state,
            assigned_vm,
            detail: format!("{} ({})", device.long_name, device.sysname),
        })
    }

    pub async fn assign_device(&mut self, dev_id: DeviceId, vm_uuid: String) -> Result<()> {
        let (bus, dev_on_bus) = unpack_device_id(dev_id.0);
        let (bus, dev_on_bus) = (bus as u8, dev_on_bus as u8);

        let vm = self
            .vms
            .lookup_by_uuid(&vm_uuid)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("vm {vm_uuid}")))?;

        let denial = {
            let device = self
                .devices
                .lookup_by_bus_dev(bus, dev_on_bus)
                .ok_or_else(|| DaemonError::NotFound(format!("device {dev_id:?}")))?;

            if device.assigned_vm.is_some() {
                return Err(DaemonError::Validation(format!(
                    "device {dev_id:?} is already assigned to a vm"
                )));
            }

            if let Some(sticky) = self.policy.sticky_lookup(device) {
                if sticky.vm_uuid.as_deref().is_some_and(|uuid| uuid != vm_uuid) {
                    return Err(DaemonError::Validation(format!(
                        "device {dev_id:?} is sticky-assigned to a different vm"
                    )));
                }
            }

            let (allowed, rule_pos) = self.policy.is_allowed(device, &vm);
            (!allowed).then_some(rule_pos)
        };

        if let Some(rule_pos) = denial {
            self.notify(Notification::DeviceRejected {
                name: format!("{bus}.{dev_on_bus}"),
                reason: "policy denied manual assignment".into(),
            })
            .await;
            return Err(DaemonError::PolicyRefusal { rule_pos });
        }

        self.attach_device_to_vm(bus, dev_on_bus, vm.domid).await?;
        self.notify(Notification::DeviceAdded {
            dev_id: DeviceId(pack_device_id(bus as u32, dev_on_bus as u32)),
        })
        .await;
        self.notify(Notification::DevicesChanged).await;
        Ok(())
    }

    pub async fn unassign_device(&mut self, dev_id: DeviceId) -> Result<()> {
        let (bus, dev_on_bus) = unpack_device_id(dev_id.0);
        self.detach_device_from_vm(bus as u8, dev_on_bus as u8).await?;
        self.notify(Notification::DevicesChanged).await;
        Ok(())
    }

    /// Creates or deletes a sticky rule for the device and persists the
    /// rule list, per §3.1's "persisted after every mutation" and §4.4.6.
    pub async fn set_sticky(&mut self, dev_id: DeviceId, sticky: bool) -> Result<()> {
        let (bus, dev_on_bus) = unpack_device_id(dev_id.0);
        let (bus, dev_on_bus) = (bus as u8, dev_on_bus as u8);
        let ambiguous = self.devices.is_ambiguous(bus, dev_on_bus);
        let device = self
            .devices
            .lookup_by_bus_dev(bus, dev_on_bus)
            .ok_or_else(|| DaemonError::NotFound(format!("device {dev_id:?}")))?;

        if sticky {
            let domid = device
                .assigned_vm
                .ok_or_else(|| DaemonError::Validation("device is not assigned to a vm".into()))?;
            let vm_uuid = self
                .vms
                .lookup(domid)
                .map(|vm| vm.uuid.clone())
                .ok_or_else(|| DaemonError::NotFound(format!("vm {domid}")))?;
            self.policy.set_sticky(device, ambiguous, &vm_uuid)?;
        } else {
            self.policy.unset_sticky(device)?;
        }
        self.persist_policy().await?;
        Ok(())
    }

    pub fn name_device(&mut self, dev_id: DeviceId, name: String) -> Result<()> {
        let (bus, dev_on_bus) = unpack_device_id(dev_id.0);
        let device = self
            .devices
            .lookup_by_bus_dev_mut(bus as u8, dev_on_bus as u8)
            .ok_or_else(|| DaemonError::NotFound(format!("device {dev_id:?}")))?;
        device.short_name = name;
        Ok(())
    }

    pub fn policy_list(&self) -> Vec<u16> {
        self.policy.list_rules()
    }

    pub fn policy_get_rule(&self, pos: u16) -> Result<RuleRecord> {
        self.policy
            .get_rule(pos)
            .map(Rule::to_record)
            .ok_or_else(|| DaemonError::NotFound(format!("rule {pos}")))
    }

    pub fn policy_get_rules(&self) -> Vec<RuleRecord> {
        self.policy.rules().map(Rule::to_record).collect()
    }

    pub fn policy_set_rule(&mut self, args: SetRuleArgs) -> Result<()> {
        let vendor_id = args
            .vendor_hex
            .as_deref()
            .map(|s| usbmuxd_protocol::parse_hex_u16(s))
            .transpose()?;
        let product_id = args
            .product_hex
            .as_deref()
            .map(|s| usbmuxd_protocol::parse_hex_u16(s))
            .transpose()?;
        let rule = Rule {
            pos: args.pos,
            command: args.command.0,
            description: args.description,
            vendor_id,
            product_id,
            serial: args.serial,
            required_type: args.required_type,
            forbidden_type: args.forbidden_type,
            sysattrs: args.sysattrs,
            properties: args.properties,
            vm_uuid: args.vm_uuid,
        };
        self.policy.add_rule(rule);
        Ok(())
    }

    pub fn policy_remove_rule(&mut self, pos: u16) -> Result<()> {
        self.policy.remove_rule(pos)?;
        Ok(())
    }

    pub async fn reload_policy(&mut self) -> Result<()> {
        self.policy.reload_from_store(&self.settings).await
    }

    pub async fn persist_policy(&self) -> Result<()> {
        self.policy.persist(&self.settings).await
    }

    pub fn state(&self) -> String {
        crate::diagnostics::dump_state(&self.vms, &self.devices, &self.policy)
    }
}

/// Services one [`DispatcherCommand`], replying on its embedded channel.
/// Split out of the main loop so tests can drive it without constructing a
/// full `tokio::select!` around a live enumerator bridge.
pub(crate) async fn handle_command<S, T, D>(core: &mut Core<S, T, D>, command: DispatcherCommand)
where
    S: SharedStore,
    T: SettingsStore,
    D: PassthroughDriver,
{
    match command {
        DispatcherCommand::NewVm { domid, uuid, reply } => {
            let _ = reply.send(core.new_vm(domid, uuid).await);
        }
        DispatcherCommand::VmStopped { domid, reply } => {
            let _ = reply.send(core.vm_stopped(domid).await);
        }
        DispatcherCommand::ListDevices { reply } => {
            let _ = reply.send(Ok(core.list_devices()));
        }
        DispatcherCommand::GetDeviceInfo {
            dev_id,
            vm_uuid,
            reply,
        } => {
            let _ = reply.send(core.get_device_info(dev_id, &vm_uuid));
        }
        DispatcherCommand::AssignDevice {
            dev_id,
            vm_uuid,
            reply,
        } => {
            let _ = reply.send(core.assign_device(dev_id, vm_uuid).await);
        }
        DispatcherCommand::UnassignDevice { dev_id, reply } => {
            let _ = reply.send(core.unassign_device(dev_id).await);
        }
        DispatcherCommand::SetSticky {
            dev_id,
            sticky,
            reply,
        } => {
            let _ = reply.send(core.set_sticky(dev_id, sticky).await);
        }
        DispatcherCommand::NameDevice { dev_id, name, reply } => {
            let _ = reply.send(core.name_device(dev_id, name));
        }
        DispatcherCommand::PolicyList { reply } => {
            let _ = reply.send(Ok(core.policy_list()));
        }
        DispatcherCommand::PolicyGetRule { pos, reply } => {
            let _ = reply.send(core.policy_get_rule(pos));
        }
        DispatcherCommand::PolicyGetRules { reply } => {
            let _ = reply.send(Ok(core.policy_get_rules()));
        }
        DispatcherCommand::PolicySetRule { args, reply } => {
            let result = core.policy_set_rule(args);
            if result.is_ok() {
                if let Err(e) = core.persist_policy().await {
                    error!("failed to persist policy after set_rule: {e}");
                }
            }
            let _ = reply.send(result);
        }
        DispatcherCommand::PolicyRemoveRule { pos, reply } => {
            let result = core.policy_remove_rule(pos);
            if result.is_ok() {
                if let Err(e) = core.persist_policy().await {
                    error!("failed to persist policy after remove_rule: {e}");
                }
            }
            let _ = reply.send(result);
        }
        DispatcherCommand::ReloadPolicy { reply } => {
            let _ = reply.send(core.reload_policy().await);
        }
        DispatcherCommand::State { reply } => {
            let _ = reply.send(Ok(core.state()));
        }
    }
}

/// The dispatcher's own async task, §4.7: blocks on the enumerator bridge
/// and the RPC command channel, handling exactly one event per iteration so
/// `core` is never touched concurrently.
pub async fn run_dispatcher<S, T, D, Q, W>(
    mut core: Core<S, T, D>,
    enumerator: EnumeratorBridge,
    queue: Q,
    optical_watcher: W,
    prober: Box<dyn DescriptorProber + Send + Sync>,
    mut commands: tokio::sync::mpsc::Receiver<DispatcherCommand>,
) where
    S: SharedStore,
    T: SettingsStore,
    D: PassthroughDriver,
    Q: EnumeratorQueue,
    W: OpticalWatcher,
{
    info!("dispatcher loop started");
    loop {
        tokio::select! {
            event = enumerator.recv_event() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = core
                            .handle_hotplug_event(event, &queue, &optical_watcher, prober.as_ref(), true)
                            .await
                        {
                            error!("hotplug event handling failed: {e}");
                        }
                    }
                    Err(e) => {
                        error!("enumerator bridge closed: {e}");
                        break;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut core, command).await,
                    None => {
                        info!("dispatcher command channel closed, shutting down");
                        break;
                    }
                }
            }
        }
    }
    info!("dispatcher loop stopped");
}

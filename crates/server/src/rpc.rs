//! The RPC surface, §6.1.
//!
//! [`DispatcherHandle`] is a cheap, cloneable handle an RPC transport holds
//! per connected client; it implements [`usbmuxd_protocol::RpcHandler`] by
//! sending a [`crate::dispatcher::DispatcherCommand`] to the single
//! dispatcher task and awaiting its reply. No RPC transport (framing, the
//! actual IPC mechanism a management UI speaks) is implemented here or
//! anywhere in this crate — only this typed verb surface is, per §6.1's
//! "contract-only collaborator" framing.

use tokio::sync::{mpsc, oneshot};

use usbmuxd_protocol::{
    DeviceId, DeviceInfoResult, RpcHandler, RuleRecord, SetRuleArgs,
};

use crate::dispatcher::DispatcherCommand;
use crate::error::DaemonError;

#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    pub fn new(commands: mpsc::Sender<DispatcherCommand>) -> Self {
        Self { commands }
    }

    async fn call<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<crate::error::Result<R>>) -> DispatcherCommand,
    ) -> Result<R, DaemonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| DaemonError::FatalBootstrap("dispatcher task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| DaemonError::FatalBootstrap("dispatcher dropped the reply channel".into()))?
    }
}

impl RpcHandler for DispatcherHandle {
    type Error = DaemonError;

    async fn new_vm(&mut self, domid: u32, uuid: String) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::NewVm {
            domid: domid as i32,
            uuid,
            reply,
        })
        .await
    }

    async fn vm_stopped(&mut self, domid: u32) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::VmStopped {
            domid: domid as i32,
            reply,
        })
        .await
    }

    async fn list_devices(&self) -> Result<Vec<DeviceId>, Self::Error> {
        self.call(|reply| DispatcherCommand::ListDevices { reply }).await
    }

    async fn get_device_info(
        &self,
        dev_id: DeviceId,
        vm_uuid: String,
    ) -> Result<DeviceInfoResult, Self::Error> {
        self.call(|reply| DispatcherCommand::GetDeviceInfo {
            dev_id,
            vm_uuid,
            reply,
        })
        .await
    }

    async fn assign_device(
        &mut self,
        dev_id: DeviceId,
        vm_uuid: String,
    ) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::AssignDevice {
            dev_id,
            vm_uuid,
            reply,
        })
        .await
    }

    async fn unassign_device(&mut self, dev_id: DeviceId) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::UnassignDevice { dev_id, reply })
            .await
    }

    async fn set_sticky(&mut self, dev_id: DeviceId, sticky: bool) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::SetSticky {
            dev_id,
            sticky,
            reply,
        })
        .await
    }

    async fn name_device(&mut self, dev_id: DeviceId, name: String) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::NameDevice { dev_id, name, reply })
            .await
    }

    async fn policy_list(&self) -> Result<Vec<u16>, Self::Error> {
        self.call(|reply| DispatcherCommand::PolicyList { reply }).await
    }

    async fn policy_get_rule(&self, pos: u16) -> Result<RuleRecord, Self::Error> {
        self.call(|reply| DispatcherCommand::PolicyGetRule { pos, reply })
            .await
    }

    async fn policy_get_rules(&self) -> Result<Vec<RuleRecord>, Self::Error> {
        self.call(|reply| DispatcherCommand::PolicyGetRules { reply }).await
    }

    async fn policy_set_rule(&mut self, args: SetRuleArgs) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::PolicySetRule { args, reply })
            .await
    }

    async fn policy_remove_rule(&mut self, pos: u16) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::PolicyRemoveRule { pos, reply })
            .await
    }

    async fn reload_policy(&mut self) -> Result<(), Self::Error> {
        self.call(|reply| DispatcherCommand::ReloadPolicy { reply }).await
    }

    async fn state(&self) -> Result<String, Self::Error> {
        self.call(|reply| DispatcherCommand::State { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{AttachTopology, Core};
    use crate::error::Result;
    use crate::shared_store::{InMemorySharedStore, SharedStore};
    use crate::settings_bridge::SettingsStore;
    use crate::attach::PassthroughDriver;

    struct NoOpDriver;
    impl PassthroughDriver for NoOpDriver {
        fn claim(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Ok(())
        }
        fn release(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct NullSettingsStore;
    impl SettingsStore for NullSettingsStore {
        async fn read(&self, _path: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn write(&self, _path: &str, _value: &str) -> Result<()> {
            Ok(())
        }
        async fn list_children(&self, _path: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn remove_subtree(&self, _path: &str) -> Result<()> {
            Ok(())
        }
    }

    fn spawn_test_dispatcher() -> (DispatcherHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
        let (notify_tx, _notify_rx) = async_channel::unbounded();
        let mut core = Core::new(
            "ui-vm-uuid",
            InMemorySharedStore::new(),
            NullSettingsStore,
            NoOpDriver,
            notify_tx,
            AttachTopology {
                vm_root_prefix: "/local/domain".into(),
                backend_root: "/local/domain/0".into(),
                backend_domid: 0,
            },
            std::time::Duration::from_millis(30),
        );

        let handle = tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                crate::dispatcher::handle_command(&mut core, command).await;
            }
        });

        (DispatcherHandle::new(cmd_tx), handle)
    }

    #[tokio::test]
    async fn new_vm_then_list_devices_round_trips_over_the_channel() {
        let (mut rpc, _task) = spawn_test_dispatcher();
        rpc.new_vm(5, "guest-a".to_string()).await.unwrap();
        let devices = rpc.list_devices().await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn policy_set_then_get_rule_round_trips() {
        let (mut rpc, _task) = spawn_test_dispatcher();
        let mut args = SetRuleArgs {
            pos: 10,
            vendor_hex: Some("0x046d".into()),
            ..Default::default()
        };
        args.command.0 = usbmuxd_protocol::RuleCommand::Allow;
        rpc.policy_set_rule(args).await.unwrap();

        let rule = rpc.policy_get_rule(10).await.unwrap();
        assert_eq!(rule.vendor_id, Some(0x046d));
    }

    #[tokio::test]
    async fn policy_get_rule_not_found_surfaces_as_error() {
        let (rpc, _task) = spawn_test_dispatcher();
        assert!(rpc.policy_get_rule(999).await.is_err());
    }

    #[tokio::test]
    async fn policy_set_rule_basic_is_sugar_over_the_full_verb() {
        let (mut rpc, _task) = spawn_test_dispatcher();
        let mut args = usbmuxd_protocol::SetRuleBasicArgs {
            pos: 7,
            vendor_hex: Some("0x1234".into()),
            vm_uuid: Some("guest-a".into()),
            ..Default::default()
        };
        args.command.0 = usbmuxd_protocol::RuleCommand::Always;
        rpc.policy_set_rule_basic(args).await.unwrap();

        let rule = rpc.policy_get_rule(7).await.unwrap();
        assert_eq!(rule.vendor_id, Some(0x1234));
        assert_eq!(rule.vm_uuid.as_deref(), Some("guest-a"));
        assert!(rule.sysattrs.is_empty());
    }
}

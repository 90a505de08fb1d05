//! The attach/detach protocol engine, §4.5.
//!
//! Drives the shared-store handshake that wires a device through to a
//! guest's paravirtualized USB bus. The shared store itself is an external
//! collaborator (the [`SharedStore`] trait); this module only knows the
//! tree layout, the state machine, and the sequencing.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{DaemonError, Result};
use crate::shared_store::{Permissions, SharedStore, TxnOutcome, WaitOutcome};

/// Default deadline for the post-plug/post-unplug state wait, §4.5.4.
pub const DEFAULT_STATE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// The shared-store `state` values both endpoints pass through, §4.5.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Unknown,
    Initializing,
    InitWait,
    Initialized,
    Connected,
    Closing,
    Closed,
}

impl BusState {
    fn as_str(self) -> &'static str {
        match self {
            BusState::Unknown => "0",
            BusState::Initializing => "1",
            BusState::InitWait => "2",
            BusState::Initialized => "3",
            BusState::Connected => "4",
            BusState::Closing => "5",
            BusState::Closed => "6",
        }
    }
}

/// `virtid = (bus << 12) | (device & 0xFFF)`, §4.5.
pub fn virtid(bus: u8, device: u8) -> u32 {
    ((bus as u32) << 12) | (device as u32 & 0xFFF)
}

fn frontend_path(vm_root: &str, virtid: u32) -> String {
    format!("{vm_root}/device/vusb/{virtid}")
}

fn backend_path(backend_root: &str, domid: i32, virtid: u32) -> String {
    format!("{backend_root}/backend/vusb/{domid}/{virtid}")
}

/// Everything the plug/unplug sequences need to name shared-store paths and
/// permission owners; kept as a plain argument bundle rather than threaded
/// through many positional parameters.
pub struct AttachTarget<'a> {
    pub vm_root: &'a str,
    pub backend_root: &'a str,
    pub backend_domid: i32,
    pub frontend_domid: i32,
    pub vm_name: &'a str,
    pub bus: u8,
    pub device: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// The collaborator that claims/releases `(vendor, product)` on the
/// passthrough driver, §4.5.2 step 7 / §4.5.3 step 1. Modeled as a trait so
/// the attach protocol doesn't depend on a concrete sysfs path.
pub trait PassthroughDriver: Send + Sync {
    fn claim(&self, vendor_id: u16, product_id: u16) -> Result<()>;
    fn release(&self, vendor_id: u16, product_id: u16) -> Result<()>;
}

/// Writes `"<vendor-hex> <product-hex>"` to a sysfs `add-id`/`remove-id`
/// entry, §4.5.2 step 7 / §4.5.3 step 1.
pub struct SysfsPassthroughDriver {
    pub add_id_path: std::path::PathBuf,
    pub remove_id_path: std::path::PathBuf,
}

impl PassthroughDriver for SysfsPassthroughDriver {
    fn claim(&self, vendor_id: u16, product_id: u16) -> Result<()> {
        let line = format!("{vendor_id:04x} {product_id:04x}");
        std::fs::write(&self.add_id_path, line)
            .map_err(|e| DaemonError::TransientExternal(format!("add-id write failed: {e}")))
    }

    fn release(&self, vendor_id: u16, product_id: u16) -> Result<()> {
        let line = format!("{vendor_id:04x} {product_id:04x}");
        std::fs::write(&self.remove_id_path, line)
            .map_err(|e| DaemonError::TransientExternal(format!("remove-id write failed: {e}")))
    }
}

/// §4.5.2: creates both shared-store trees, wires the frontend/backend
/// fields, waits for both sides to reach `connected`, then claims the
/// device on the passthrough driver. A claim failure tears the trees back
/// down and returns an error; a state-wait timeout is logged and treated as
/// non-fatal (the caller proceeds as if setup succeeded, per §7 kind 5).
pub async fn plug<S: SharedStore>(
    store: &S,
    driver: &dyn PassthroughDriver,
    target: &AttachTarget<'_>,
    state_wait_timeout: Duration,
) -> Result<()> {
    let virtid = virtid(target.bus, target.device);
    let fe_path = frontend_path(target.vm_root, virtid);
    let be_path = backend_path(target.backend_root, target.frontend_domid, virtid);

    loop {
        store.mkdir(&be_path).await?;
        store
            .set_permissions(
                &be_path,
                Permissions {
                    owner_domid: target.backend_domid as u32,
                    readers: vec![target.frontend_domid as u32],
                },
            )
            .await?;

        store.mkdir(&fe_path).await?;
        store
            .set_permissions(
                &fe_path,
                Permissions {
                    owner_domid: target.frontend_domid as u32,
                    readers: vec![target.backend_domid as u32],
                },
            )
            .await?;

        store
            .write(&format!("{fe_path}/backend-id"), &target.backend_domid.to_string())
            .await?;
        store
            .write(&format!("{fe_path}/virtual-device"), &virtid.to_string())
            .await?;
        store.write(&format!("{fe_path}/backend"), &be_path).await?;
        store
            .write(&format!("{fe_path}/state"), BusState::Initializing.as_str())
            .await?;

        store
            .write(&format!("{be_path}/domain"), target.vm_name)
            .await?;
        store.write(&format!("{be_path}/frontend"), &fe_path).await?;
        store
            .write(&format!("{be_path}/state"), BusState::Initializing.as_str())
            .await?;
        store.write(&format!("{be_path}/online"), "1").await?;
        store
            .write(&format!("{be_path}/frontend-id"), &target.frontend_domid.to_string())
            .await?;
        store
            .write(
                &format!("{be_path}/physical-device"),
                &format!("{}.{}", target.bus, target.device),
            )
            .await?;

        let txn = store.transaction_start().await?;
        match store.transaction_end(txn).await? {
            TxnOutcome::Committed => break,
            TxnOutcome::Retry => continue,
        }
    }

    let outcome = store
        .wait_for_states(
            &format!("{fe_path}/state"),
            &format!("{be_path}/state"),
            &[BusState::Connected.as_str()],
            false,
            state_wait_timeout,
        )
        .await?;
    if outcome == WaitOutcome::TimedOut {
        warn!(bus = target.bus, device = target.device, "plug state-wait timed out; continuing");
    }

    if let Err(e) = driver.claim(target.vendor_id, target.product_id) {
        error!(
            bus = target.bus,
            device = target.device,
            "passthrough claim failed, tearing down shared-store trees"
        );
        let _ = store.remove(&fe_path).await;
        let _ = store.remove(&be_path).await;
        return Err(e);
    }

    info!(bus = target.bus, device = target.device, domid = target.frontend_domid, "device plugged");
    Ok(())
}

/// §4.5.3: releases the passthrough claim, marks the backend closing, waits
/// for both endpoints to reach `closed` (or for the backend to vanish — the
/// guest may already be gone), then removes both trees regardless of
/// whether the wait timed out.
pub async fn unplug<S: SharedStore>(
    store: &S,
    driver: &dyn PassthroughDriver,
    target: &AttachTarget<'_>,
    state_wait_timeout: Duration,
) -> Result<()> {
    let virtid = virtid(target.bus, target.device);
    let fe_path = frontend_path(target.vm_root, virtid);
    let be_path = backend_path(target.backend_root, target.frontend_domid, virtid);

    if let Err(e) = driver.release(target.vendor_id, target.product_id) {
        warn!("remove-id write failed, continuing with teardown: {e}");
    }

    store.write(&format!("{be_path}/online"), "0").await?;
    store
        .write(&format!("{be_path}/physical-device"), "0.0")
        .await?;
    store
        .write(&format!("{be_path}/state"), BusState::Closing.as_str())
        .await?;

    let outcome = store
        .wait_for_states(
            &format!("{be_path}/state"),
            &format!("{fe_path}/state"),
            &[BusState::Closed.as_str()],
            true,
            state_wait_timeout,
        )
        .await?;
    if outcome == WaitOutcome::TimedOut {
        warn!(bus = target.bus, device = target.device, "unplug state-wait timed out; removing trees anyway");
    }

    store.remove(&fe_path).await?;
    store.remove(&be_path).await?;

    info!(bus = target.bus, device = target.device, "device unplugged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_store::InMemorySharedStore;

    struct NoOpDriver;
    impl PassthroughDriver for NoOpDriver {
        fn claim(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Ok(())
        }
        fn release(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Ok(())
        }
    }

    struct FailingClaimDriver;
    impl PassthroughDriver for FailingClaimDriver {
        fn claim(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Err(DaemonError::TransientExternal("claim refused".into()))
        }
        fn release(&self, _vendor_id: u16, _product_id: u16) -> Result<()> {
            Ok(())
        }
    }

    fn target() -> AttachTarget<'static> {
        AttachTarget {
            vm_root: "/local/domain/5",
            backend_root: "/local/domain/0",
            backend_domid: 0,
            frontend_domid: 5,
            vm_name: "guest-a",
            bus: 1,
            device: 3,
            vendor_id: 0x046d,
            product_id: 0xc534,
        }
    }

    #[test]
    fn virtid_packs_bus_and_device() {
        assert_eq!(virtid(1, 3), (1u32 << 12) | 3);
    }

    #[tokio::test]
    async fn plug_times_out_but_still_claims_the_device() {
        let store = InMemorySharedStore::new();
        let t = target();
        let result = plug(&store, &NoOpDriver, &t, Duration::from_millis(30)).await;
        assert!(result.is_ok());
        assert_eq!(
            store
                .read(&format!("{}/device/vusb/{}/state", t.vm_root, virtid(1, 3)))
                .await
                .unwrap()
                .as_deref(),
            Some(BusState::Initializing.as_str())
        );
    }

    #[tokio::test]
    async fn plug_tears_down_trees_when_claim_fails() {
        let store = InMemorySharedStore::new();
        let t = target();
        let result = plug(&store, &FailingClaimDriver, &t, Duration::from_millis(30)).await;
        assert!(result.is_err());
        assert!(
            store
                .read(&format!("{}/device/vusb/{}/state", t.vm_root, virtid(1, 3)))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unplug_removes_both_trees_even_on_timeout() {
        let store = InMemorySharedStore::new();
        let t = target();
        plug(&store, &NoOpDriver, &t, Duration::from_millis(30))
            .await
            .unwrap();

        unplug(&store, &NoOpDriver, &t, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(
            store
                .read(&format!("{}/device/vusb/{}/state", t.vm_root, virtid(1, 3)))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .read(&format!(
                    "{}/backend/vusb/{}/{}/state",
                    t.backend_root,
                    t.frontend_domid,
                    virtid(1, 3)
                ))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unplug_succeeds_quickly_once_frontend_vanishes_and_backend_closes() {
        let store = std::sync::Arc::new(InMemorySharedStore::new());
        let t = target();
        plug(store.as_ref(), &NoOpDriver, &t, Duration::from_millis(30))
            .await
            .unwrap();

        let fe_state_key = format!("{}/device/vusb/{}/state", t.vm_root, virtid(1, 3));
        let be_state_key = format!(
            "{}/backend/vusb/{}/{}/state",
            t.backend_root,
            t.frontend_domid,
            virtid(1, 3)
        );

        let waiter = store.clone();
        let handle = tokio::spawn(async move {
            unplug(waiter.as_ref(), &NoOpDriver, &t, Duration::from_secs(10)).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.remove(&fe_state_key).await.unwrap();
        store
            .write(&be_state_key, BusState::Closed.as_str())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("unplug should finish well before its 10s deadline")
            .unwrap();
        assert!(result.is_ok());
    }
}

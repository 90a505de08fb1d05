//! Async/sync bridge between the single-threaded async dispatcher and the
//! dedicated OS thread that pumps the enumerator's blocking hotplug loop.
//!
//! `rusb`'s event handling blocks the calling thread, so it cannot live
//! inside the dispatcher's `tokio::select!`. This bridge is the one
//! synchronization point between the two: the worker thread only ever
//! produces [`RawHotplugEvent`]s, it never touches the device/VM registries
//! or the rule list, preserving the "single mutator" property of §5.

use async_channel::{Receiver, Sender, bounded};

use crate::usb_types::RawHotplugEvent;

/// Commands from the dispatcher to the enumerator worker thread.
#[derive(Debug)]
pub enum EnumeratorCommand {
    /// Ask the worker to stop its event loop and exit.
    Shutdown,
}

/// The async-facing half of the bridge.
#[derive(Clone)]
pub struct EnumeratorBridge {
    cmd_tx: Sender<EnumeratorCommand>,
    event_rx: Receiver<RawHotplugEvent>,
}

impl EnumeratorBridge {
    pub async fn send_command(&self, cmd: EnumeratorCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub async fn recv_event(&self) -> crate::Result<RawHotplugEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// The blocking-thread-facing half of the bridge.
pub struct EnumeratorWorkerChannel {
    pub(crate) cmd_rx: Receiver<EnumeratorCommand>,
    pub event_tx: Sender<RawHotplugEvent>,
}

impl EnumeratorWorkerChannel {
    pub fn try_recv_command(&self) -> Option<EnumeratorCommand> {
        self.cmd_rx.try_recv().ok()
    }

    pub fn send_event(&self, event: RawHotplugEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Builds the bridge pair: `(async side, blocking-thread side)`.
pub fn create_enumerator_bridge() -> (EnumeratorBridge, EnumeratorWorkerChannel) {
    let (cmd_tx, cmd_rx) = bounded(32);
    let (event_tx, event_rx) = bounded(256);

    (
        EnumeratorBridge { cmd_tx, event_rx },
        EnumeratorWorkerChannel { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridges_a_raw_event_across_threads() {
        let (bridge, worker) = create_enumerator_bridge();

        let handle = std::thread::spawn(move || {
            worker
                .send_event(RawHotplugEvent::Removed { bus: 1, address: 2 })
                .unwrap();
        });

        let event = bridge.recv_event().await.unwrap();
        assert!(matches!(
            event,
            RawHotplugEvent::Removed { bus: 1, address: 2 }
        ));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn delivers_shutdown_command_to_worker() {
        let (bridge, worker) = create_enumerator_bridge();
        bridge
            .send_command(EnumeratorCommand::Shutdown)
            .await
            .unwrap();
        assert!(matches!(
            worker.try_recv_command(),
            Some(EnumeratorCommand::Shutdown)
        ));
    }
}

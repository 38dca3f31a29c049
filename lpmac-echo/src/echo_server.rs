use anyhow::bail;
use log::{info, warn};
use lpmac::device::Radio;
use lpmac::mac::RxClient;
use lpmac::neighbors::NeighborObserver;
use lpmac::{LinkQuality, Mac, MacConfig, NeighborEvent, NodeId};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A basic echo server: every payload received is sent back to its source.
pub struct EchoServer {
    pub mac: Mac,
    receiver: Receiver<ProtocolMessage>,
}

impl EchoServer {
    pub fn start<R: Radio + 'static>(
        radio: R,
        hardware_id: u64,
        config: MacConfig,
    ) -> anyhow::Result<Self> {
        let (sender, receiver) = sync_channel(30);
        let handler = ProtocolHandler { sender };
        let mac = Mac::builder(radio, hardware_id)
            .config(config)
            .observer(handler.clone())
            .rx_client(handler)
            .start()?;
        Ok(Self { mac, receiver })
    }

    /// Serves until `running` is cleared.
    pub fn spawn(&mut self, running: &AtomicBool) -> anyhow::Result<()> {
        self.mac.announce()?;
        while running.load(Ordering::Relaxed) {
            match self.receiver.recv_timeout(Duration::from_millis(500)) {
                Ok(ProtocolMessage::ReceivedMessage(source, payload, quality)) => {
                    let text = String::from_utf8_lossy(&payload);
                    info!(
                        "Received payload from {:08X} (score {}): {}",
                        source,
                        quality.score(),
                        text
                    );
                    match self.mac.send(&payload, source) {
                        Ok(()) => info!("Echo delivered to {:08X}.", source),
                        Err(err) => warn!("Echo to {:08X} failed: {}", source, err),
                    }
                }
                Ok(ProtocolMessage::Neighbor(event, id)) => {
                    info!("Neighbor {:?}: {:08X}", event, id)
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("Fatal error: MAC disconnected."),
            }
        }
        Ok(())
    }
}

pub(crate) enum ProtocolMessage {
    ReceivedMessage(NodeId, Vec<u8>, LinkQuality),
    Neighbor(NeighborEvent, NodeId),
}

#[derive(Clone)]
pub(crate) struct ProtocolHandler {
    pub(crate) sender: SyncSender<ProtocolMessage>,
}

impl RxClient for ProtocolHandler {
    fn receive(&self, payload: &[u8], source: NodeId, quality: LinkQuality) {
        let message = ProtocolMessage::ReceivedMessage(source, payload.to_vec(), quality);
        if self.sender.try_send(message).is_err() {
            warn!("Echo queue full, payload from {:08X} dropped.", source);
        }
    }
}

impl NeighborObserver for ProtocolHandler {
    fn neighbor_event(&self, event: NeighborEvent, id: NodeId, _quality: LinkQuality) {
        let _ = self.sender.try_send(ProtocolMessage::Neighbor(event, id));
    }
}

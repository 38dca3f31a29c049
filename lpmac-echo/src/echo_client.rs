use crate::echo_server::{ProtocolHandler, ProtocolMessage};
use anyhow::bail;
use log::{info, warn};
use lpmac::device::Radio;
use lpmac::{Mac, MacConfig, NodeId};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// A basic echo client: sends its messages one by one to the server and
/// waits for them to come back.
pub struct EchoClient {
    pub mac: Mac,
    pub server: NodeId,
    pub messages: Vec<Vec<u8>>,
    receiver: Receiver<ProtocolMessage>,
}

impl EchoClient {
    pub fn start<R: Radio + 'static>(
        radio: R,
        hardware_id: u64,
        config: MacConfig,
        server: NodeId,
        messages: Vec<Vec<u8>>,
    ) -> anyhow::Result<Self> {
        let (sender, receiver) = sync_channel(30);
        let handler = ProtocolHandler { sender };
        let mac = Mac::builder(radio, hardware_id)
            .config(config)
            .observer(handler.clone())
            .rx_client(handler)
            .start()?;
        Ok(Self {
            mac,
            server,
            messages,
            receiver,
        })
    }

    /// Returns the number of messages echoed back.
    pub fn spawn(&mut self, echo_timeout: Duration) -> anyhow::Result<usize> {
        self.mac.join()?;
        let mut echoed = 0;
        while let Some(msg) = self.messages.pop() {
            let text = String::from_utf8_lossy(&msg).into_owned();
            info!("Sending message: {}", text);
            if let Err(err) = self.mac.send(&msg, self.server) {
                warn!("Message not acknowledged: {}", err);
                continue;
            }

            let sent = Instant::now();
            loop {
                let remaining = echo_timeout.saturating_sub(sent.elapsed());
                if remaining.is_zero() {
                    warn!("No echo for: {}", text);
                    break;
                }
                match self.receiver.recv_timeout(remaining) {
                    Ok(ProtocolMessage::ReceivedMessage(source, payload, _)) => {
                        info!(
                            "Received payload from {:08X}: {}",
                            source,
                            String::from_utf8_lossy(&payload)
                        );
                        if source == self.server && payload == msg {
                            echoed += 1;
                            break;
                        }
                    }
                    Ok(ProtocolMessage::Neighbor(event, id)) => {
                        info!("Neighbor {:?}: {:08X}", event, id)
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        bail!("Fatal error: MAC disconnected.")
                    }
                }
            }
        }
        Ok(echoed)
    }
}

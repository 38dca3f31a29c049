//! The MAC public surface.
//!
//! A [Mac] is a cheap handle on the engine worker: every call posts a request
//! to the worker and blocks until the worker answers. Callbacks registered on
//! the [MacBuilder] run on the worker thread, so they must not call the
//! blocking [Mac] operations themselves (forward the work to another thread).

mod engine;
pub mod lbt;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use smol::channel::{self, Sender};

use crate::device::frame::{self, FrameError};
use crate::device::{EventSink, Radio, RadioConfig};
use crate::error::MacError;
use crate::neighbors::{Neighbor, NeighborEvent, NeighborObserver, NeighborTable};
use crate::{node_id_from_hardware_id, LinkQuality, NodeId};
use engine::{Engine, Reply, Request};
pub use lbt::LbtConfig;

/// Receives the DATA payloads addressed to this node.
pub trait RxClient: Send {
    fn receive(&self, payload: &[u8], source: NodeId, quality: LinkQuality);
}

impl<F> RxClient for F
where
    F: Fn(&[u8], NodeId, LinkQuality) + Send,
{
    fn receive(&self, payload: &[u8], source: NodeId, quality: LinkQuality) {
        self(payload, source, quality)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MacConfig {
    /// Retransmissions of an unacknowledged unicast before giving up.
    pub max_retries: u8,
    /// Wait for an acknowledgment after each transmission.
    pub ack_timeout: Duration,
    /// Longest wait for the radio to report the end of a transmission.
    pub tx_guard: Duration,
    pub neighbor_capacity: usize,
    /// Drop unicast frames whose destinations do not include this node.
    pub strict_addressing: bool,
    /// Remove a neighbor from the table when a send to it fails.
    pub forget_unreachable: bool,
    /// Number of recently delivered (source, packet id) pairs remembered to
    /// discard retransmitted duplicates. Zero disables the check.
    pub duplicate_window: usize,
    pub lbt: LbtConfig,
    pub radio: RadioConfig,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            ack_timeout: Duration::from_secs(4),
            tx_guard: Duration::from_secs(5),
            neighbor_capacity: 16,
            strict_addressing: true,
            forget_unreachable: false,
            duplicate_window: 16,
            lbt: LbtConfig::default(),
            radio: RadioConfig::default(),
        }
    }
}

impl MacConfig {
    /// Upper bound of a [Mac::send] call while the channel is clear:
    /// `(initial delay + transmission + ack timeout) * (max_retries + 1)`.
    pub fn worst_case_send_latency(&self) -> Duration {
        let attempt = self.lbt.max_initial_delay() + self.tx_guard + self.ack_timeout;
        attempt * (self.max_retries as u32 + 1)
    }
}

/// Collects what the MAC needs before its worker starts.
pub struct MacBuilder<R: Radio> {
    radio: R,
    hardware_id: u64,
    config: MacConfig,
    observer: Option<Box<dyn NeighborObserver>>,
    rx_client: Option<Box<dyn RxClient>>,
}

impl<R: Radio + 'static> MacBuilder<R> {
    pub fn config(mut self, config: MacConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: impl NeighborObserver + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn on_neighbor<F>(self, callback: F) -> Self
    where
        F: Fn(NeighborEvent, NodeId, LinkQuality) + Send + Sync + 'static,
    {
        self.observer(callback)
    }

    pub fn rx_client(mut self, client: impl RxClient + 'static) -> Self {
        self.rx_client = Some(Box::new(client));
        self
    }

    pub fn on_receive<F>(self, callback: F) -> Self
    where
        F: Fn(&[u8], NodeId, LinkQuality) + Send + 'static,
    {
        self.rx_client(callback)
    }

    /// Configures the radio, puts it in reception and spawns the worker.
    pub fn start(self) -> Result<Mac, MacError> {
        let id = node_id_from_hardware_id(self.hardware_id);
        if id == 0 {
            warn!("Hardware id {:016X} maps to the reserved node id 0.", self.hardware_id);
        }
        let identity = Arc::new(AtomicU32::new(id));
        let neighbors = Arc::new(NeighborTable::new(
            self.config.neighbor_capacity,
            self.observer,
        ));
        let (event_sender, events) = channel::unbounded();
        let (request_sender, requests) = channel::unbounded();

        let mut engine = Engine::new(
            self.radio,
            self.config,
            identity.clone(),
            neighbors.clone(),
            self.rx_client,
            events,
            requests,
        );
        engine.configure(EventSink::new(event_sender))?;
        std::thread::Builder::new()
            .name(format!("lpmac-{:08X}", id))
            .spawn(move || smol::block_on(engine.run()))?;
        info!("LPMAC started, ID = 0x{:08X}", id);

        Ok(Mac {
            requests: request_sender,
            identity,
            neighbors,
        })
    }
}

/// Handle on a running MAC. Clones share the same worker.
///
/// Requests are served one at a time: a call made while another one is in
/// progress (typically a [Mac::send] waiting for its acknowledgment) waits
/// for it to finish.
#[derive(Clone)]
pub struct Mac {
    requests: Sender<Request>,
    identity: Arc<AtomicU32>,
    neighbors: Arc<NeighborTable>,
}

impl Mac {
    /// `hardware_id` is the board unique id, the node id is derived from it.
    pub fn builder<R: Radio + 'static>(radio: R, hardware_id: u64) -> MacBuilder<R> {
        MacBuilder {
            radio,
            hardware_id,
            config: MacConfig::default(),
            observer: None,
            rx_client: None,
        }
    }

    /// Forgets every neighbor and broadcasts a JOIN.
    ///
    /// Returns as soon as the radio is done: peers answer later and populate
    /// the table asynchronously.
    pub fn join(&self) -> Result<(), MacError> {
        self.request(|reply| Request::Join { clear: true, reply })
    }

    /// Broadcasts a JOIN, keeping the current neighbors.
    pub fn announce(&self) -> Result<(), MacError> {
        self.request(|reply| Request::Join { clear: false, reply })
    }

    /// Broadcasts an UNJOIN so that peers forget this node.
    pub fn leave(&self) -> Result<(), MacError> {
        self.request(|reply| Request::Leave { reply })
    }

    /// Sends `payload` to `destination` and waits for its acknowledgment.
    ///
    /// Fails with [MacError::RetriesExhausted] once the retry budget is spent.
    /// See [MacConfig::worst_case_send_latency] for how long this can block.
    pub fn send(&self, payload: &[u8], destination: NodeId) -> Result<(), MacError> {
        if destination == 0 || destination == self.identity(0) {
            return Err(MacError::InvalidDestination(destination));
        }
        check_payload(payload, 1)?;
        self.request(|reply| Request::Send {
            destination,
            payload: payload.to_vec(),
            reply,
        })
    }

    /// Sends `payload` to every node in range, without acknowledgment.
    pub fn broadcast(&self, payload: &[u8]) -> Result<(), MacError> {
        check_payload(payload, 0)?;
        self.request(|reply| Request::Broadcast {
            payload: payload.to_vec(),
            reply,
        })
    }

    /// Reads the node id when `id` is zero, overrides it otherwise.
    pub fn identity(&self, id: NodeId) -> NodeId {
        if id != 0 {
            info!("Node id overridden to {:08X}.", id);
            self.identity.store(id, Ordering::Relaxed);
        }
        self.identity.load(Ordering::Relaxed)
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbors.neighbors()
    }

    pub fn neighbor_table(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn clear_neighbors(&self) {
        self.neighbors.clear()
    }

    /// Stops the worker once the current request is done and puts the radio
    /// to sleep. Dropping every handle has the same effect.
    pub fn shutdown(&self) {
        let _ = self.requests.try_send(Request::Shutdown);
    }

    fn request(&self, make: impl FnOnce(Reply) -> Request) -> Result<(), MacError> {
        let (reply, response) = channel::bounded(1);
        self.requests
            .try_send(make(reply))
            .map_err(|_| MacError::Stopped)?;
        smol::block_on(response.recv()).map_err(|_| MacError::Stopped)?
    }
}

fn check_payload(payload: &[u8], dst_count: usize) -> Result<(), FrameError> {
    if payload.len() > frame::max_payload(dst_count) {
        return Err(FrameError::TooLarge {
            size: frame::header_size(dst_count) + payload.len(),
        });
    }
    Ok(())
}

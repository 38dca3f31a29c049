//! LoRa peer MAC.
//!
//! Turns a half-duplex LoRa transceiver shared by every node in range into a
//! best-effort addressed packet service:
//!
//! - neighbor discovery with JOIN/UNJOIN broadcasts and overheard traffic,
//! - listen-before-talk with randomized backoff before every transmission,
//! - acknowledged unicast with a bounded number of retransmissions.
//!
//! ## Usages
//! ```rust,no_run
//! use lpmac::device::sim::Air;
//! use lpmac::mac::Mac;
//!
//! let air = Air::new();
//! let mac = Mac::builder(air.radio(), 0x0000_0001)
//!     .on_neighbor(|event, id, quality| log::info!("{:?} {:08X} ({:?})", event, id, quality))
//!     .on_receive(|payload: &[u8], source, _quality| log::info!("{:08X} says {:?}", source, payload))
//!     .start()?;
//! mac.join()?;
//! mac.send(b"hi", 0x0000_0002)?;
//! # Ok::<(), lpmac::error::MacError>(())
//! ```

pub mod device;
pub mod error;
pub mod mac;
pub mod neighbors;

pub use error::MacError;
pub use mac::{LbtConfig, Mac, MacBuilder, MacConfig};
pub use neighbors::{Neighbor, NeighborEvent, NeighborTable};

/// Identifier of a node in the mesh.
///
/// Zero is never a valid node: it marks a blank table slot and "read" in
/// [Mac::identity].
pub type NodeId = u32;

/// Derives the node identifier from the board unique id.
///
/// Only the low 32 bits are kept, so two boards may end up with the same id.
pub fn node_id_from_hardware_id(hardware_id: u64) -> NodeId {
    (hardware_id & 0xFFFF_FFFF) as NodeId
}

const RSSI_MIN: i16 = -120;
const RSSI_MAX: i16 = -30;
const SNR_MIN: i16 = -20;
const SNR_MAX: i16 = 10;

/// Signal metrics of the frame a neighbor was last heard with.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct LinkQuality {
    /// dBm
    pub rssi: i16,
    /// dB
    pub snr: i8,
}

impl LinkQuality {
    pub fn new(rssi: i16, snr: i8) -> Self {
        Self { rssi, snr }
    }

    /// Combined quality on a 0-63 scale, SNR weighing twice as much as RSSI.
    pub fn score(&self) -> u8 {
        let rssi = normalize(self.rssi, RSSI_MIN, RSSI_MAX) as u16;
        let snr = normalize(self.snr as i16, SNR_MIN, SNR_MAX) as u16;
        ((rssi + 2 * snr) / 3) as u8
    }
}

fn normalize(value: i16, min: i16, max: i16) -> u8 {
    let shifted = value.clamp(min, max) - min;
    ((shifted as u32 * 63) / (max - min) as u32) as u8
}

use std::fmt::Debug;
use std::time::Duration;

use log::trace;
use smol::channel::Sender;

/// Asynchronous notifications emitted by a radio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RadioEvent {
    TxDone,
    TxTimeout,
    RxDone { frame: Vec<u8>, rssi: i16, snr: i8 },
    RxTimeout,
    RxError,
    CadDone { detected: bool },
}

/// Where a radio posts its [RadioEvent]s.
///
/// Posting never blocks, so it can be used from interrupt-like driver
/// callbacks. Events posted after the MAC is gone are discarded.
#[derive(Clone, Debug)]
pub struct EventSink(Sender<RadioEvent>);

impl EventSink {
    pub(crate) fn new(sender: Sender<RadioEvent>) -> Self {
        Self(sender)
    }

    pub fn post(&self, event: RadioEvent) {
        if let Err(err) = self.0.try_send(event) {
            trace!("Radio event dropped, nobody is listening: {:?}", err.into_inner());
        }
    }
}

/// LoRa bandwidth.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

/// LoRa modem parameters, shared by transmission and reception.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LoRaModem {
    pub bandwidth: Bandwidth,
    /// 7 to 12
    pub spreading_factor: u8,
    /// 1 = 4/5, 2 = 4/6, 3 = 4/7, 4 = 4/8
    pub coding_rate: u8,
    pub preamble_length: u16,
    pub fixed_length: bool,
    pub iq_inverted: bool,
}

impl Default for LoRaModem {
    fn default() -> Self {
        Self {
            bandwidth: Bandwidth::Khz125,
            spreading_factor: 7,
            coding_rate: 1,
            preamble_length: 8,
            fixed_length: false,
            iq_inverted: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxConfig {
    /// dBm
    pub power: i8,
    pub modem: LoRaModem,
    /// After this long without completion the radio reports [RadioEvent::TxTimeout].
    pub timeout: Duration,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            power: 20,
            modem: LoRaModem::default(),
            timeout: Duration::from_millis(3000),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RxConfig {
    pub modem: LoRaModem,
    /// In symbols.
    pub symbol_timeout: u16,
    pub continuous: bool,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            modem: LoRaModem::default(),
            symbol_timeout: 5,
            continuous: true,
        }
    }
}

/// Everything applied to the radio when the MAC starts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RadioConfig {
    /// Hz
    pub frequency: u32,
    pub tx: TxConfig,
    pub rx: RxConfig,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency: 902_000_000,
            tx: TxConfig::default(),
            rx: RxConfig::default(),
        }
    }
}

/// Radio physical device capability, as consumed by the MAC engine.
///
/// Operations only start things: their outcome is reported later through the
/// [EventSink] given to [Radio::init]. An implementation must post exactly one
/// of `TxDone`/`TxTimeout` per [Radio::send] and one `CadDone` per
/// [Radio::start_cad].
pub trait Radio: Send {
    type Error: Debug;

    fn init(&mut self, events: EventSink) -> Result<(), Self::Error>;
    fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error>;
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error>;
    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error>;
    fn send(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
    /// `None` listens until told otherwise.
    fn start_receive(&mut self, timeout: Option<Duration>) -> Result<(), Self::Error>;
    fn start_cad(&mut self) -> Result<(), Self::Error>;
    fn standby(&mut self) -> Result<(), Self::Error>;
    fn sleep(&mut self) -> Result<(), Self::Error>;

    /// Gives a polled radio the opportunity to report events.
    fn poll(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// How often [Radio::poll] must be called, `None` for interrupt-driven radios.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

//! In-memory radio medium.
//!
//! Every [SimRadio] created from the same [Air] shares one channel: a frame
//! sent by a station reaches every other station tuned on the same frequency
//! unless it is asleep or the link was cut. Delivery is instantaneous and a
//! station hears frames whatever mode it is in (besides sleep), which keeps
//! the MAC tests free of timing races. Reception timeouts are not simulated.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::trace;

use super::device::{EventSink, Radio, RadioEvent, RxConfig, TxConfig};
use super::frame::MAX_FRAME_LENGTH;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimMode {
    Standby,
    Sleep,
    Receive,
    Cad,
}

/// A frame that went through the air.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transmission {
    pub station: usize,
    pub frame: Vec<u8>,
    /// Stations the frame was delivered to.
    pub receivers: Vec<usize>,
    pub at: Instant,
}

struct Station {
    events: Option<EventSink>,
    mode: SimMode,
    frequency: u32,
}

struct AirState {
    stations: Vec<Station>,
    transmissions: Vec<Transmission>,
    busy: u32,
    tx_timeouts: u32,
    cut: HashSet<(usize, usize)>,
    rssi: i16,
    snr: i8,
}

/// The shared medium. Clones refer to the same air.
#[derive(Clone)]
pub struct Air {
    state: Arc<Mutex<AirState>>,
}

impl Default for Air {
    fn default() -> Self {
        Self::new()
    }
}

impl Air {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AirState {
                stations: Vec::new(),
                transmissions: Vec::new(),
                busy: 0,
                tx_timeouts: 0,
                cut: HashSet::new(),
                rssi: -60,
                snr: 9,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a station to the air. Stations are numbered from zero in
    /// creation order.
    pub fn radio(&self) -> SimRadio {
        let mut state = self.lock();
        state.stations.push(Station {
            events: None,
            mode: SimMode::Standby,
            frequency: 0,
        });
        SimRadio {
            air: self.clone(),
            station: state.stations.len() - 1,
        }
    }

    pub fn transmissions(&self) -> Vec<Transmission> {
        self.lock().transmissions.clone()
    }

    /// Frames sent by `station`, oldest first.
    pub fn frames_from(&self, station: usize) -> Vec<Vec<u8>> {
        self.lock()
            .transmissions
            .iter()
            .filter(|t| t.station == station)
            .map(|t| t.frame.clone())
            .collect()
    }

    /// The next `assessments` channel activity detections report activity.
    pub fn set_busy(&self, assessments: u32) {
        self.lock().busy = assessments;
    }

    /// The next `transmissions` sends reach nobody and report
    /// [RadioEvent::TxTimeout].
    pub fn set_tx_timeouts(&self, transmissions: u32) {
        self.lock().tx_timeouts = transmissions;
    }

    /// Delivers `frame` to every listening station, as if sent by a
    /// transmitter outside the air. Returns the stations reached.
    pub fn inject(&self, frame: &[u8]) -> Vec<usize> {
        let state = self.lock();
        let mut receivers = Vec::new();
        for (index, station) in state.stations.iter().enumerate() {
            if station.mode == SimMode::Sleep {
                continue;
            }
            if let Some(events) = &station.events {
                events.post(RadioEvent::RxDone {
                    frame: frame.to_vec(),
                    rssi: state.rssi,
                    snr: state.snr,
                });
                receivers.push(index);
            }
        }
        receivers
    }

    /// Quality reported with every delivered frame.
    pub fn set_link_quality(&self, rssi: i16, snr: i8) {
        let mut state = self.lock();
        state.rssi = rssi;
        state.snr = snr;
    }

    /// Frames sent by `from` no longer reach `to`.
    pub fn cut(&self, from: usize, to: usize) {
        self.lock().cut.insert((from, to));
    }

    pub fn restore(&self, from: usize, to: usize) {
        self.lock().cut.remove(&(from, to));
    }

    pub fn mode(&self, station: usize) -> Option<SimMode> {
        self.lock().stations.get(station).map(|s| s.mode)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SimError {
    #[error("Radio not initialized.")]
    NotInitialized,
    #[error("Frame too big ({size}B).")]
    TooBigFrame { size: usize },
}

/// One station of an [Air].
pub struct SimRadio {
    air: Air,
    station: usize,
}

impl SimRadio {
    pub fn station(&self) -> usize {
        self.station
    }

    fn set_mode(&self, mode: SimMode) {
        if let Some(station) = self.air.lock().stations.get_mut(self.station) {
            station.mode = mode;
        }
    }

    fn sink(&self) -> Result<EventSink, SimError> {
        self.air
            .lock()
            .stations
            .get(self.station)
            .and_then(|s| s.events.clone())
            .ok_or(SimError::NotInitialized)
    }
}

impl Radio for SimRadio {
    type Error = SimError;

    fn init(&mut self, events: EventSink) -> Result<(), SimError> {
        if let Some(station) = self.air.lock().stations.get_mut(self.station) {
            station.events = Some(events);
            station.mode = SimMode::Standby;
        }
        Ok(())
    }

    fn set_channel(&mut self, frequency: u32) -> Result<(), SimError> {
        if let Some(station) = self.air.lock().stations.get_mut(self.station) {
            station.frequency = frequency;
        }
        Ok(())
    }

    fn set_tx_config(&mut self, _config: &TxConfig) -> Result<(), SimError> {
        Ok(())
    }

    fn set_rx_config(&mut self, _config: &RxConfig) -> Result<(), SimError> {
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), SimError> {
        if frame.len() > MAX_FRAME_LENGTH {
            return Err(SimError::TooBigFrame { size: frame.len() });
        }
        let sender = self.sink()?;
        let mut state = self.air.lock();
        if state.tx_timeouts > 0 {
            state.tx_timeouts -= 1;
            trace!("Station {} transmission times out.", self.station);
            state.transmissions.push(Transmission {
                station: self.station,
                frame: frame.to_vec(),
                receivers: Vec::new(),
                at: Instant::now(),
            });
            state.stations[self.station].mode = SimMode::Standby;
            drop(state);
            sender.post(RadioEvent::TxTimeout);
            return Ok(());
        }
        let frequency = state.stations[self.station].frequency;
        let (rssi, snr) = (state.rssi, state.snr);

        let mut receivers = Vec::new();
        for (index, station) in state.stations.iter().enumerate() {
            if index == self.station
                || station.mode == SimMode::Sleep
                || station.frequency != frequency
                || state.cut.contains(&(self.station, index))
            {
                continue;
            }
            if let Some(events) = &station.events {
                events.post(RadioEvent::RxDone {
                    frame: frame.to_vec(),
                    rssi,
                    snr,
                });
                receivers.push(index);
            }
        }
        trace!(
            "Station {} sent {}B to {:?}.",
            self.station,
            frame.len(),
            receivers
        );
        state.transmissions.push(Transmission {
            station: self.station,
            frame: frame.to_vec(),
            receivers,
            at: Instant::now(),
        });
        state.stations[self.station].mode = SimMode::Standby;
        drop(state);

        sender.post(RadioEvent::TxDone);
        Ok(())
    }

    fn start_receive(&mut self, _timeout: Option<Duration>) -> Result<(), SimError> {
        self.set_mode(SimMode::Receive);
        Ok(())
    }

    fn start_cad(&mut self) -> Result<(), SimError> {
        let sink = self.sink()?;
        let detected = {
            let mut state = self.air.lock();
            let detected = state.busy > 0;
            state.busy = state.busy.saturating_sub(1);
            state.stations[self.station].mode = SimMode::Standby;
            detected
        };
        sink.post(RadioEvent::CadDone { detected });
        Ok(())
    }

    fn standby(&mut self) -> Result<(), SimError> {
        self.set_mode(SimMode::Standby);
        Ok(())
    }

    fn sleep(&mut self) -> Result<(), SimError> {
        self.set_mode(SimMode::Sleep);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::channel::{unbounded, Receiver};

    fn station(air: &Air) -> (SimRadio, Receiver<RadioEvent>) {
        let mut radio = air.radio();
        let (sender, events) = unbounded();
        radio.init(EventSink::new(sender)).unwrap();
        radio.set_channel(902_000_000).unwrap();
        radio.start_receive(None).unwrap();
        (radio, events)
    }

    #[test]
    fn frames_reach_every_other_station() {
        let air = Air::new();
        let (mut a, a_events) = station(&air);
        let (_b, b_events) = station(&air);
        let (_c, c_events) = station(&air);

        a.send(&[1, 2, 3]).unwrap();

        assert_eq!(a_events.try_recv(), Ok(RadioEvent::TxDone));
        for events in [&b_events, &c_events] {
            assert_eq!(
                events.try_recv(),
                Ok(RadioEvent::RxDone {
                    frame: vec![1, 2, 3],
                    rssi: -60,
                    snr: 9
                })
            );
        }
        assert!(a_events.try_recv().is_err());
        let log = air.transmissions();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].receivers, vec![1, 2]);
    }

    #[test]
    fn sleeping_and_cut_stations_hear_nothing() {
        let air = Air::new();
        let (mut a, _a_events) = station(&air);
        let (mut b, b_events) = station(&air);
        let (_c, c_events) = station(&air);
        let (mut d, d_events) = station(&air);

        b.sleep().unwrap();
        air.cut(0, 2);
        d.set_channel(868_000_000).unwrap();
        a.send(&[7]).unwrap();

        assert!(b_events.try_recv().is_err());
        assert!(c_events.try_recv().is_err());
        assert!(d_events.try_recv().is_err());
        assert_eq!(air.mode(1), Some(SimMode::Sleep));

        air.restore(0, 2);
        a.send(&[8]).unwrap();
        assert!(c_events.try_recv().is_ok());
    }

    #[test]
    fn timed_out_transmissions_reach_nobody() {
        let air = Air::new();
        let (mut a, a_events) = station(&air);
        let (_b, b_events) = station(&air);
        air.set_tx_timeouts(1);

        a.send(&[1]).unwrap();
        assert_eq!(a_events.try_recv(), Ok(RadioEvent::TxTimeout));
        assert!(b_events.try_recv().is_err());

        a.send(&[2]).unwrap();
        assert_eq!(a_events.try_recv(), Ok(RadioEvent::TxDone));
        assert!(b_events.try_recv().is_ok());
        let log = air.transmissions();
        assert!(log[0].receivers.is_empty());
        assert!(log[0].at <= log[1].at);
    }

    #[test]
    fn injected_frames_reach_every_awake_station() {
        let air = Air::new();
        let (_a, a_events) = station(&air);
        let (mut b, _b_events) = station(&air);
        b.sleep().unwrap();

        assert_eq!(air.inject(&[4, 2]), vec![0]);
        assert_eq!(
            a_events.try_recv(),
            Ok(RadioEvent::RxDone {
                frame: vec![4, 2],
                rssi: -60,
                snr: 9
            })
        );
        assert!(air.transmissions().is_empty());
    }

    #[test]
    fn cad_reports_the_configured_activity() {
        let air = Air::new();
        let (mut a, events) = station(&air);
        air.set_busy(2);

        for expected in [true, true, false] {
            a.start_cad().unwrap();
            assert_eq!(
                events.try_recv(),
                Ok(RadioEvent::CadDone { detected: expected })
            );
        }
    }

    #[test]
    fn rejects_oversized_frames_and_uninitialized_radios() {
        let air = Air::new();
        let mut bare = air.radio();
        assert_eq!(bare.send(&[0]), Err(SimError::NotInitialized));

        let (mut a, _events) = station(&air);
        assert_eq!(
            a.send(&[0; MAX_FRAME_LENGTH + 1]),
            Err(SimError::TooBigFrame {
                size: MAX_FRAME_LENGTH + 1
            })
        );
        assert!(air.transmissions().is_empty());
    }
}

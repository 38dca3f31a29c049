//! [Radio] on top of any `radio-hal` driver.
//!
//! `radio-hal` drivers are polled: the adapter turns the polled state into
//! [RadioEvent]s. Transmissions block until the driver reports completion,
//! channel activity is detected by comparing the channel RSSI to a threshold.
use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, trace, warn};
use radio::{Power, RadioState, Receive, ReceiveInfo, Rssi, State, Transmit};

use super::device::{EventSink, Radio, RadioEvent, RxConfig, TxConfig};
use super::frame::MAX_FRAME_LENGTH;

/// Every `radio-hal` capability the adapter relies on.
pub trait HalDevice<C, E>:
    Transmit<Error = E>
    + Receive<Error = E>
    + Power<Error = E>
    + radio::Channel<Channel = C, Error = E>
    + State<Error = E>
    + Rssi<Error = E>
    + DelayMs<u32>
{
}

impl<
        C: Debug,
        E: Debug,
        T: Transmit<Error = E>
            + Receive<Error = E>
            + Power<Error = E>
            + radio::Channel<Channel = C, Error = E>
            + State<Error = E>
            + Rssi<Error = E>
            + DelayMs<u32>,
    > HalDevice<C, E> for T
{
}

#[derive(thiserror::Error, Debug)]
pub enum HalError<E: Debug> {
    #[error("Internal radio error: {0:?}")]
    InternalRadioError(E),
    #[error("Radio not initialized.")]
    NotInitialized,
    #[error("Frame too big ({size}B).")]
    TooBigFrame { size: usize },
}

/// Default RSSI above which the channel is considered busy.
pub const DEFAULT_CAD_THRESHOLD: i16 = -115;

pub struct HalRadio<T, C, E>
where
    T: HalDevice<C, E>,
    C: Debug,
    E: Debug,
{
    radio: T,
    channel_for: fn(u32) -> C,
    cad_threshold: i16,
    poll_interval: Duration,
    tx_timeout: Duration,
    events: Option<EventSink>,
    rx_deadline: Option<Instant>,
    phantom: PhantomData<fn() -> E>,
}

impl<T, C, E> HalRadio<T, C, E>
where
    T: HalDevice<C, E>,
    C: Debug,
    E: Debug,
{
    /// `channel_for` maps a frequency in Hz to the driver channel type.
    pub fn new(radio: T, channel_for: fn(u32) -> C) -> Self {
        Self {
            radio,
            channel_for,
            cad_threshold: DEFAULT_CAD_THRESHOLD,
            poll_interval: Duration::from_millis(10),
            tx_timeout: TxConfig::default().timeout,
            events: None,
            rx_deadline: None,
            phantom: PhantomData,
        }
    }

    pub fn with_cad_threshold(mut self, dbm: i16) -> Self {
        self.cad_threshold = dbm;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn into_inner(self) -> T {
        self.radio
    }

    fn events(&self) -> Result<&EventSink, HalError<E>> {
        self.events.as_ref().ok_or(HalError::NotInitialized)
    }
}

impl<T, C, E> Radio for HalRadio<T, C, E>
where
    T: HalDevice<C, E> + Send,
    C: Debug,
    E: Debug,
{
    type Error = HalError<E>;

    fn init(&mut self, events: EventSink) -> Result<(), Self::Error> {
        self.events = Some(events);
        Ok(())
    }

    fn set_channel(&mut self, frequency: u32) -> Result<(), Self::Error> {
        let channel = (self.channel_for)(frequency);
        debug!("Switching to channel {:?}.", channel);
        self.radio
            .set_channel(&channel)
            .map_err(HalError::InternalRadioError)
    }

    /// Only the power and the timeout can be applied through `radio-hal`,
    /// modem parameters belong to the driver configuration.
    fn set_tx_config(&mut self, config: &TxConfig) -> Result<(), Self::Error> {
        self.tx_timeout = config.timeout;
        self.radio
            .set_power(config.power)
            .map_err(HalError::InternalRadioError)
    }

    fn set_rx_config(&mut self, config: &RxConfig) -> Result<(), Self::Error> {
        trace!("Reception modem {:?} left to the driver.", config.modem);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Self::Error> {
        if frame.len() > MAX_FRAME_LENGTH {
            return Err(HalError::TooBigFrame { size: frame.len() });
        }
        let events = self.events()?.clone();
        self.radio
            .start_transmit(frame)
            .map_err(HalError::InternalRadioError)?;
        let started = Instant::now();
        while !self
            .radio
            .check_transmit()
            .map_err(HalError::InternalRadioError)?
        {
            if started.elapsed() >= self.tx_timeout {
                warn!("Transmission not completed after {:?}.", self.tx_timeout);
                events.post(RadioEvent::TxTimeout);
                return Ok(());
            }
            self.radio.delay_ms(1);
        }
        events.post(RadioEvent::TxDone);
        Ok(())
    }

    fn start_receive(&mut self, timeout: Option<Duration>) -> Result<(), Self::Error> {
        self.rx_deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.radio
            .start_receive()
            .map_err(HalError::InternalRadioError)
    }

    fn start_cad(&mut self) -> Result<(), Self::Error> {
        let events = self.events()?.clone();
        self.radio
            .start_receive()
            .map_err(HalError::InternalRadioError)?;
        self.radio.delay_ms(1);
        let rssi = self
            .radio
            .poll_rssi()
            .map_err(HalError::InternalRadioError)?;
        trace!("CAD - RSSI {} dBm.", rssi);
        events.post(RadioEvent::CadDone {
            detected: rssi > self.cad_threshold,
        });
        Ok(())
    }

    fn standby(&mut self) -> Result<(), Self::Error> {
        self.radio
            .set_state(<<T as State>::State as RadioState>::idle())
            .map_err(HalError::InternalRadioError)
    }

    fn sleep(&mut self) -> Result<(), Self::Error> {
        self.radio
            .set_state(<<T as State>::State as RadioState>::sleep())
            .map_err(HalError::InternalRadioError)
    }

    fn poll(&mut self) -> Result<(), Self::Error> {
        let events = self.events()?.clone();
        if self
            .radio
            .check_receive(true)
            .map_err(HalError::InternalRadioError)?
        {
            let mut buf = [0u8; MAX_FRAME_LENGTH];
            match self.radio.get_received(&mut buf) {
                Ok((size, info)) => events.post(RadioEvent::RxDone {
                    frame: buf[..size.min(MAX_FRAME_LENGTH)].to_vec(),
                    rssi: info.rssi(),
                    snr: 0,
                }),
                Err(err) => {
                    debug!("Unable to read the received frame: {:?}", err);
                    events.post(RadioEvent::RxError);
                }
            }
            return Ok(());
        }
        if let Some(deadline) = self.rx_deadline {
            if Instant::now() >= deadline {
                self.rx_deadline = None;
                events.post(RadioEvent::RxTimeout);
            }
        }
        Ok(())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::channel::{unbounded, Receiver};
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct MockInfo {
        rssi: i16,
    }

    impl ReceiveInfo for MockInfo {
        fn rssi(&self) -> i16 {
            self.rssi
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MockState {
        Idle,
        Sleep,
    }

    impl RadioState for MockState {
        fn idle() -> Self {
            MockState::Idle
        }

        fn sleep() -> Self {
            MockState::Sleep
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    struct MockError;

    #[derive(Default)]
    struct MockDevice {
        sent: Vec<Vec<u8>>,
        transmit_polls: u32,
        inbox: VecDeque<(Vec<u8>, i16)>,
        channel: Option<u8>,
        power: Option<i8>,
        state: Option<MockState>,
        rssi: i16,
    }

    impl Transmit for MockDevice {
        type Error = MockError;

        fn start_transmit(&mut self, data: &[u8]) -> Result<(), MockError> {
            self.sent.push(data.to_vec());
            self.transmit_polls = 0;
            Ok(())
        }

        fn check_transmit(&mut self) -> Result<bool, MockError> {
            self.transmit_polls += 1;
            Ok(self.transmit_polls >= 3)
        }
    }

    impl Receive for MockDevice {
        type Error = MockError;
        type Info = MockInfo;

        fn start_receive(&mut self) -> Result<(), MockError> {
            Ok(())
        }

        fn check_receive(&mut self, _restart: bool) -> Result<bool, MockError> {
            Ok(!self.inbox.is_empty())
        }

        fn get_received(&mut self, buff: &mut [u8]) -> Result<(usize, MockInfo), MockError> {
            let (frame, rssi) = self.inbox.pop_front().ok_or(MockError)?;
            buff[..frame.len()].copy_from_slice(&frame);
            Ok((frame.len(), MockInfo { rssi }))
        }
    }

    impl Power for MockDevice {
        type Error = MockError;

        fn set_power(&mut self, power: i8) -> Result<(), MockError> {
            self.power = Some(power);
            Ok(())
        }
    }

    impl radio::Channel for MockDevice {
        type Channel = u8;
        type Error = MockError;

        fn set_channel(&mut self, channel: &u8) -> Result<(), MockError> {
            self.channel = Some(*channel);
            Ok(())
        }
    }

    impl State for MockDevice {
        type State = MockState;
        type Error = MockError;

        fn set_state(&mut self, state: MockState) -> Result<(), MockError> {
            self.state = Some(state);
            Ok(())
        }

        fn get_state(&mut self) -> Result<MockState, MockError> {
            self.state.ok_or(MockError)
        }
    }

    impl Rssi for MockDevice {
        type Error = MockError;

        fn poll_rssi(&mut self) -> Result<i16, MockError> {
            Ok(self.rssi)
        }
    }

    impl DelayMs<u32> for MockDevice {
        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn channel_for(frequency: u32) -> u8 {
        (frequency / 1_000_000 % 256) as u8
    }

    fn adapter(device: MockDevice) -> (HalRadio<MockDevice, u8, MockError>, Receiver<RadioEvent>) {
        let mut radio = HalRadio::new(device, channel_for);
        let (sender, events) = unbounded();
        radio.init(EventSink::new(sender)).unwrap();
        (radio, events)
    }

    #[test]
    fn configuration_reaches_the_driver() {
        let (mut radio, _events) = adapter(MockDevice::default());
        radio.set_channel(902_000_000).unwrap();
        radio.set_tx_config(&TxConfig::default()).unwrap();
        radio.standby().unwrap();

        let device = radio.into_inner();
        assert_eq!(device.channel, Some(134));
        assert_eq!(device.power, Some(20));
        assert_eq!(device.state, Some(MockState::Idle));
    }

    #[test]
    fn send_waits_for_the_driver() {
        let (mut radio, events) = adapter(MockDevice::default());
        radio.send(&[1, 2, 3]).unwrap();
        assert_eq!(events.try_recv(), Ok(RadioEvent::TxDone));
        assert_eq!(radio.into_inner().sent, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn poll_reports_received_frames() {
        let mut device = MockDevice::default();
        device.inbox.push_back((vec![9, 9], -70));
        let (mut radio, events) = adapter(device);

        radio.poll().unwrap();
        assert_eq!(
            events.try_recv(),
            Ok(RadioEvent::RxDone {
                frame: vec![9, 9],
                rssi: -70,
                snr: 0
            })
        );
        radio.poll().unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn poll_reports_reception_timeouts_once() {
        let (mut radio, events) = adapter(MockDevice::default());
        radio.start_receive(Some(Duration::ZERO)).unwrap();
        radio.poll().unwrap();
        radio.poll().unwrap();
        assert_eq!(events.try_recv(), Ok(RadioEvent::RxTimeout));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn cad_compares_rssi_to_the_threshold() {
        let device = MockDevice {
            rssi: -100,
            ..Default::default()
        };
        let (mut radio, events) = adapter(device);
        radio.start_cad().unwrap();
        assert_eq!(events.try_recv(), Ok(RadioEvent::CadDone { detected: true }));

        let (radio, events) = adapter(MockDevice {
            rssi: -120,
            ..Default::default()
        });
        let mut radio = radio.with_cad_threshold(-115);
        radio.start_cad().unwrap();
        assert_eq!(events.try_recv(), Ok(RadioEvent::CadDone { detected: false }));
    }

    #[test]
    fn uninitialized_adapter_refuses_to_send() {
        let mut radio: HalRadio<MockDevice, u8, MockError> =
            HalRadio::new(MockDevice::default(), channel_for);
        assert!(matches!(radio.send(&[0]), Err(HalError::NotInitialized)));
    }
}

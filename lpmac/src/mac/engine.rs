//! The MAC worker.
//!
//! All protocol state lives here and is only touched by the worker task:
//! outgoing transaction, packet id counter, channel access randomness and the
//! duplicate window. The task multiplexes radio events, user requests, the
//! acknowledgment timer and the radio poll tick.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use smol::channel::{Receiver, Sender};
use smol::future::{self, FutureExt};
use smol::Timer;

use super::lbt::ChannelAccess;
use super::{MacConfig, RxClient};
use crate::device::frame::{Packet, PacketHeader, PacketType};
use crate::device::{EventSink, Radio, RadioEvent};
use crate::error::MacError;
use crate::neighbors::NeighborTable;
use crate::{LinkQuality, NodeId};

pub(crate) type Reply = Sender<Result<(), MacError>>;

pub(crate) enum Request {
    Join { clear: bool, reply: Reply },
    Leave { reply: Reply },
    Send { destination: NodeId, payload: Vec<u8>, reply: Reply },
    Broadcast { payload: Vec<u8>, reply: Reply },
    Shutdown,
}

/// How a single trip through the radio ended.
#[derive(Debug)]
enum TxOutcome {
    Sent,
    TimedOut,
    ChannelBusy,
    Failed(MacError),
}

impl TxOutcome {
    /// A radio timeout is transient and already logged: the frame is
    /// reported as done.
    fn into_result(self) -> Result<(), MacError> {
        match self {
            TxOutcome::Sent | TxOutcome::TimedOut => Ok(()),
            TxOutcome::ChannelBusy => Err(MacError::ChannelBusy),
            TxOutcome::Failed(err) => Err(err),
        }
    }
}

/// The unicast awaiting its acknowledgment.
struct Transaction {
    destination: NodeId,
    packet_id: u8,
    frame: Vec<u8>,
    retries: u8,
    deadline: Instant,
    reply: Reply,
}

struct Inbound {
    frame: Vec<u8>,
    quality: LinkQuality,
}

enum Wake {
    Radio(RadioEvent),
    Request(Request),
    AckTimeout,
    Poll,
    Closed,
}

pub(crate) struct Engine<R: Radio> {
    radio: R,
    config: MacConfig,
    identity: Arc<AtomicU32>,
    neighbors: Arc<NeighborTable>,
    rx_client: Option<Box<dyn RxClient>>,
    events: Receiver<RadioEvent>,
    requests: Receiver<Request>,
    access: ChannelAccess,
    next_packet_id: u8,
    outgoing: Option<Transaction>,
    /// Frames received while a transmission was in progress.
    deferred: VecDeque<Inbound>,
    /// Recently delivered (source, packet id), oldest first.
    delivered: VecDeque<(NodeId, u8, Instant)>,
}

impl<R: Radio> Engine<R> {
    pub(crate) fn new(
        radio: R,
        config: MacConfig,
        identity: Arc<AtomicU32>,
        neighbors: Arc<NeighborTable>,
        rx_client: Option<Box<dyn RxClient>>,
        events: Receiver<RadioEvent>,
        requests: Receiver<Request>,
    ) -> Self {
        let seed = identity.load(Ordering::Relaxed) as u64;
        Self {
            radio,
            access: ChannelAccess::new(config.lbt, seed),
            config,
            identity,
            neighbors,
            rx_client,
            events,
            requests,
            next_packet_id: 0,
            outgoing: None,
            deferred: VecDeque::new(),
            delivered: VecDeque::new(),
        }
    }

    /// Applies the radio configuration and starts listening.
    pub(crate) fn configure(&mut self, events: EventSink) -> Result<(), MacError> {
        let radio_config = self.config.radio;
        self.radio.init(events).map_err(MacError::radio)?;
        self.radio
            .set_channel(radio_config.frequency)
            .map_err(MacError::radio)?;
        self.radio
            .set_tx_config(&radio_config.tx)
            .map_err(MacError::radio)?;
        self.radio
            .set_rx_config(&radio_config.rx)
            .map_err(MacError::radio)?;
        self.radio.start_receive(None).map_err(MacError::radio)?;
        debug!("Radio configured on {} Hz.", radio_config.frequency);
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        info!("MAC engine running.");
        loop {
            if let Some(inbound) = self.deferred.pop_front() {
                self.handle_frame(inbound).await;
                continue;
            }
            match self.next_wake().await {
                Wake::Radio(event) => self.handle_radio_event(event).await,
                Wake::Request(Request::Shutdown) | Wake::Closed => break,
                Wake::Request(request) => self.handle_request(request).await,
                Wake::AckTimeout => self.handle_ack_timeout().await,
                Wake::Poll => {
                    if let Err(err) = self.radio.poll() {
                        warn!("Radio poll failed: {:?}", err);
                        self.listen();
                    }
                }
            }
        }

        if let Some(transaction) = self.outgoing.take() {
            let _ = transaction.reply.try_send(Err(MacError::Stopped));
        }
        if let Err(err) = self.radio.sleep() {
            warn!("Unable to put the radio to sleep: {:?}", err);
        }
        info!("MAC engine stopped.");
    }

    /// Radio events win over everything else. New requests are only taken
    /// while no unicast is waiting for its acknowledgment.
    async fn next_wake(&self) -> Wake {
        let radio = async {
            match self.events.recv().await {
                Ok(event) => Wake::Radio(event),
                Err(_) => Wake::Closed,
            }
        };
        let idle = self.outgoing.is_none();
        let request = async {
            if !idle {
                return future::pending::<Wake>().await;
            }
            match self.requests.recv().await {
                Ok(request) => Wake::Request(request),
                Err(_) => Wake::Closed,
            }
        };
        let deadline = self.outgoing.as_ref().map(|t| t.deadline);
        let ack_timer = async move {
            match deadline {
                Some(deadline) => {
                    Timer::at(deadline).await;
                    Wake::AckTimeout
                }
                None => future::pending::<Wake>().await,
            }
        };
        let interval = self.radio.poll_interval();
        let poll = async move {
            match interval {
                Some(interval) => {
                    Timer::after(interval).await;
                    Wake::Poll
                }
                None => future::pending::<Wake>().await,
            }
        };
        radio.or(request).or(ack_timer).or(poll).await
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::RxDone { frame, rssi, snr } => {
                let quality = LinkQuality::new(rssi, snr);
                self.handle_frame(Inbound { frame, quality }).await
            }
            RadioEvent::RxTimeout => {
                trace!("Reception timed out, listening again.");
                self.listen();
            }
            RadioEvent::RxError => {
                debug!("Reception error, listening again.");
                self.listen();
            }
            other => trace!("Ignoring radio event {:?}.", other),
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Join { clear, reply } => {
                if clear {
                    self.neighbors.clear();
                }
                info!("Joining the network.");
                let header =
                    PacketHeader::broadcast(PacketType::Join, self.next_id(), self.id(), true);
                let result = self.send_broadcast(header, &[]).await;
                let _ = reply.try_send(result);
            }
            Request::Leave { reply } => {
                info!("Leaving the network.");
                let header =
                    PacketHeader::broadcast(PacketType::Unjoin, self.next_id(), self.id(), false);
                let result = self.send_broadcast(header, &[]).await;
                let _ = reply.try_send(result);
            }
            Request::Broadcast { payload, reply } => {
                let header =
                    PacketHeader::broadcast(PacketType::Data, self.next_id(), self.id(), false);
                let result = self.send_broadcast(header, &payload).await;
                let _ = reply.try_send(result);
            }
            Request::Send {
                destination,
                payload,
                reply,
            } => self.start_transaction(destination, &payload, reply).await,
            Request::Shutdown => {}
        }
    }

    async fn send_broadcast(
        &mut self,
        header: PacketHeader,
        payload: &[u8],
    ) -> Result<(), MacError> {
        let frame = Packet::new(header, payload.to_vec()).to_bytes()?;
        self.transmit(&frame).await.into_result()
    }

    async fn start_transaction(&mut self, destination: NodeId, payload: &[u8], reply: Reply) {
        let packet_id = self.next_id();
        let header =
            PacketHeader::unicast(PacketType::Data, packet_id, self.id(), destination, true);
        let frame = match Packet::new(header, payload.to_vec()).to_bytes() {
            Ok(frame) => frame,
            Err(err) => {
                let _ = reply.try_send(Err(err.into()));
                return;
            }
        };

        info!("Sending packet {} to {:08X}.", packet_id, destination);
        let outcome = self.transmit(&frame).await;
        log_attempt(&outcome, packet_id);
        self.outgoing = Some(Transaction {
            destination,
            packet_id,
            frame,
            retries: 0,
            deadline: Instant::now() + self.config.ack_timeout,
            reply,
        });
    }

    async fn handle_ack_timeout(&mut self) {
        let mut transaction = match self.outgoing.take() {
            Some(transaction) => transaction,
            None => return,
        };

        if transaction.retries < self.config.max_retries {
            transaction.retries += 1;
            warn!(
                "Checking missing acknowledgement... packet {} to {:08X}, retry {}/{}.",
                transaction.packet_id,
                transaction.destination,
                transaction.retries,
                self.config.max_retries
            );
            let outcome = self.transmit(&transaction.frame).await;
            log_attempt(&outcome, transaction.packet_id);
            transaction.deadline = Instant::now() + self.config.ack_timeout;
            self.outgoing = Some(transaction);
            return;
        }

        let attempts = transaction.retries as u32 + 1;
        warn!(
            "Packet {} to {:08X} unacknowledged after {} attempts.",
            transaction.packet_id, transaction.destination, attempts
        );
        if self.config.forget_unreachable {
            self.neighbors.remove(transaction.destination);
        }
        let _ = transaction.reply.try_send(Err(MacError::RetriesExhausted {
            destination: transaction.destination,
            attempts,
        }));
    }

    async fn handle_frame(&mut self, inbound: Inbound) {
        let packet = match Packet::try_from_bytes(&inbound.frame) {
            Ok(packet) => packet,
            Err(err) => {
                debug!("Packet ignored: {}", err);
                return;
            }
        };
        let me = self.id();
        let header = &packet.header;
        let source = header.source;
        if source == me {
            debug!("Packet ignored: it carries our own id.");
            return;
        }
        if source == 0 {
            debug!("Packet ignored: source id 0 is reserved.");
            return;
        }
        if self.config.strict_addressing && !header.is_addressed_to(me) {
            trace!("Packet {} from {:08X} is not addressed to us.", header.packet_id, source);
            self.neighbors.heard(source, inbound.quality);
            return;
        }

        if header.requests_ack() {
            self.acknowledge(header).await;
        }

        match header.packet_type {
            PacketType::Join => {
                debug!("JOIN from {:08X}.", source);
                self.neighbors.heard(source, inbound.quality);
            }
            PacketType::Unjoin => {
                debug!("UNJOIN from {:08X}.", source);
                self.neighbors.remove(source);
            }
            PacketType::Ack => {
                self.neighbors.heard(source, inbound.quality);
                self.handle_ack(header);
            }
            PacketType::Data => {
                self.neighbors.heard(source, inbound.quality);
                self.deliver(&packet, inbound.quality);
            }
            PacketType::Unknown(kind) => {
                self.neighbors.heard(source, inbound.quality);
                debug!("Packet ignored: unknown type {}.", kind);
            }
        }
    }

    async fn acknowledge(&mut self, header: &PacketHeader) {
        let ack = PacketHeader::unicast(
            PacketType::Ack,
            header.packet_id,
            self.id(),
            header.source,
            false,
        );
        let frame = match Packet::new(ack, Vec::new()).to_bytes() {
            Ok(frame) => frame,
            Err(err) => {
                error!("Unable to build an acknowledgment: {}", err);
                return;
            }
        };
        trace!(
            "Acknowledging packet {} from {:08X}.",
            header.packet_id,
            header.source
        );
        match self.transmit(&frame).await {
            TxOutcome::Sent => {}
            other => warn!("Acknowledgment not sent: {:?}", other),
        }
    }

    fn handle_ack(&mut self, header: &PacketHeader) {
        let matched = matches!(
            &self.outgoing,
            Some(t) if t.packet_id == header.packet_id && t.destination == header.source
        );
        if !matched {
            debug!(
                "Acknowledgment {} from {:08X} matches no pending packet.",
                header.packet_id, header.source
            );
            return;
        }
        if let Some(transaction) = self.outgoing.take() {
            info!(
                "Packet {} acknowledged by {:08X}.",
                transaction.packet_id, transaction.destination
            );
            let _ = transaction.reply.try_send(Ok(()));
        }
    }

    fn deliver(&mut self, packet: &Packet, quality: LinkQuality) {
        let header = &packet.header;
        if header.requests_ack() && self.config.duplicate_window > 0 {
            // Retransmissions never outlive the sender's worst case send
            // latency. Older entries may collide with a restarted sender.
            let now = Instant::now();
            let span = self.config.worst_case_send_latency();
            while matches!(self.delivered.front(), Some(&(_, _, at)) if now.duration_since(at) > span)
            {
                self.delivered.pop_front();
            }
            let duplicate = self
                .delivered
                .iter()
                .any(|&(source, id, _)| source == header.source && id == header.packet_id);
            if duplicate {
                debug!(
                    "Duplicate of packet {} from {:08X} dropped.",
                    header.packet_id, header.source
                );
                return;
            }
            if self.delivered.len() >= self.config.duplicate_window {
                self.delivered.pop_front();
            }
            self.delivered.push_back((header.source, header.packet_id, now));
        }

        match &self.rx_client {
            Some(client) => {
                trace!("Forwarding payload to the RxClient.");
                client.receive(&packet.payload, header.source, quality);
            }
            None => info!("Frame received but no RxClient connected!"),
        }
    }

    /// Listen-before-talk, then transmit and wait for the radio to be done.
    /// The radio is back in reception when this returns.
    async fn transmit(&mut self, frame: &[u8]) -> TxOutcome {
        let delay = self.access.begin();
        trace!("Delaying transmission by {}ms.", delay.as_millis());
        Timer::after(delay).await;

        if let Err(err) = self.radio.standby() {
            return self.abort(MacError::radio(err));
        }
        if self.access.config().cad_enabled {
            loop {
                if let Err(err) = self.radio.start_cad() {
                    return self.abort(MacError::radio(err));
                }
                let timeout = self.access.config().cad_timeout;
                let event = self
                    .await_radio(timeout, |e| matches!(e, RadioEvent::CadDone { .. }))
                    .await;
                match event {
                    Some(RadioEvent::CadDone { detected: true }) => match self.access.on_busy() {
                        Some(backoff) => {
                            debug!("Channel busy, backing off {}ms.", backoff.as_millis());
                            Timer::after(backoff).await;
                        }
                        None => {
                            warn!(
                                "Channel busy {} times in a row, giving up.",
                                self.access.busy_assessments()
                            );
                            self.listen();
                            return TxOutcome::ChannelBusy;
                        }
                    },
                    Some(_) => break,
                    None => {
                        debug!("No channel assessment reported, assuming a clear channel.");
                        break;
                    }
                }
            }
        }

        trace!("Transmitting a {}B frame.", frame.len());
        if let Err(err) = self.radio.send(frame) {
            return self.abort(MacError::radio(err));
        }
        let event = self
            .await_radio(self.config.tx_guard, |e| {
                matches!(e, RadioEvent::TxDone | RadioEvent::TxTimeout)
            })
            .await;
        let outcome = match event {
            Some(RadioEvent::TxDone) => TxOutcome::Sent,
            Some(_) => {
                warn!("Radio reported a transmission timeout.");
                TxOutcome::TimedOut
            }
            None => {
                warn!("Radio never reported the end of the transmission.");
                TxOutcome::TimedOut
            }
        };
        self.listen();
        outcome
    }

    /// Waits for the first radio event accepted by `wanted`. Received frames
    /// seen meanwhile are kept for later.
    async fn await_radio(
        &mut self,
        timeout: Duration,
        wanted: fn(&RadioEvent) -> bool,
    ) -> Option<RadioEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let event = async { self.events.recv().await.ok() }
                .or(async {
                    Timer::at(deadline).await;
                    None
                })
                .await?;
            if wanted(&event) {
                return Some(event);
            }
            match event {
                RadioEvent::RxDone { frame, rssi, snr } => {
                    let quality = LinkQuality::new(rssi, snr);
                    self.deferred.push_back(Inbound { frame, quality });
                }
                other => trace!("Ignoring radio event {:?} while transmitting.", other),
            }
        }
    }

    fn abort(&mut self, err: MacError) -> TxOutcome {
        warn!("Transmission aborted: {}", err);
        self.listen();
        TxOutcome::Failed(err)
    }

    fn listen(&mut self) {
        if let Err(err) = self.radio.start_receive(None) {
            error!("Unable to start reception: {:?}", err);
        }
    }

    fn id(&self) -> NodeId {
        self.identity.load(Ordering::Relaxed)
    }

    fn next_id(&mut self) -> u8 {
        let id = self.next_packet_id;
        self.next_packet_id = id.wrapping_add(1);
        id
    }
}

fn log_attempt(outcome: &TxOutcome, packet_id: u8) {
    match outcome {
        TxOutcome::Sent => trace!("Packet {} on air, waiting for its acknowledgment.", packet_id),
        other => warn!(
            "Packet {} not transmitted ({:?}), the acknowledgment timer will retry it.",
            packet_id, other
        ),
    }
}

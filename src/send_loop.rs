use std::cmp::{max, min};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::{HandshakeConfig, SocketType, SYN};
use crate::packet::{AckPacket, DataPacket, MessagePosition, NakPacket, MessageDropPacket, Packet, PacketKind};
use crate::packet_id::{PacketId, SequenceNumber};
use crate::send_buffer::{LossList, SendBuffer, SendPacketEntry};
use crate::socket_facade::{CongestionControl, SocketFacade, SocketState};
use crate::timers::{CoarseDeadline, SingleShotTimer};

const MIN_EXP_INTERVAL: Duration = Duration::from_millis(300);
const MIN_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// timeout recovery gives up only after this many consecutive EXP firings
const MAX_EXP_COUNT: u32 = 16;

const DEFAULT_FLOW_WINDOW: u32 = 16;
const DEFAULT_CONGESTION_WINDOW: u32 = 16;
const DEFAULT_MTU: usize = 1500;

/// Every 16th packet id triggers an opportunistic scan for expired messages.
const EXPIRE_SCAN_ALIGNMENT: u32 = 16;


#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SendState {
    /// connection open, nothing to do
    Idle,
    /// a packet went out recently, pacing timer pending
    Sending,
    /// the in-flight window is full, waiting for the peer to drain it
    Waiting,
    /// loss-list entries are scheduled for immediate retransmission
    ProcessDrop,
    /// socket is half-closed: still answering resend requests, not
    ///  accepting new messages
    Shutdown,
    Closed,
}

/// an application message waiting to be cut into data packets
#[derive(Clone, Debug)]
struct MessageEntry {
    content: Bytes,
    send_time: Instant,
    expire: Option<Instant>,
}

impl MessageEntry {
    /// append another message's content; enqueue time and expiry of the
    ///  first message win (stream mode only, where boundaries do not
    ///  survive anyway)
    fn absorb(&mut self, other: MessageEntry) {
        let mut combined = BytesMut::with_capacity(self.content.len() + other.content.len());
        combined.extend_from_slice(&self.content);
        combined.extend_from_slice(&other.content);
        self.content = combined.freeze();
    }
}

struct ReceivedPacket {
    packet: Packet,
    time_received: Instant,
}

/// Everything external threads may touch, guarded by one mutex. The lock is
///  never held across an await point.
struct SendEvents {
    socket_state: SocketState,
    recent_received_packet: bool,
    recent_exp_event: bool,
    recent_snd_event: bool,
    send_disconnect: bool,
    pending_messages: VecDeque<MessageEntry>,
    received_packets: VecDeque<ReceivedPacket>,
}

impl SendEvents {
    fn new() -> SendEvents {
        SendEvents {
            socket_state: SocketState::Init,
            recent_received_packet: false,
            recent_exp_event: false,
            recent_snd_event: false,
            send_disconnect: false,
            pending_messages: VecDeque::new(),
            received_packets: VecDeque::new(),
        }
    }
}

/// Pacing knobs written by congestion control on arbitrary threads and read
///  lock-free by the event loop.
struct Pacing {
    send_period_micros: AtomicU64,
    rto_period_micros: AtomicU64,
    congestion_window: AtomicU32,
    mtu: AtomicU64,
}

impl Pacing {
    fn new() -> Pacing {
        Pacing {
            send_period_micros: AtomicU64::new(0),
            rto_period_micros: AtomicU64::new(0),
            congestion_window: AtomicU32::new(DEFAULT_CONGESTION_WINDOW),
            mtu: AtomicU64::new(DEFAULT_MTU as u64),
        }
    }

    fn send_period(&self) -> Duration {
        Duration::from_micros(self.send_period_micros.load(Ordering::Relaxed))
    }

    fn set_send_period(&self, period: Duration) {
        self.send_period_micros.store(period.as_micros() as u64, Ordering::Relaxed);
    }

    /// integer back-off used by the deprecated congestion warning
    fn scale_send_period(&self, numerator: u64, denominator: u64) {
        let scaled = self.send_period_micros.load(Ordering::Relaxed) * numerator / denominator;
        self.send_period_micros.store(scaled, Ordering::Relaxed);
    }

    fn rto_period(&self) -> Duration {
        Duration::from_micros(self.rto_period_micros.load(Ordering::Relaxed))
    }

    fn set_rto_period(&self, rto: Duration) {
        self.rto_period_micros.store(rto.as_micros() as u64, Ordering::Relaxed);
    }

    fn congestion_window(&self) -> u32 {
        self.congestion_window.load(Ordering::Relaxed)
    }

    fn set_congestion_window(&self, packets: u32) {
        self.congestion_window.store(packets, Ordering::Relaxed);
    }

    fn mtu(&self) -> u64 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn set_mtu(&self, mtu: u64) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }
}

struct SenderShared {
    events: Mutex<SendEvents>,
    notify: Notify,
    pacing: Pacing,
}

impl SenderShared {
    fn push_event(&self, update: impl FnOnce(&mut SendEvents)) {
        {
            let mut events = self.events.lock().unwrap();
            update(&mut events);
        }
        self.notify.notify_one();
    }
}


/// The public handle to the sender half of a connection.
///
/// The sender is created parked: [`Sender::configure_handshake`] supplies
///  the negotiated parameters, and `set_state(Connected)` spawns the event
///  loop (callers must be inside a tokio runtime at that point). When the
///  socket leaves its running states the loop exits and parks the machine
///  state back into the handle, ready for a restart.
pub struct Sender {
    shared: Arc<SenderShared>,
    socket: Arc<dyn SocketFacade>,
    core_slot: Arc<Mutex<Option<SenderCore>>>,
}

impl Sender {
    pub fn new(socket: Arc<dyn SocketFacade>) -> Sender {
        let shared = Arc::new(SenderShared {
            events: Mutex::new(SendEvents::new()),
            notify: Notify::new(),
            pacing: Pacing::new(),
        });
        let core = SenderCore::new(socket.clone(), shared.clone());

        Sender {
            shared,
            socket,
            core_slot: Arc::new(Mutex::new(Some(core))),
        }
    }

    /// Apply the negotiated handshake parameters. Must be called while the
    ///  sender is parked; reconfiguring a running sender is refused.
    pub fn configure_handshake(&self, handshake: &HandshakeConfig, reset_sequence: bool, mtu: u32) {
        let mut slot = self.core_slot.lock().unwrap();
        let Some(core) = slot.as_mut() else {
            warn!("refusing to reconfigure the handshake while the sender is running");
            return;
        };

        if reset_sequence {
            core.send_packet_id = handshake.initial_packet_id;
            // the predecessor, so that the first packet itself can be acked
            core.last_ack_packet_id = handshake.initial_packet_id.prev();
        }
        core.mtu = mtu as usize;
        core.is_datagram = handshake.socket_type == SocketType::Datagram;
        core.flow_window_size = handshake.max_flow_window;
        self.shared.pacing.set_mtu(mtu as u64);
    }

    pub fn set_state(&self, new_state: SocketState) {
        self.shared.push_event(|events| events.socket_state = new_state);

        if new_state.is_running() {
            if let Some(core) = self.core_slot.lock().unwrap().take() {
                debug!("starting sender event loop");
                tokio::spawn(core.run(self.core_slot.clone()));
            }
        }
    }

    /// Queue an application message. `expire` is the absolute deadline
    ///  after which the message is dropped rather than (re-)sent; `None`
    ///  means it never expires. Messages are sent in FIFO order.
    pub fn send_message(&self, content: Bytes, expire: Option<Instant>) {
        let message = MessageEntry {
            content,
            send_time: Instant::now(),
            expire,
        };
        self.shared.push_event(|events| events.pending_messages.push_back(message));
    }

    /// Hand a peer packet (ACK, NAK, congestion warning) to the sender.
    pub fn packet_received(&self, packet: Packet, time_received: Instant) {
        let received = ReceivedPacket {
            packet,
            time_received,
        };
        self.shared.push_event(|events| events.received_packets.push_back(received));
    }

    /// Request that a Shutdown packet be sent at the next opportunity where
    ///  the connection is idle with nothing pending.
    pub fn queue_disconnect(&self) {
        self.shared.push_event(|events| events.send_disconnect = true);
    }

    /// Notification from the receive side that the peer is alive; resets
    ///  the expiration clock before the next event-loop iteration.
    pub fn reset_receive_timer(&self) {
        self.shared.push_event(|events| events.recent_received_packet = true);
    }

    /// Set the pacing delay between data packets (typically from congestion
    ///  control), clamped so the send rate cannot exceed the socket's
    ///  bandwidth cap at the configured MTU.
    pub fn set_packet_send_period(&self, period: Duration) {
        let mut period = period;
        let max_bandwidth = self.socket.max_bandwidth();
        if max_bandwidth > 0 {
            let min_period = Duration::from_micros(self.shared.pacing.mtu() * 1_000_000 / max_bandwidth);
            period = max(period, min_period);
        }
        self.shared.pacing.set_send_period(period);
    }

    pub fn set_congestion_window(&self, packets: u32) {
        self.shared.pacing.set_congestion_window(packets);
    }

    /// Congestion-control override for the expiration timeout calculation.
    pub fn set_rto_period(&self, rto: Duration) {
        self.shared.pacing.set_rto_period(rto);
    }
}


#[derive(Eq, PartialEq, Debug)]
enum LoopFlow {
    Continue,
    Wait,
    Exit,
}

/// one unit of work selected under the event mutex, executed after release
enum Action {
    ProcessDrop,
    EnterShutdown,
    Exit,
    ContinuePartial,
    StartMessage,
    SendDisconnect,
    Dispatch(ReceivedPacket),
    ExpEvent,
    SndEvent,
    Wait,
}

/// The sender state machine. While the event loop runs, this is owned by
///  its task and nothing else touches it; external threads communicate
///  through [`SendEvents`] and [`Pacing`] only.
struct SenderCore {
    socket: Arc<dyn SocketFacade>,
    shared: Arc<SenderShared>,

    send_state: SendState,
    /// the id the next fresh data packet will carry
    send_packet_id: PacketId,
    /// remainder of a message that did not fit into one packet
    msg_partial_send: Option<MessageEntry>,
    message_sequence: SequenceNumber,
    /// consecutive EXP firings without hearing from the peer
    exp_count: u32,
    last_receive_time: Instant,
    /// the acked frontier: largest id known fully acknowledged
    last_ack_packet_id: PacketId,
    /// ACK sequence of the last ACK2 we sent
    sent_ack2: SequenceNumber,
    send_pkt_pend: SendBuffer,
    send_loss_list: LossList,
    flow_window_size: u32,
    mtu: usize,
    is_datagram: bool,

    snd_timer: SingleShotTimer,
    exp_timer: SingleShotTimer,
    ack2_sent_deadline: CoarseDeadline,
}

impl SenderCore {
    fn new(socket: Arc<dyn SocketFacade>, shared: Arc<SenderShared>) -> SenderCore {
        SenderCore {
            socket,
            shared,
            send_state: SendState::Closed,
            send_packet_id: PacketId::ZERO,
            msg_partial_send: None,
            message_sequence: SequenceNumber::ZERO,
            exp_count: 1,
            last_receive_time: Instant::now(),
            last_ack_packet_id: PacketId::ZERO.prev(),
            sent_ack2: SequenceNumber::ZERO,
            send_pkt_pend: SendBuffer::default(),
            send_loss_list: LossList::default(),
            flow_window_size: DEFAULT_FLOW_WINDOW,
            mtu: DEFAULT_MTU,
            is_datagram: false,
            snd_timer: SingleShotTimer::default(),
            exp_timer: SingleShotTimer::default(),
            ack2_sent_deadline: CoarseDeadline::expired(),
        }
    }

    async fn run(mut self, park: Arc<Mutex<Option<SenderCore>>>) {
        self.startup_init();
        loop {
            match self.process_event().await {
                LoopFlow::Continue => {}
                LoopFlow::Wait => self.wait_for_event().await,
                LoopFlow::Exit => break,
            }
        }
        debug!("sender event loop exiting");
        *park.lock().unwrap() = Some(self);
    }

    fn startup_init(&mut self) {
        {
            let mut events = self.shared.events.lock().unwrap();
            events.recent_received_packet = false;
            events.recent_exp_event = false;
            events.recent_snd_event = false;
            events.send_disconnect = false;
            // messages queued before the connection came up stay queued
            events.received_packets.clear();
        }

        self.send_state = SendState::Idle;
        self.msg_partial_send = None;
        self.message_sequence = SequenceNumber::ZERO;
        self.exp_count = 1;
        self.last_receive_time = Instant::now();
        self.sent_ack2 = SequenceNumber::ZERO;
        self.send_pkt_pend.clear();
        self.send_loss_list.clear();
        self.snd_timer.stop();
        self.ack2_sent_deadline = CoarseDeadline::expired();
        self.reset_exp_timer();
    }

    /// One pass of the event loop: convert elapsed timer deadlines into
    ///  edge flags, pick one unit of work under the mutex, execute it with
    ///  the mutex released.
    async fn process_event(&mut self) -> LoopFlow {
        self.poll_timers();

        let mut refresh_exp = false;
        let action = {
            let shared = Arc::clone(&self.shared);
            let mut events = shared.events.lock().unwrap();

            // a live peer refreshes the expiration clock
            if events.recent_received_packet && self.send_state != SendState::Shutdown {
                events.recent_received_packet = false;
                events.recent_exp_event = false;
                refresh_exp = true;
            }

            self.decide(&mut events)
        };

        if refresh_exp {
            self.exp_count = 1;
            self.last_receive_time = Instant::now();
            self.reset_exp_timer();
        }

        match action {
            Action::ProcessDrop => {
                self.send_state = self.reeval_send_state();
                let resent = self.process_send_loss().await;
                if !resent || self.send_packet_id.to_raw() % EXPIRE_SCAN_ALIGNMENT == 0 {
                    self.process_send_expire().await;
                }
                LoopFlow::Continue
            }
            Action::EnterShutdown => {
                debug!("socket half-closed: serving resend requests only from now on");
                self.send_state = SendState::Shutdown;
                self.exp_timer.stop();
                LoopFlow::Continue
            }
            Action::Exit => {
                self.send_state = SendState::Closed;
                LoopFlow::Exit
            }
            Action::ContinuePartial => {
                self.process_data_msg(false).await;
                LoopFlow::Continue
            }
            Action::StartMessage => {
                self.process_data_msg(true).await;
                LoopFlow::Continue
            }
            Action::SendDisconnect => {
                debug!("sending shutdown packet");
                self.socket.send_packet(Packet::new(PacketKind::Shutdown)).await;
                LoopFlow::Continue
            }
            Action::Dispatch(received) => {
                self.dispatch_received(received).await;
                // an ingested NAK switches to ProcessDrop and must stay there
                if self.send_state != SendState::ProcessDrop {
                    self.send_state = self.reeval_send_state();
                }
                LoopFlow::Continue
            }
            Action::ExpEvent => {
                self.process_exp_event().await;
                LoopFlow::Continue
            }
            Action::SndEvent => {
                if self.send_state == SendState::Sending {
                    self.send_state = self.reeval_send_state();
                    let resent = self.process_send_loss().await;
                    if !resent || self.send_packet_id.to_raw() % EXPIRE_SCAN_ALIGNMENT == 0 {
                        self.process_send_expire().await;
                    }
                }
                LoopFlow::Continue
            }
            Action::Wait => LoopFlow::Wait,
        }
    }

    fn decide(&mut self, events: &mut SendEvents) -> Action {
        // drop-list processing preempts everything, even a dying socket
        if self.send_state == SendState::ProcessDrop {
            return Action::ProcessDrop;
        }

        match events.socket_state {
            SocketState::Connected => {}
            SocketState::HalfClosed => {
                if self.send_state != SendState::Shutdown {
                    events.recent_exp_event = false;
                    return Action::EnterShutdown;
                }
            }
            _ => return Action::Exit,
        }

        if self.send_state == SendState::Idle {
            if self.msg_partial_send.is_some() {
                return Action::ContinuePartial;
            }
            if let Some(message) = events.pending_messages.pop_front() {
                self.msg_partial_send = Some(message);
                return Action::StartMessage;
            }
            if events.send_disconnect {
                events.send_disconnect = false;
                return Action::SendDisconnect;
            }
        }

        if let Some(received) = events.received_packets.pop_front() {
            return Action::Dispatch(received);
        }
        if events.recent_exp_event {
            events.recent_exp_event = false;
            return Action::ExpEvent;
        }
        if events.recent_snd_event {
            events.recent_snd_event = false;
            return Action::SndEvent;
        }

        Action::Wait
    }

    fn poll_timers(&mut self) {
        let now = Instant::now();
        let snd_fired = self.snd_timer.poll_fired(now);
        let exp_fired = self.exp_timer.poll_fired(now);
        if snd_fired || exp_fired {
            let mut events = self.shared.events.lock().unwrap();
            events.recent_snd_event |= snd_fired;
            events.recent_exp_event |= exp_fired;
        }
    }

    async fn wait_for_event(&self) {
        let next_deadline = match (self.snd_timer.deadline(), self.exp_timer.deadline()) {
            (Some(snd), Some(exp)) => Some(min(snd, exp)),
            (snd, None) => snd,
            (None, exp) => exp,
        };

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = time::sleep_until(deadline) => {}
                }
            }
            None => self.shared.notify.notified().await,
        }
    }

    fn reeval_send_state(&self) -> SendState {
        if self.snd_timer.is_active() {
            return SendState::Sending;
        }

        // too many unacknowledged packets to send any more?
        if !self.send_pkt_pend.is_empty() {
            let window = min(self.flow_window_size, self.shared.pacing.congestion_window());
            if self.send_pkt_pend.len() as u32 >= window {
                return SendState::Waiting;
            }
        }
        SendState::Idle
    }

    /// Cut the next data packet from the partial-send slot and transmit it.
    ///
    /// Stream mode tops the slot up from the pending queue rather than
    ///  sending a short packet; datagram mode preserves message boundaries
    ///  and tags each fragment with its position.
    async fn process_data_msg(&mut self, is_first: bool) {
        // one message number per message, assigned when its first packet is cut
        if is_first {
            self.message_sequence = self.message_sequence.next();
        }

        while let Some(mut partial) = self.msg_partial_send.take() {
            let mut position = if self.is_datagram {
                if is_first { MessagePosition::First } else { MessagePosition::Middle }
            }
            else {
                MessagePosition::Only
            };

            if partial.content.len() >= self.mtu {
                // the slot holds at least one full packet: cut it, keep the rest
                let payload = partial.content.slice(..self.mtu);
                let send_time = partial.send_time;
                let expire = partial.expire;
                if partial.content.len() > self.mtu {
                    partial.content = partial.content.slice(self.mtu..);
                    self.msg_partial_send = Some(partial);
                }

                self.send_fresh_packet(position, payload, send_time, expire).await;
                return;
            }

            if self.is_datagram {
                position = if is_first { MessagePosition::Only } else { MessagePosition::Last };
            }
            else {
                let shared = Arc::clone(&self.shared);
                let next_message = shared.events.lock().unwrap().pending_messages.pop_front();
                if let Some(next_message) = next_message {
                    partial.absorb(next_message);
                    self.msg_partial_send = Some(partial);
                    continue;
                }
            }

            let MessageEntry { content, send_time, expire } = partial;
            self.send_fresh_packet(position, content, send_time, expire).await;
            return;
        }
    }

    async fn send_fresh_packet(
        &mut self,
        position: MessagePosition,
        payload: Bytes,
        send_time: Instant,
        expire: Option<Instant>,
    ) {
        let packet = DataPacket {
            packet_id: self.send_packet_id,
            position,
            is_ordered: !self.is_datagram,
            message_number: self.message_sequence,
            payload,
        };
        self.send_packet_id = self.send_packet_id.next();

        let entry = SendPacketEntry {
            packet,
            send_time,
            expire,
        };
        self.send_data_packet(entry, false).await;
    }

    /// Transmit a data packet (fresh or resent), record it as
    ///  unacknowledged, and work out what the pacing allows next.
    async fn send_data_packet(&mut self, entry: SendPacketEntry, is_resend: bool) {
        let packet_id = entry.packet_id();
        trace!(%packet_id, is_resend, len = entry.packet.payload.len(), "sending data packet");

        let data = entry.packet.clone();
        self.send_pkt_pend.insert(entry);
        self.socket.congestion_control().on_data_pkt_sent(packet_id);
        self.socket.send_packet(data.into()).await;

        // have we exhausted the recipient's window?
        self.send_state = self.reeval_send_state();
        if self.send_state == SendState::Waiting {
            return;
        }

        if !is_resend && packet_id.to_raw() % EXPIRE_SCAN_ALIGNMENT == 0 {
            self.process_send_expire().await;
            return;
        }

        let send_period = self.shared.pacing.send_period();
        if !send_period.is_zero() {
            self.snd_timer.start(send_period);
            self.send_state = SendState::Sending;
        }
    }

    /// Retransmit the first loss-list entry that is still pending and not
    ///  expired. Returns false if there was nothing to resend.
    async fn process_send_loss(&mut self) -> bool {
        if self.send_loss_list.is_empty() || self.send_pkt_pend.is_empty() {
            return false;
        }

        let now = Instant::now();
        let entry = loop {
            let Some(packet_id) = self.send_loss_list.first_in_window(self.last_ack_packet_id, self.send_packet_id) else {
                return false;
            };
            self.send_loss_list.remove(packet_id);

            let Some(entry) = self.send_pkt_pend.get(packet_id) else {
                // no record of this packet (already retired), nothing to do
                continue;
            };
            if entry.is_expired(now) {
                // leave it for the expiry-drop scan to clean up
                continue;
            }
            break entry.clone();
        };

        debug!(packet_id = %entry.packet_id(), age = ?entry.send_time.elapsed(), "retransmitting lost packet");
        self.send_data_packet(entry, true).await;
        true
    }

    /// Scan for an expired message among the unacknowledged packets; drop
    ///  the first one found in its entirety and tell the peer. At most one
    ///  message is dropped per invocation.
    async fn process_send_expire(&mut self) -> bool {
        if self.send_pkt_pend.is_empty() {
            return false;
        }

        let now = Instant::now();
        let snapshot = self.send_pkt_pend.iter()
            .map(|entry| (entry.packet_id(), entry.message_number(), entry.is_expired(now)))
            .collect::<Vec<_>>();

        for &(packet_id, message_number, expired) in &snapshot {
            if !expired {
                continue;
            }

            // collect the whole message this packet belongs to
            let mut first_packet_id = packet_id;
            let mut last_packet_id = packet_id;
            for &(other_id, other_message, _) in &snapshot {
                if other_message != message_number {
                    continue;
                }
                if other_id.blind_diff(first_packet_id) < 0 {
                    first_packet_id = other_id;
                }
                if other_id.blind_diff(last_packet_id) > 0 {
                    last_packet_id = other_id;
                }
                self.send_pkt_pend.remove(other_id);
                self.send_loss_list.remove(other_id);
            }

            debug!(%message_number, %first_packet_id, %last_packet_id, "message expired before acknowledgement - dropping");
            let drop_request = MessageDropPacket {
                message_number,
                first_packet_id,
                last_packet_id,
            };
            self.socket.send_packet(Packet::new(PacketKind::MessageDrop(drop_request))).await;
            return true;
        }
        false
    }

    /// The expiration timer fired: either give the peer up, or schedule
    ///  retransmission of everything unacknowledged (a keepalive if there
    ///  is nothing outstanding).
    async fn process_exp_event(&mut self) {
        let silence = self.last_receive_time.elapsed();
        if self.exp_count > MAX_EXP_COUNT && silence > MIN_CONNECTION_TIMEOUT {
            self.socket.request_shutdown(
                SocketState::Timeout,
                format!("timeout: last packet received {:?} ago", silence),
            );
            return;
        }

        if !self.send_pkt_pend.is_empty() {
            if self.send_loss_list.is_empty() {
                // resend all unacknowledged packets, but only if no resends
                //  are scheduled already
                let mut packet_id = self.last_ack_packet_id.next();
                while packet_id != self.send_packet_id {
                    self.send_loss_list.insert(packet_id);
                    packet_id = packet_id.next();
                }
                debug!(count = self.send_loss_list.len(), "expiration: scheduling full resend of unacknowledged packets");
            }
            self.socket.congestion_control().on_timeout();
            self.send_state = SendState::ProcessDrop;
        }
        else {
            trace!("expiration with nothing outstanding: sending keepalive");
            self.socket.send_packet(Packet::new(PacketKind::Keepalive)).await;
        }

        self.exp_count += 1;
        self.reset_exp_timer();
    }

    fn reset_exp_timer(&mut self) {
        let rto_override = self.shared.pacing.rto_period();
        let duration = if !rto_override.is_zero() {
            rto_override
        }
        else {
            let (rtt, rtt_variance) = self.socket.rtt_info();
            let computed = (rtt + rtt_variance * 4) * self.exp_count + SYN;
            max(computed, MIN_EXP_INTERVAL * self.exp_count)
        };
        self.exp_timer.start(duration);
    }

    async fn dispatch_received(&mut self, received: ReceivedPacket) {
        self.last_receive_time = received.time_received;
        match received.packet.kind {
            PacketKind::Ack(ack) => self.ingest_ack(ack).await,
            PacketKind::Nak(nak) => self.ingest_nak(nak).await,
            PacketKind::Congestion => self.ingest_congestion(),
            other => trace!("ignoring {:?} on the send side", other),
        }
    }

    /// `packet_id` must not be ahead of anything we have sent; a peer
    ///  acknowledging the future is broken and gets the connection killed.
    fn assert_valid_sent_packet_id(&self, packet_type: &str, packet_id: PacketId) -> bool {
        if self.send_packet_id.blind_diff(packet_id) < 0 {
            self.socket.request_shutdown(
                SocketState::Corrupted,
                format!(
                    "received an {} for packet {}, but the largest packet sent so far is {}",
                    packet_type, packet_id, self.send_packet_id,
                ),
            );
            return false;
        }
        true
    }

    async fn ingest_ack(&mut self, ack: AckPacket) {
        let last_packet_received = ack.last_packet_received;
        if !self.assert_valid_sent_packet_id("ACK", last_packet_received) {
            return;
        }

        match &ack.full_info {
            None => {
                // light ACK: move the frontier and widen the flow window
                let advance = last_packet_received.blind_diff(self.last_ack_packet_id);
                if advance <= 0 {
                    return;
                }
                self.flow_window_size += advance as u32;
            }
            Some(info) => {
                // answer with an ACK2, at most once per SYN
                //TODO the equality gate looks inverted; verify against peer
                // implementations before changing it
                if self.ack2_sent_deadline.has_expired() && ack.ack_sequence == self.sent_ack2 {
                    self.sent_ack2 = ack.ack_sequence;
                    self.socket.send_packet(Packet::new(PacketKind::Ack2(ack.ack_sequence))).await;
                    self.ack2_sent_deadline.set_remaining(SYN);
                }

                if last_packet_received.blind_diff(self.last_ack_packet_id) <= 0 {
                    return;
                }
                self.flow_window_size = ack.avail_buffer_size;
                self.socket.apply_rtt_sample(Duration::from_micros(info.rtt_micros as u64));
                self.socket.apply_receive_rates(info.packet_receive_rate, info.estimated_link_capacity);
            }
        }

        let old_frontier = self.last_ack_packet_id;
        self.last_ack_packet_id = last_packet_received;
        trace!(frontier = %last_packet_received, "ACK advanced the frontier");
        self.socket.congestion_control().on_ack(last_packet_received);

        // release everything up to and including the new frontier
        while let Some(packet_id) = self.send_pkt_pend.first_in_window(old_frontier, self.send_packet_id) {
            if last_packet_received.blind_diff(packet_id) < 0 {
                break;
            }
            self.send_pkt_pend.remove(packet_id);
        }
        while let Some(packet_id) = self.send_loss_list.first_in_window(old_frontier, self.send_packet_id) {
            if last_packet_received.blind_diff(packet_id) < 0 {
                break;
            }
            self.send_loss_list.remove(packet_id);
        }
    }

    async fn ingest_nak(&mut self, nak: NakPacket) {
        let mut fresh_losses = Vec::new();

        let mut entries = nak.loss_data.iter();
        while let Some(&entry) = entries.next() {
            if entry & NakPacket::RANGE_START_BIT != 0 {
                let first = PacketId::from_raw(entry);
                let Some(&end_entry) = entries.next() else {
                    self.socket.request_shutdown(
                        SocketState::Corrupted,
                        format!("while unpacking a NAK, the last entry ({:#010x}) was describing a start-of-range", entry),
                    );
                    return;
                };
                if end_entry & NakPacket::RANGE_START_BIT != 0 {
                    self.socket.request_shutdown(
                        SocketState::Corrupted,
                        format!("while unpacking a NAK, a start-of-range ({:#010x}) was followed by another start-of-range ({:#010x})", entry, end_entry),
                    );
                    return;
                }
                let last = PacketId::from_raw(end_entry);
                if !self.assert_valid_sent_packet_id("NAK", first)
                    || !self.assert_valid_sent_packet_id("NAK", last)
                {
                    return;
                }
                if last.blind_diff(first) < 0 {
                    self.socket.request_shutdown(
                        SocketState::Corrupted,
                        format!("while unpacking a NAK, range end {} lies before range start {}", last, first),
                    );
                    return;
                }

                let mut packet_id = first;
                loop {
                    fresh_losses.push(packet_id);
                    self.send_loss_list.insert(packet_id);
                    if packet_id == last {
                        break;
                    }
                    packet_id = packet_id.next();
                }
            }
            else {
                let packet_id = PacketId::from_raw(entry);
                if !self.assert_valid_sent_packet_id("NAK", packet_id) {
                    return;
                }
                fresh_losses.push(packet_id);
                self.send_loss_list.insert(packet_id);
            }
        }

        debug!(count = fresh_losses.len(), "NAK received, scheduling retransmission");
        self.socket.congestion_control().on_nak(&fresh_losses);
        // immediately restart transmission
        self.send_state = SendState::ProcessDrop;
    }

    /// Deprecated congestion warning: one-way delay is increasing, so back
    ///  the send rate off. No other effect.
    fn ingest_congestion(&mut self) {
        debug!("received congestion warning, increasing the send period");
        self.shared.pacing.scale_send_period(1125, 1000);
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rstest::rstest;

    use crate::packet::FullAckInfo;
    use crate::socket_facade::{MockCongestionControl, NoCongestionControl};

    use super::*;

    struct RecordingFacade {
        packets: Mutex<Vec<Packet>>,
        shutdown_requests: Mutex<Vec<(SocketState, String)>>,
        rtt_samples: Mutex<Vec<Duration>>,
        receive_rate_samples: Mutex<Vec<(u32, u32)>>,
        congestion: Arc<dyn CongestionControl>,
        rtt_info: (Duration, Duration),
        max_bandwidth: u64,
    }

    use async_trait::async_trait;

    impl RecordingFacade {
        fn new() -> Arc<RecordingFacade> {
            Self::with_congestion(Arc::new(NoCongestionControl))
        }

        fn with_congestion(congestion: Arc<dyn CongestionControl>) -> Arc<RecordingFacade> {
            Arc::new(RecordingFacade {
                packets: Mutex::new(Vec::new()),
                shutdown_requests: Mutex::new(Vec::new()),
                rtt_samples: Mutex::new(Vec::new()),
                receive_rate_samples: Mutex::new(Vec::new()),
                congestion,
                rtt_info: (Duration::from_millis(10), Duration::from_millis(5)),
                max_bandwidth: 0,
            })
        }

        fn with_max_bandwidth(max_bandwidth: u64) -> Arc<RecordingFacade> {
            let mut facade = Arc::into_inner(Self::new()).unwrap();
            facade.max_bandwidth = max_bandwidth;
            Arc::new(facade)
        }

        fn sent(&self) -> Vec<Packet> {
            self.packets.lock().unwrap().clone()
        }

        fn data_packets(&self) -> Vec<DataPacket> {
            self.sent().into_iter()
                .filter_map(|packet| match packet.kind {
                    PacketKind::Data(data) => Some(data),
                    _ => None,
                })
                .collect()
        }

        fn drop_requests(&self) -> Vec<MessageDropPacket> {
            self.sent().into_iter()
                .filter_map(|packet| match packet.kind {
                    PacketKind::MessageDrop(drop) => Some(drop),
                    _ => None,
                })
                .collect()
        }

        fn shutdowns(&self) -> Vec<(SocketState, String)> {
            self.shutdown_requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SocketFacade for RecordingFacade {
        async fn send_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }

        fn congestion_control(&self) -> Arc<dyn CongestionControl> {
            self.congestion.clone()
        }

        fn max_bandwidth(&self) -> u64 {
            self.max_bandwidth
        }

        fn apply_rtt_sample(&self, rtt: Duration) {
            self.rtt_samples.lock().unwrap().push(rtt);
        }

        fn apply_receive_rates(&self, packet_receive_rate: u32, estimated_link_capacity: u32) {
            self.receive_rate_samples.lock().unwrap().push((packet_receive_rate, estimated_link_capacity));
        }

        fn rtt_info(&self) -> (Duration, Duration) {
            self.rtt_info
        }

        fn request_shutdown(&self, reason: SocketState, message: String) {
            self.shutdown_requests.lock().unwrap().push((reason, message));
        }
    }

    /// a sender with its event loop NOT spawned, so tests can single-step it
    fn harness(
        facade: Arc<RecordingFacade>,
        socket_type: SocketType,
        initial_packet_id: u32,
        mtu: u32,
        max_flow_window: u32,
    ) -> (Sender, SenderCore) {
        let sender = Sender::new(facade);
        sender.configure_handshake(
            &HandshakeConfig {
                initial_packet_id: PacketId::from_raw(initial_packet_id),
                socket_type,
                max_flow_window,
            },
            true,
            mtu,
        );

        let mut core = sender.core_slot.lock().unwrap().take().unwrap();
        sender.set_state(SocketState::Connected);
        core.startup_init();
        (sender, core)
    }

    async fn drive_until_wait(core: &mut SenderCore) -> usize {
        for pass in 0..100 {
            match core.process_event().await {
                LoopFlow::Continue => {}
                LoopFlow::Wait => return pass,
                LoopFlow::Exit => panic!("event loop exited unexpectedly"),
            }
        }
        panic!("event loop did not become idle within 100 passes");
    }

    fn light_ack(last_packet_received: u32) -> Packet {
        Packet::new(PacketKind::Ack(AckPacket {
            ack_sequence: SequenceNumber::from_raw(1),
            last_packet_received: PacketId::from_raw(last_packet_received),
            avail_buffer_size: 0,
            full_info: None,
        }))
    }

    fn nak(loss_data: Vec<u32>) -> Packet {
        Packet::new(PacketKind::Nak(NakPacket { loss_data }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_send_is_cut_into_full_packets() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        let packets = facade.data_packets();
        assert_eq!(packets.len(), 3);
        for (n, packet) in packets.iter().enumerate() {
            assert_eq!(packet.packet_id, PacketId::from_raw(100 + n as u32));
            assert_eq!(packet.position, MessagePosition::Only);
            assert!(packet.is_ordered);
            assert_eq!(packet.message_number, SequenceNumber::from_raw(1));
            assert_eq!(packet.payload.len(), 1000);
        }

        assert_eq!(core.send_pkt_pend.len(), 3);
        assert!(core.msg_partial_send.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_datagram_send_preserves_message_boundaries() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Datagram, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xcd; 2500]), None);
        drive_until_wait(&mut core).await;

        let packets = facade.data_packets();
        assert_eq!(packets.len(), 3);
        let expected = [
            (100, MessagePosition::First, 1000),
            (101, MessagePosition::Middle, 1000),
            (102, MessagePosition::Last, 500),
        ];
        for (packet, &(id, position, len)) in packets.iter().zip(&expected) {
            assert_eq!(packet.packet_id, PacketId::from_raw(id));
            assert_eq!(packet.position, position);
            assert!(!packet.is_ordered);
            assert_eq!(packet.message_number, SequenceNumber::from_raw(1));
            assert_eq!(packet.payload.len(), len);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_datagram_single_fragment_is_tagged_only() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Datagram, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![1u8; 300]), None);
        sender.send_message(Bytes::from(vec![2u8; 400]), None);
        drive_until_wait(&mut core).await;

        let packets = facade.data_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].position, MessagePosition::Only);
        assert_eq!(packets[0].message_number, SequenceNumber::from_raw(1));
        assert_eq!(packets[1].position, MessagePosition::Only);
        assert_eq!(packets[1].message_number, SequenceNumber::from_raw(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_mode_tops_up_short_remainders_from_the_queue() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![1u8; 600]), None);
        sender.send_message(Bytes::from(vec![2u8; 600]), None);
        drive_until_wait(&mut core).await;

        // 1200 bytes of stream data make one full packet and one remainder
        let packets = facade.data_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload.len(), 1000);
        assert_eq!(packets[1].payload.len(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_mtu_fit_sends_one_packet_and_clears_the_slot() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![7u8; 1000]), None);
        drive_until_wait(&mut core).await;

        let packets = facade.data_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.len(), 1000);
        assert!(core.msg_partial_send.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_ack_retires_prefix_and_widens_flow_window() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(light_ack(102), Instant::now());
        drive_until_wait(&mut core).await;

        assert!(core.send_pkt_pend.is_empty());
        assert_eq!(core.flow_window_size, 19);
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(102));

        // replaying the same ACK must change nothing: the frontier is monotone
        sender.packet_received(light_ack(102), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(core.flow_window_size, 19);
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(102));
        assert!(facade.shutdowns().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_ack_applies_window_and_samples() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(
            Packet::new(PacketKind::Ack(AckPacket {
                ack_sequence: SequenceNumber::ZERO,
                last_packet_received: PacketId::from_raw(101),
                avail_buffer_size: 777,
                full_info: Some(FullAckInfo {
                    rtt_micros: 12_345,
                    packet_receive_rate: 1000,
                    estimated_link_capacity: 5000,
                }),
            })),
            Instant::now(),
        );
        drive_until_wait(&mut core).await;

        // the advertised buffer size replaces the flow window entirely
        assert_eq!(core.flow_window_size, 777);
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(101));
        assert_eq!(core.send_pkt_pend.keys().collect::<Vec<_>>(), vec![PacketId::from_raw(102)]);
        assert_eq!(*facade.rtt_samples.lock().unwrap(), vec![Duration::from_micros(12_345)]);
        assert_eq!(*facade.receive_rate_samples.lock().unwrap(), vec![(1000, 5000)]);

        // the matching sequence and the expired deadline produced an ACK2
        let ack2_count = facade.sent().iter()
            .filter(|packet| matches!(packet.kind, PacketKind::Ack2(_)))
            .count();
        assert_eq!(ack2_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack2_is_rate_limited_to_one_per_syn() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        let full_ack = |last: u32| {
            Packet::new(PacketKind::Ack(AckPacket {
                ack_sequence: SequenceNumber::ZERO,
                last_packet_received: PacketId::from_raw(last),
                avail_buffer_size: 100,
                full_info: Some(FullAckInfo {
                    rtt_micros: 10_000,
                    packet_receive_rate: 0,
                    estimated_link_capacity: 0,
                }),
            }))
        };

        let ack2_count = |facade: &RecordingFacade| {
            facade.sent().iter()
                .filter(|packet| matches!(packet.kind, PacketKind::Ack2(_)))
                .count()
        };

        sender.packet_received(full_ack(100), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(ack2_count(&facade), 1);

        // a second full ACK right away is inside the SYN deadline
        sender.packet_received(full_ack(101), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(ack2_count(&facade), 1);

        time::sleep(SYN).await;
        sender.packet_received(full_ack(102), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(ack2_count(&facade), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_resends_the_lost_packet() {
        let mut congestion = MockCongestionControl::new();
        congestion.expect_on_data_pkt_sent().return_const(());
        congestion.expect_on_nak()
            .withf(|lost| lost == [PacketId::from_raw(101)].as_slice())
            .times(1)
            .return_const(());
        let facade = RecordingFacade::with_congestion(Arc::new(congestion));
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;
        let original = facade.data_packets()[1].clone();

        sender.packet_received(nak(vec![101]), Instant::now());
        assert_eq!(core.process_event().await, LoopFlow::Continue);
        assert_eq!(core.send_state, SendState::ProcessDrop);
        assert!(core.send_loss_list.contains(PacketId::from_raw(101)));

        drive_until_wait(&mut core).await;

        let packets = facade.data_packets();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[3], original);
        assert!(core.send_loss_list.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_range_is_inclusive_of_both_ends() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(nak(vec![NakPacket::RANGE_START_BIT | 100, 102]), Instant::now());
        assert_eq!(core.process_event().await, LoopFlow::Continue);

        assert_eq!(
            core.send_loss_list.iter().collect::<Vec<_>>(),
            vec![PacketId::from_raw(100), PacketId::from_raw(101), PacketId::from_raw(102)],
        );
    }

    #[rstest]
    #[case::dangling_range_start(vec![NakPacket::RANGE_START_BIT | 101])]
    #[case::consecutive_range_starts(vec![NakPacket::RANGE_START_BIT | 100, NakPacket::RANGE_START_BIT | 101])]
    #[case::inverted_range(vec![NakPacket::RANGE_START_BIT | 102, 100])]
    #[case::loss_ahead_of_sent(vec![200])]
    #[case::range_end_ahead_of_sent(vec![NakPacket::RANGE_START_BIT | 101, 200])]
    #[tokio::test(start_paused = true)]
    async fn test_malformed_nak_requests_corrupted_shutdown(#[case] loss_data: Vec<u32>) {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(nak(loss_data), Instant::now());
        drive_until_wait(&mut core).await;

        let shutdowns = facade.shutdowns();
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(shutdowns[0].0, SocketState::Corrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_ahead_of_sent_requests_corrupted_shutdown() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(light_ack(200), Instant::now());
        drive_until_wait(&mut core).await;

        let shutdowns = facade.shutdowns();
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(shutdowns[0].0, SocketState::Corrupted);
        // nothing was retired by the bogus ACK
        assert_eq!(core.send_pkt_pend.len(), 3);
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dropped_not_resent() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Datagram, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 2500]), Some(Instant::now()));
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 3);

        // expiration recovery schedules a full resend, which the expiry
        //  scan then converts into a single drop request
        sender.reset_receive_timer();
        drive_until_wait(&mut core).await;
        core.shared.events.lock().unwrap().recent_exp_event = true;
        drive_until_wait(&mut core).await;

        let drops = facade.drop_requests();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].message_number, SequenceNumber::from_raw(1));
        assert_eq!(drops[0].first_packet_id, PacketId::from_raw(100));
        assert_eq!(drops[0].last_packet_id, PacketId::from_raw(102));

        // no retransmission happened, and all local state is gone
        assert_eq!(facade.data_packets().len(), 3);
        assert!(core.send_pkt_pend.is_empty());
        assert!(core.send_loss_list.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_scan_drops_only_the_expired_message() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Datagram, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![1u8; 1500]), Some(Instant::now()));
        sender.send_message(Bytes::from(vec![2u8; 500]), None);
        drive_until_wait(&mut core).await;
        core.send_loss_list.insert(PacketId::from_raw(100));

        assert!(core.process_send_expire().await);

        let drops = facade.drop_requests();
        assert_eq!(drops.len(), 1);
        assert_eq!(drops[0].message_number, SequenceNumber::from_raw(1));
        assert_eq!(drops[0].first_packet_id, PacketId::from_raw(100));
        assert_eq!(drops[0].last_packet_id, PacketId::from_raw(101));

        // the unexpired message is untouched
        assert_eq!(core.send_pkt_pend.keys().collect::<Vec<_>>(), vec![PacketId::from_raw(102)]);
        assert!(core.send_loss_list.is_empty());

        // a second scan finds nothing
        assert!(!core.process_send_expire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exp_timeout_requests_shutdown() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 500]), None);
        drive_until_wait(&mut core).await;

        time::sleep(Duration::from_secs(11)).await;
        core.exp_count = 17;
        core.process_exp_event().await;

        let shutdowns = facade.shutdowns();
        assert_eq!(shutdowns.len(), 1);
        assert_eq!(shutdowns[0].0, SocketState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exp_event_schedules_full_resend_storm() {
        let mut congestion = MockCongestionControl::new();
        congestion.expect_on_data_pkt_sent().return_const(());
        congestion.expect_on_timeout().times(1).return_const(());
        let facade = RecordingFacade::with_congestion(Arc::new(congestion));
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        core.exp_count = 2;
        core.process_exp_event().await;

        assert_eq!(
            core.send_loss_list.iter().collect::<Vec<_>>(),
            vec![PacketId::from_raw(100), PacketId::from_raw(101), PacketId::from_raw(102)],
        );
        assert_eq!(core.send_state, SendState::ProcessDrop);
        assert_eq!(core.exp_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exp_event_sends_keepalive_when_nothing_outstanding() {
        let facade = RecordingFacade::new();
        let (_sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        core.process_exp_event().await;

        let keepalives = facade.sent().iter()
            .filter(|packet| matches!(packet.kind, PacketKind::Keepalive))
            .count();
        assert_eq!(keepalives, 1);
        assert_eq!(core.exp_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_congestion_window_degenerates_to_waiting() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 500]), None);
        drive_until_wait(&mut core).await;

        sender.set_congestion_window(0);
        assert_eq!(core.reeval_send_state(), SendState::Waiting);

        sender.set_congestion_window(16);
        assert_eq!(core.reeval_send_state(), SendState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_flow_window_blocks_sending_until_acked() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 2);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        // two packets in flight exhaust the window of 2
        assert_eq!(facade.data_packets().len(), 2);
        assert_eq!(core.send_state, SendState::Waiting);

        sender.packet_received(light_ack(101), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_period_paces_transmission() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);
        sender.set_packet_send_period(Duration::from_millis(2));

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 1);
        assert_eq!(core.send_state, SendState::Sending);

        time::sleep(Duration::from_millis(2)).await;
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 2);

        time::sleep(Duration::from_millis(2)).await;
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_period_is_clamped_by_the_bandwidth_cap() {
        // 1 MB/s at MTU 1000 means at least 1 ms between packets
        let facade = RecordingFacade::with_max_bandwidth(1_000_000);
        let (sender, _core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.set_packet_send_period(Duration::from_micros(200));
        assert_eq!(sender.shared.pacing.send_period(), Duration::from_millis(1));

        sender.set_packet_send_period(Duration::from_millis(5));
        assert_eq!(sender.shared.pacing.send_period(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_warning_backs_off_the_send_period() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);
        sender.set_packet_send_period(Duration::from_millis(1));

        sender.packet_received(Packet::new(PacketKind::Congestion), Instant::now());
        drive_until_wait(&mut core).await;

        assert_eq!(sender.shared.pacing.send_period(), Duration::from_micros(1125));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_disconnect_emits_shutdown_packet() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.queue_disconnect();
        drive_until_wait(&mut core).await;

        let shutdown_packets = facade.sent().iter()
            .filter(|packet| matches!(packet.kind, PacketKind::Shutdown))
            .count();
        assert_eq!(shutdown_packets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_closed_keeps_serving_resends_but_takes_no_messages() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 500]), None);
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 1);

        sender.set_state(SocketState::HalfClosed);
        drive_until_wait(&mut core).await;
        assert_eq!(core.send_state, SendState::Shutdown);
        assert!(!core.exp_timer.is_active());

        // new messages are not accepted any more
        sender.send_message(Bytes::from(vec![0xcd; 500]), None);
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 1);

        // but a NAK still gets its packet resent
        sender.packet_received(nak(vec![100]), Instant::now());
        drive_until_wait(&mut core).await;
        assert_eq!(facade.data_packets().len(), 2);
        assert_eq!(facade.data_packets()[1].packet_id, PacketId::from_raw(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_running_socket_state_exits_the_loop() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.set_state(SocketState::Closed);
        assert_eq!(core.process_event().await, LoopFlow::Exit);
        assert_eq!(core.send_state, SendState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrap_around_send_and_ack() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 0x7fff_fffe, 10, 16);

        sender.send_message(Bytes::from(vec![0xab; 50]), None);
        drive_until_wait(&mut core).await;

        let ids = facade.data_packets().iter()
            .map(|packet| packet.packet_id.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![0x7fff_fffe, 0x7fff_ffff, 0, 1, 2]);

        sender.packet_received(light_ack(2), Instant::now());
        drive_until_wait(&mut core).await;
        assert!(core.send_pkt_pend.is_empty());
        assert!(core.send_loss_list.is_empty());
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_list_stays_subset_of_pending_after_partial_ack() {
        let facade = RecordingFacade::new();
        let (sender, mut core) = harness(facade.clone(), SocketType::Stream, 100, 1000, 16);

        sender.send_message(Bytes::from(vec![0xab; 3000]), None);
        drive_until_wait(&mut core).await;

        sender.packet_received(nak(vec![NakPacket::RANGE_START_BIT | 100, 102]), Instant::now());
        // the drop pass resends one packet and leaves the rest in the loss list
        drive_until_wait(&mut core).await;
        assert_eq!(
            core.send_loss_list.iter().collect::<Vec<_>>(),
            vec![PacketId::from_raw(101), PacketId::from_raw(102)],
        );

        sender.packet_received(light_ack(101), Instant::now());
        drive_until_wait(&mut core).await;

        for packet_id in core.send_loss_list.iter() {
            assert!(core.send_pkt_pend.get(packet_id).is_some());
        }
        assert_eq!(core.send_loss_list.iter().collect::<Vec<_>>(), vec![PacketId::from_raw(102)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_lifecycle_with_spawned_task() {
        async fn settle() {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
        }

        let facade = RecordingFacade::new();
        let sender = Sender::new(facade.clone());
        sender.configure_handshake(
            &HandshakeConfig {
                initial_packet_id: PacketId::from_raw(100),
                socket_type: SocketType::Stream,
                max_flow_window: 16,
            },
            true,
            1000,
        );

        sender.set_state(SocketState::Connected);
        sender.send_message(Bytes::from(vec![0xab; 500]), None);
        settle().await;
        assert_eq!(facade.data_packets().len(), 1);

        sender.packet_received(light_ack(100), Instant::now());
        settle().await;

        sender.set_state(SocketState::Closed);
        settle().await;

        // the loop exited and parked the machine state for a restart
        let slot = sender.core_slot.lock().unwrap();
        let core = slot.as_ref().expect("core should be parked after the loop exits");
        assert_eq!(core.send_state, SendState::Closed);
        assert!(core.send_pkt_pend.is_empty());
        assert_eq!(core.last_ack_packet_id, PacketId::from_raw(100));
    }
}

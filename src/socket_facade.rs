use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::packet::Packet;
use crate::packet_id::PacketId;

/// Lifecycle state of the owning socket. The sender only ever reads this;
///  it influences the socket's state exclusively through
///  [`SocketFacade::request_shutdown`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SocketState {
    Init,
    Connected,
    /// the local side has closed; the sender keeps answering resend
    ///  requests but accepts no new messages
    HalfClosed,
    Closed,
    /// shutdown requested because the peer violated the protocol
    Corrupted,
    /// shutdown requested because the peer went silent for too long
    Timeout,
}

impl SocketState {
    /// states in which the sender's event loop should be running
    pub fn is_running(self) -> bool {
        matches!(self, SocketState::Connected | SocketState::HalfClosed)
    }
}


/// Congestion control callbacks, plugged in by the socket. Implementations
///  are shared across threads and keep their state behind interior
///  mutability.
#[cfg_attr(test, automock)]
pub trait CongestionControl: Send + Sync + 'static {
    fn on_data_pkt_sent(&self, packet_id: PacketId);

    /// the acked frontier advanced to `packet_id`
    fn on_ack(&self, packet_id: PacketId);

    /// `lost` holds the ids freshly reported by a NAK, in report order
    fn on_nak(&self, lost: &[PacketId]);

    fn on_timeout(&self);
}

/// The do-nothing congestion control plug: no pacing, no window shaping.
pub struct NoCongestionControl;

impl CongestionControl for NoCongestionControl {
    fn on_data_pkt_sent(&self, _packet_id: PacketId) {}
    fn on_ack(&self, _packet_id: PacketId) {}
    fn on_nak(&self, _lost: &[PacketId]) {}
    fn on_timeout(&self) {}
}


/// The private contract between the sender and the socket that owns it.
///
/// This is a capability interface: the socket owns the sender, and the
///  sender holds the socket only through this trait, so it can never extend
///  the socket's lifetime. The socket stamps timestamp and destination id
///  onto packets handed to [`SocketFacade::send_packet`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketFacade: Send + Sync + 'static {
    async fn send_packet(&self, packet: Packet);

    fn congestion_control(&self) -> Arc<dyn CongestionControl>;

    /// configured bandwidth cap in bytes per second, 0 for unlimited
    fn max_bandwidth(&self) -> u64;

    /// feed an RTT sample from an ACK into the socket's RTT estimation
    fn apply_rtt_sample(&self, rtt: Duration);

    /// feed packet-receive-rate and estimated-link-capacity samples from a
    ///  full ACK into the socket's statistics
    fn apply_receive_rates(&self, packet_receive_rate: u32, estimated_link_capacity: u32);

    /// current RTT estimate and RTT variance
    fn rtt_info(&self) -> (Duration, Duration);

    /// ask the socket to shut the connection down; `reason` is one of the
    ///  terminal [`SocketState`] values
    fn request_shutdown(&self, reason: SocketState, message: String);
}

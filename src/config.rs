use std::time::Duration;

use crate::packet_id::PacketId;

/// The protocol's synchronisation interval: the coarse tick used to
///  rate-limit ACK2 emission and as a floor contribution to the expiration
///  timer.
pub const SYN: Duration = Duration::from_millis(10);

/// Whether the connection transports a byte stream or preserves message
///  boundaries. In stream mode, fragments of consecutive messages may share
///  packets; in datagram mode every packet belongs to exactly one message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// The negotiated outcome of the connection handshake, as far as the sender
///  cares about it. Handshake negotiation itself happens in the connection
///  layer.
#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// the id the first data packet will carry (when the sequence is reset)
    pub initial_packet_id: PacketId,
    pub socket_type: SocketType,
    /// peer-advertised maximum number of unacknowledged packets in flight
    pub max_flow_window: u32,
}

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::packet_id::{PacketId, SequenceNumber};

/// One UDT packet, data or control. All packets share a four-word header;
///  the most significant bit of the first word separates data packets (0)
///  from control packets (1).
///
/// `timestamp` (microseconds since connection start) and `dest_socket_id`
///  are owned by the connection layer: the sender leaves them zero and the
///  socket stamps them on the wire path.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub timestamp: u32,
    pub dest_socket_id: u32,
    pub kind: PacketKind,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketKind {
    Data(DataPacket),
    Ack(AckPacket),
    Ack2(SequenceNumber),
    Nak(NakPacket),
    Congestion,
    Shutdown,
    Keepalive,
    MessageDrop(MessageDropPacket),
}

/// wire tags for control packets, carried in bits [1:15] of the first word
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
enum ControlType {
    Keepalive = 0x1,
    Ack = 0x2,
    Nak = 0x3,
    Congestion = 0x4,
    Shutdown = 0x5,
    Ack2 = 0x6,
    MessageDrop = 0x7,
}

const CONTROL_BIT: u32 = 0x8000_0000;

impl Packet {
    pub fn new(kind: PacketKind) -> Packet {
        Packet {
            timestamp: 0,
            dest_socket_id: 0,
            kind,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.kind {
            PacketKind::Data(data) => {
                buf.put_u32(data.packet_id.to_raw());
                buf.put_u32(data.flags_word());
                buf.put_u32(self.timestamp);
                buf.put_u32(self.dest_socket_id);
                buf.put_slice(&data.payload);
            }
            control => {
                let (control_type, additional_info) = match control {
                    PacketKind::Ack(ack) => (ControlType::Ack, ack.ack_sequence.to_raw()),
                    PacketKind::Ack2(ack_sequence) => (ControlType::Ack2, ack_sequence.to_raw()),
                    PacketKind::Nak(_) => (ControlType::Nak, 0),
                    PacketKind::Congestion => (ControlType::Congestion, 0),
                    PacketKind::Shutdown => (ControlType::Shutdown, 0),
                    PacketKind::Keepalive => (ControlType::Keepalive, 0),
                    PacketKind::MessageDrop(drop) => (ControlType::MessageDrop, drop.message_number.to_raw()),
                    PacketKind::Data(_) => unreachable!(),
                };
                buf.put_u32(CONTROL_BIT | ((u16::from(control_type) as u32) << 16));
                buf.put_u32(additional_info);
                buf.put_u32(self.timestamp);
                buf.put_u32(self.dest_socket_id);

                match control {
                    PacketKind::Ack(ack) => {
                        buf.put_u32(ack.last_packet_received.to_raw());
                        buf.put_u32(ack.avail_buffer_size);
                        if let Some(info) = &ack.full_info {
                            buf.put_u32(info.rtt_micros);
                            buf.put_u32(info.packet_receive_rate);
                            buf.put_u32(info.estimated_link_capacity);
                        }
                    }
                    PacketKind::Nak(nak) => {
                        for entry in &nak.loss_data {
                            buf.put_u32(*entry);
                        }
                    }
                    PacketKind::MessageDrop(drop) => {
                        buf.put_u32(drop.first_packet_id.to_raw());
                        buf.put_u32(drop.last_packet_id.to_raw());
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let word0 = buf.try_get_u32()?;

        if word0 & CONTROL_BIT == 0 {
            let packet_id = PacketId::from_raw(word0);
            let word1 = buf.try_get_u32()?;
            let timestamp = buf.try_get_u32()?;
            let dest_socket_id = buf.try_get_u32()?;
            let payload = buf.copy_to_bytes(buf.remaining());

            return Ok(Packet {
                timestamp,
                dest_socket_id,
                kind: PacketKind::Data(DataPacket {
                    packet_id,
                    position: MessagePosition::from_bits(word1 >> 30),
                    is_ordered: word1 & DataPacket::ORDERED_BIT != 0,
                    message_number: SequenceNumber::from_raw(word1 & DataPacket::MESSAGE_NUMBER_MASK),
                    payload,
                }),
            });
        }

        let raw_type = ((word0 >> 16) & 0x7fff) as u16;
        let control_type = ControlType::try_from(raw_type)
            .map_err(|_| anyhow!("unsupported control packet type {:#x}", raw_type))?;
        let additional_info = buf.try_get_u32()?;
        let timestamp = buf.try_get_u32()?;
        let dest_socket_id = buf.try_get_u32()?;

        let kind = match control_type {
            ControlType::Ack => {
                let last_packet_received = PacketId::from_raw(buf.try_get_u32()?);
                let avail_buffer_size = buf.try_get_u32()?;
                let full_info = if buf.has_remaining() {
                    Some(FullAckInfo {
                        rtt_micros: buf.try_get_u32()?,
                        packet_receive_rate: buf.try_get_u32()?,
                        estimated_link_capacity: buf.try_get_u32()?,
                    })
                }
                else {
                    None
                };
                PacketKind::Ack(AckPacket {
                    ack_sequence: SequenceNumber::from_raw(additional_info),
                    last_packet_received,
                    avail_buffer_size,
                    full_info,
                })
            }
            ControlType::Ack2 => PacketKind::Ack2(SequenceNumber::from_raw(additional_info)),
            ControlType::Nak => {
                let mut loss_data = Vec::with_capacity(buf.remaining() / size_of::<u32>());
                while buf.has_remaining() {
                    loss_data.push(buf.try_get_u32()?);
                }
                PacketKind::Nak(NakPacket { loss_data })
            }
            ControlType::Congestion => PacketKind::Congestion,
            ControlType::Shutdown => PacketKind::Shutdown,
            ControlType::Keepalive => PacketKind::Keepalive,
            ControlType::MessageDrop => PacketKind::MessageDrop(MessageDropPacket {
                message_number: SequenceNumber::from_raw(additional_info),
                first_packet_id: PacketId::from_raw(buf.try_get_u32()?),
                last_packet_id: PacketId::from_raw(buf.try_get_u32()?),
            }),
        };

        if buf.has_remaining() {
            bail!("{} unexpected trailing bytes after a {:?} packet", buf.remaining(), control_type);
        }

        Ok(Packet {
            timestamp,
            dest_socket_id,
            kind,
        })
    }
}

impl From<DataPacket> for Packet {
    fn from(data: DataPacket) -> Self {
        Packet::new(PacketKind::Data(data))
    }
}


/// Where a data packet sits within its message. `Only` marks a
///  single-packet message; stream-mode packets always carry `Only` since
///  message boundaries do not survive transmission there.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessagePosition {
    Middle,
    First,
    Last,
    Only,
}

impl MessagePosition {
    fn bits(self) -> u32 {
        match self {
            MessagePosition::Middle => 0b00,
            MessagePosition::First => 0b10,
            MessagePosition::Last => 0b01,
            MessagePosition::Only => 0b11,
        }
    }

    fn from_bits(bits: u32) -> MessagePosition {
        match bits & 0b11 {
            0b00 => MessagePosition::Middle,
            0b10 => MessagePosition::First,
            0b01 => MessagePosition::Last,
            _ => MessagePosition::Only,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DataPacket {
    pub packet_id: PacketId,
    pub position: MessagePosition,
    pub is_ordered: bool,
    pub message_number: SequenceNumber,
    pub payload: Bytes,
}

impl DataPacket {
    const ORDERED_BIT: u32 = 1 << 29;
    const MESSAGE_NUMBER_MASK: u32 = 0x1fff_ffff;

    fn flags_word(&self) -> u32 {
        (self.position.bits() << 30)
            | if self.is_ordered { Self::ORDERED_BIT } else { 0 }
            | (self.message_number.to_raw() & Self::MESSAGE_NUMBER_MASK)
    }
}


#[derive(Clone, Eq, PartialEq, Debug)]
pub struct AckPacket {
    pub ack_sequence: SequenceNumber,
    pub last_packet_received: PacketId,
    pub avail_buffer_size: u32,
    /// present on a Full ACK, absent on a Light ACK
    pub full_info: Option<FullAckInfo>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct FullAckInfo {
    pub rtt_micros: u32,
    pub packet_receive_rate: u32,
    pub estimated_link_capacity: u32,
}

impl AckPacket {
    pub fn is_full(&self) -> bool {
        self.full_info.is_some()
    }
}


/// A loss report. The loss list is kept in its raw wire form: a sequence of
///  32-bit entries where a set high bit starts a compressed range and the
///  following entry (high bit clear) ends it, both ends inclusive.
///
/// The structural invariants of that encoding are checked where the list is
///  ingested, not here - a malformed list from the peer must be answered
///  with a connection shutdown rather than a local decode error.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct NakPacket {
    pub loss_data: Vec<u32>,
}

impl NakPacket {
    pub const RANGE_START_BIT: u32 = 0x8000_0000;

    pub fn push_single(&mut self, packet_id: PacketId) {
        self.loss_data.push(packet_id.to_raw());
    }

    pub fn push_range(&mut self, first: PacketId, last: PacketId) {
        self.loss_data.push(first.to_raw() | Self::RANGE_START_BIT);
        self.loss_data.push(last.to_raw());
    }
}


#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MessageDropPacket {
    pub message_number: SequenceNumber,
    pub first_packet_id: PacketId,
    pub last_packet_id: PacketId,
}

//! Sender half of a UDT-style reliable, message-oriented transport on top
//!  of UDP.
//!
//! A connection's outgoing side is a state machine that cuts application
//!  messages into sequenced data packets, paces them against a
//!  congestion-controlled send period and the peer's advertised flow
//!  window, listens to acknowledgement (ACK) and loss (NAK) feedback,
//!  retransmits what got lost, drops messages whose expiry passed before
//!  they were fully acknowledged, and keeps the connection alive with
//!  keepalives and timer-driven expiration recovery.
//!
//! The crate deliberately contains *only* that sender: UDP multiplexing,
//!  socket binding, the receiving side (which generates the ACKs and NAKs),
//!  handshake negotiation and the congestion control algorithm itself are
//!  collaborators behind the [`socket_facade::SocketFacade`] and
//!  [`socket_facade::CongestionControl`] traits.
//!
//! ## Wire format
//!
//! All numbers are in network byte order. Every packet starts with four
//!  32-bit words; the most significant bit of word 0 separates data from
//!  control packets.
//!
//! Data packet:
//! ```ascii
//! word 0: [0] = 0, [1:31] packet id (31-bit wrap-around sequence number)
//! word 1: [0:1] message position (00 middle, 10 first, 01 last, 11 only),
//!         [2] ordered flag, [3:31] message number
//! word 2: timestamp (microseconds since connection start, may be zero)
//! word 3: destination socket id
//! *:      payload
//! ```
//!
//! Control packet:
//! ```ascii
//! word 0: [0] = 1, [1:15] packet type, [16:31] reserved
//! word 1: additional info (e.g. the ACK sequence number)
//! word 2: timestamp
//! word 3: destination socket id
//! *:      type-specific body
//! ```
//!
//! An ACK body carries the last received packet id and the advertised
//!  receive buffer size; a *full* ACK additionally carries an RTT sample,
//!  the packet receive rate and the estimated link capacity (a *light* ACK
//!  ends early, which is also how the decoder tells them apart). A NAK
//!  body is a list of 32-bit entries where a set high bit opens an
//!  inclusive packet-id range and the next entry closes it. A message-drop
//!  request names a message number and the first and last packet id it
//!  occupied.
//!
//! ## Concurrency model
//!
//! Each sender runs one event-loop task. The loop owns all mutable
//!  transport state; other threads communicate exclusively through a small
//!  mutex-protected event block (edge flags plus two FIFOs) and lock-free
//!  pacing atomics, and wake the loop through a [`tokio::sync::Notify`].
//!  The two high-precision timers (SND for pacing, EXP for peer liveness)
//!  are deadlines the loop sleeps on and converts into edge flags, which
//!  keeps every timing path deterministic under a paused tokio runtime.

pub mod config;
pub mod packet;
pub mod packet_id;
pub mod send_loop;
pub mod socket_facade;

mod send_buffer;
mod timers;

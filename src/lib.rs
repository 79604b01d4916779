//! Reliable message transport over UDP for a virtual world simulator.
//!
//! Peers (viewers or other simulators) talk over *circuits*: per-peer sessions with their own
//!  sequence numbers, acknowledgements and retransmission. A datagram looks like this:
//!
//! ```ascii
//! 0:  flags (u8): RELIABLE 0x01, ZERO_CODED 0x10, RESENT 0x20, ACKS_APPENDED 0x40
//! 1:  sequence number (u32 BE)
//! 5:  extra header length L (u8)
//! 6:  extra header (L bytes, ignored)
//! *   message number (1, 2 or 4 bytes depending on the message's frequency)
//! *   message body (little-endian fields)
//! *   appended acks (N x u32 BE), only if ACKS_APPENDED is set
//! *   N (u8), only if ACKS_APPENDED is set
//! ```
//!
//! If ZERO_CODED is set, the message number and body are run-length encoded: a zero byte is
//!  followed by the number of zeros it stands for. Appended acks are never zero-coded.
//!
//! [end_point::EndPoint] is the entry point. Messages are typed (see [messages]) and decoded by
//!  a [registry::MessageTypeRegistry] before they are routed to application handlers by a
//!  [dispatch::DispatchRouter].

pub mod buffers;
pub mod circuit;
pub mod circuit_events;
pub mod config;
pub mod dedup_window;
pub mod dispatch;
pub mod end_point;
pub mod error;
pub mod event_queue;
pub mod message_type;
pub mod messages;
pub mod packet;
pub mod packet_header;
pub mod registry;
pub mod send_pipeline;
pub mod sequence_number;
pub mod structured;

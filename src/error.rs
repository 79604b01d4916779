use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::message_type::MessageTypeId;
use crate::sequence_number::SequenceNumber;

/// Anything that can go wrong while taking a datagram or a message body apart. All of these
///  mean that the bytes on the wire do not match the protocol, and the datagram is dropped
///  without being acknowledged.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid value {value} for {field}")]
    InvalidEnumValue { field: &'static str, value: u64 },

    #[error("datagram shorter than the fixed packet header")]
    ShortHeader,

    #[error("appended ack count {count} does not fit into a datagram of {len} bytes")]
    InvalidAckCount { count: usize, len: usize },

    #[error("zero-coded run is missing its repeat count")]
    TruncatedZeroRun,

    #[error("zero-decoded body exceeds the limit of {0} bytes")]
    ZeroDecodedTooLarge(usize),
}

/// The error taxonomy of the transport layer. None of these take down the receiving process:
///  everything except [TransportError::RetryExhausted] is confined to a single datagram or
///  message, and `RetryExhausted` is handled by closing the affected circuit.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] DecodeError),

    #[error("unknown message type {0:?}")]
    UnknownMessageType(MessageTypeId),

    #[error("message type {message_type:?} violates the trust level of circuit {circuit:?}")]
    UntrustedViolation { message_type: MessageTypeId, circuit: SocketAddr },

    #[error("packet {sequence} to {circuit:?} was not acknowledged after {attempts} attempts")]
    RetryExhausted { circuit: SocketAddr, sequence: SequenceNumber, attempts: u32 },

    #[error("handler for {message_type:?} failed: {reason}")]
    HandlerFault { message_type: MessageTypeId, reason: String },

    #[error("no circuit for {0:?}")]
    UnknownCircuit(SocketAddr),

    #[error("circuit {0:?} is closed")]
    CircuitClosed(SocketAddr),

    #[error("message of {len} bytes exceeds the maximum datagram size of {max}")]
    OversizedMessage { len: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

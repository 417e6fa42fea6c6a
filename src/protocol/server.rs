//! Server-to-client messages.
//!
//! All struct fields here mirror the actual message sent to the client.
//! Encoding goes through [`WriteBuffer`] so the declared frame length is
//! always exact.

use bytes::{BufMut, Bytes};

use super::{TypeId, ext::BufMutExt, header};
use crate::{buffer::WriteBuffer, caps::Capability};

/// A type which can be encoded into a server message frame.
pub trait ServerProtocol {
    /// message type
    const MSGTYPE: u8;

    /// write the main body of the message
    fn encode(self, buf: &mut WriteBuffer);
}

/// Write a complete server frame to `buf`.
pub fn write<M: ServerProtocol>(msg: M, buf: &mut WriteBuffer) {
    buf.new_message(M::MSGTYPE);
    msg.encode(buf);
    buf.end_message();
}

fn put_capability_headers(buf: &mut WriteBuffer, capabilities: Capability) {
    buf.put_u16(1);
    buf.put_u16(header::SERVER_CAPABILITIES);
    buf.put_u32(8);
    buf.put_u64(capabilities.bits());
}

/// Authentication exchange frames; all share the `R` tag with a status
/// discriminant.
#[derive(Debug)]
pub enum Authentication<'a> {
    Ok,
    Sasl { methods: &'a [&'a str] },
    SaslContinue { data: &'a [u8] },
    SaslFinal { data: &'a [u8] },
}

impl ServerProtocol for Authentication<'_> {
    const MSGTYPE: u8 = b'R';

    fn encode(self, buf: &mut WriteBuffer) {
        match self {
            Authentication::Ok => buf.put_u32(0),
            Authentication::Sasl { methods } => {
                buf.put_u32(10);
                buf.put_u32(methods.len() as u32);
                for method in methods {
                    buf.put_lp_str(method);
                }
            }
            Authentication::SaslContinue { data } => {
                buf.put_u32(11);
                buf.put_lp_bytes(data);
            }
            Authentication::SaslFinal { data } => {
                buf.put_u32(12);
                buf.put_lp_bytes(data);
            }
        }
    }
}

/// Cancellation key data; this server does not hand out real keys.
#[derive(Debug)]
pub struct ServerKeyData {
    pub data: [u8; 32],
}

impl ServerProtocol for ServerKeyData {
    const MSGTYPE: u8 = b'K';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_slice(&self.data);
    }
}

/// A run-time parameter report sent during startup.
#[derive(Debug)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a [u8],
}

impl ServerProtocol for ParameterStatus<'_> {
    const MSGTYPE: u8 = b'S';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_lp_str(self.name);
        buf.put_lp_bytes(self.value);
    }
}

/// Sent whenever the server is ready for the next command cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// `I` idle, `T` in transaction, `E` in failed transaction.
    pub tx_status: u8,
}

impl ServerProtocol for ReadyForQuery {
    const MSGTYPE: u8 = b'Z';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_u16(0);
        buf.put_u8(self.tx_status);
    }
}

/// Type description of a compiled query.
#[derive(Debug)]
pub struct Description<'a> {
    pub capabilities: Capability,
    pub result_cardinality: u8,
    pub in_type_id: TypeId,
    pub in_type_data: &'a [u8],
    pub out_type_id: TypeId,
    pub out_type_data: &'a [u8],
    /// Legacy protocols omit the descriptor blobs from `ParseComplete`.
    pub include_type_data: bool,
}

impl Description<'_> {
    fn encode_body(self, buf: &mut WriteBuffer) {
        put_capability_headers(buf, self.capabilities);
        buf.put_u8(self.result_cardinality);
        buf.put_slice(self.in_type_id.as_bytes());
        if self.include_type_data {
            buf.put_lp_bytes(self.in_type_data);
        }
        buf.put_slice(self.out_type_id.as_bytes());
        if self.include_type_data {
            buf.put_lp_bytes(self.out_type_data);
        }
    }
}

/// Answer to `Parse`.
#[derive(Debug)]
pub struct ParseComplete<'a>(pub Description<'a>);

impl ServerProtocol for ParseComplete<'_> {
    const MSGTYPE: u8 = b'1';

    fn encode(self, buf: &mut WriteBuffer) {
        self.0.encode_body(buf);
    }
}

/// Full type description, sent for describes and optimistic mismatches.
#[derive(Debug)]
pub struct CommandDataDescription<'a>(pub Description<'a>);

impl ServerProtocol for CommandDataDescription<'_> {
    const MSGTYPE: u8 = b'T';

    fn encode(self, buf: &mut WriteBuffer) {
        self.0.encode_body(buf);
    }
}

/// A block of result data.
#[derive(Debug)]
pub struct Data<'a> {
    pub blocks: &'a [Bytes],
}

impl ServerProtocol for Data<'_> {
    const MSGTYPE: u8 = b'D';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_u16(self.blocks.len() as u16);
        for block in self.blocks {
            buf.put_lp_bytes(block);
        }
    }
}

/// Command completed successfully.
#[derive(Debug)]
pub struct CommandComplete<'a> {
    pub capabilities: Capability,
    pub status: &'a [u8],
}

impl ServerProtocol for CommandComplete<'_> {
    const MSGTYPE: u8 = b'C';

    fn encode(self, buf: &mut WriteBuffer) {
        put_capability_headers(buf, self.capabilities);
        buf.put_lp_bytes(self.status);
    }
}

pub const SEVERITY_ERROR: u8 = 120;
pub const SEVERITY_WARNING: u8 = 60;

/// Command failed.
#[derive(Debug)]
pub struct ErrorResponse<'a> {
    pub severity: u8,
    pub code: u32,
    pub message: &'a str,
}

impl ServerProtocol for ErrorResponse<'_> {
    const MSGTYPE: u8 = b'E';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_u8(self.severity);
        buf.put_u32(self.code);
        buf.put_lp_str(self.message);
        // no attributes
        buf.put_u16(0);
    }
}

/// Server log message the client should surface.
#[derive(Debug)]
pub struct LogMessage<'a> {
    pub severity: u8,
    pub code: u32,
    pub text: &'a str,
}

impl ServerProtocol for LogMessage<'_> {
    const MSGTYPE: u8 = b'L';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_u8(self.severity);
        buf.put_u32(self.code);
        buf.put_lp_str(self.text);
        buf.put_u16(0);
    }
}

/// Announce the protocol version the server will actually speak.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ServerProtocol for NegotiateProtocolVersion {
    const MSGTYPE: u8 = b'v';

    fn encode(self, buf: &mut WriteBuffer) {
        buf.put_u16(self.major);
        buf.put_u16(self.minor);
        // no unsupported extensions are echoed back
        buf.put_u16(0);
    }
}

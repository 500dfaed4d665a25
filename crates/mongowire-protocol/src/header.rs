//! Message header and opcodes

use std::fmt;

use bytes::{Buf, BufMut};
use mongowire_common::{ParsingReason, ProtocolParsingError, Result};

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 16;

/// Largest message a server will send (`maxMessageSizeBytes`)
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// MongoDB wire protocol opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Msg = 2013,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Update => "OP_UPDATE",
            OpCode::Insert => "OP_INSERT",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::Delete => "OP_DELETE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
            OpCode::Msg => "OP_MSG",
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = ProtocolParsingError;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(OpCode::Reply),
            2001 => Ok(OpCode::Update),
            2002 => Ok(OpCode::Insert),
            2004 => Ok(OpCode::Query),
            2005 => Ok(OpCode::GetMore),
            2006 => Ok(OpCode::Delete),
            2007 => Ok(OpCode::KillCursors),
            2013 => Ok(OpCode::Msg),
            _ => Err(ProtocolParsingError::new(ParsingReason::UnsupportedOpCode)),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total size of header and body
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Serialize the header as four little-endian int32 fields
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code as i32);
    }

    /// Parse a header from the front of `buf`, consuming 16 bytes.
    ///
    /// The declared length must lie within `HEADER_SIZE..=MAX_MESSAGE_SIZE`.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtocolParsingError::new(ParsingReason::MissingDocumentBody).into());
        }

        let message_length = buf.get_i32_le();
        let request_id = buf.get_i32_le();
        let response_to = buf.get_i32_le();
        let op_code = OpCode::try_from(buf.get_i32_le())?;

        let length_ok = usize::try_from(message_length)
            .map_or(false, |len| (HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&len));
        if !length_ok {
            return Err(ProtocolParsingError::new(ParsingReason::UnexpectedValue).into());
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Number of body bytes following the header
    #[allow(clippy::cast_sign_loss)]
    pub fn body_length(&self) -> usize {
        (self.message_length as usize).saturating_sub(HEADER_SIZE)
    }
}

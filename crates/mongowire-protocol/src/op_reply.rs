//! OP_REPLY

use bson::Document;
use bytes::{BufMut, BytesMut};
use mongowire_common::{ParsingReason, ProtocolParsingError, Result};

use crate::flags::ReplyFlags;
use crate::header::OpCode;
use crate::message::WireMessage;
use crate::wire::{get_documents, get_i32, get_i64, get_u32, put_document};

/// A legacy reply to OP_QUERY or OP_GET_MORE
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    /// A reply carrying `documents`, numbered consistently
    pub fn new(cursor_id: i64, starting_from: i32, documents: Vec<Document>) -> Self {
        Self {
            flags: ReplyFlags::empty(),
            cursor_id,
            starting_from,
            number_returned: i32::try_from(documents.len()).unwrap_or(i32::MAX),
            documents,
        }
    }

    pub fn cursor_not_found(&self) -> bool {
        self.flags.contains(ReplyFlags::CURSOR_NOT_FOUND)
    }

    pub fn query_failure(&self) -> bool {
        self.flags.contains(ReplyFlags::QUERY_FAILURE)
    }
}

impl WireMessage for OpReply {
    const OP_CODE: OpCode = OpCode::Reply;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32_le(self.flags.bits());
        buf.put_i64_le(self.cursor_id);
        buf.put_i32_le(self.starting_from);
        buf.put_i32_le(self.number_returned);
        for document in &self.documents {
            put_document(buf, document)?;
        }
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        let flags = ReplyFlags::from_bits(get_u32(&mut body)?);
        let cursor_id = get_i64(&mut body)?;
        let starting_from = get_i32(&mut body)?;
        let number_returned = get_i32(&mut body)?;
        let documents = get_documents(&mut body)?;

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(ProtocolParsingError::new(ParsingReason::UnexpectedValue).into());
        }

        Ok(Self {
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }
}

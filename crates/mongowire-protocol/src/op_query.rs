//! OP_QUERY

use bson::Document;
use bytes::{BufMut, BytesMut};
use mongowire_common::Result;

use crate::flags::QueryFlags;
use crate::header::OpCode;
use crate::message::{ensure_consumed, WireMessage};
use crate::wire::{get_cstring, get_document, get_i32, get_u32, put_cstring, put_document};

/// A legacy query, also used for commands against `<db>.$cmd`
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: QueryFlags,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// A single-document command query against `<database>.$cmd`
    pub fn command(database: &str, command: Document) -> Self {
        Self {
            flags: QueryFlags::empty(),
            full_collection_name: format!("{database}.$cmd"),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            return_fields_selector: None,
        }
    }
}

impl WireMessage for OpQuery {
    const OP_CODE: OpCode = OpCode::Query;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32_le(self.flags.bits());
        put_cstring(buf, &self.full_collection_name)?;
        buf.put_i32_le(self.number_to_skip);
        buf.put_i32_le(self.number_to_return);
        put_document(buf, &self.query)?;
        if let Some(selector) = &self.return_fields_selector {
            put_document(buf, selector)?;
        }
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        let flags = QueryFlags::from_bits(get_u32(&mut body)?);
        let full_collection_name = get_cstring(&mut body)?;
        let number_to_skip = get_i32(&mut body)?;
        let number_to_return = get_i32(&mut body)?;
        let query = get_document(&mut body)?;
        let return_fields_selector = if body.is_empty() {
            None
        } else {
            Some(get_document(&mut body)?)
        };
        ensure_consumed(body)?;

        Ok(Self {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            return_fields_selector,
        })
    }
}

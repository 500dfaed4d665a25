//! Legacy write and cursor opcodes

use bson::Document;
use bytes::{BufMut, BytesMut};
use mongowire_common::{
    ParsingReason, ProtocolParsingError, ProtocolSerializationError, Result, SerializationReason,
};

use crate::flags::{DeleteFlags, InsertFlags, UpdateFlags};
use crate::header::OpCode;
use crate::message::{ensure_consumed, WireMessage};
use crate::wire::{get_cstring, get_document, get_documents, get_i32, get_i64, get_u32, put_cstring, put_document};

/// Reserved int32 that prefixes several legacy bodies
const ZERO: i32 = 0;

fn get_reserved(body: &mut &[u8]) -> Result<()> {
    if get_i32(body)? == ZERO {
        Ok(())
    } else {
        Err(ProtocolParsingError::new(ParsingReason::UnexpectedValue).into())
    }
}

/// `int32 0, cstring fullCollectionName, int32 flags, document selector, document update`
#[derive(Debug, Clone, PartialEq)]
pub struct OpUpdate {
    pub full_collection_name: String,
    pub flags: UpdateFlags,
    pub selector: Document,
    pub update: Document,
}

impl WireMessage for OpUpdate {
    const OP_CODE: OpCode = OpCode::Update;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32_le(ZERO);
        put_cstring(buf, &self.full_collection_name)?;
        buf.put_u32_le(self.flags.bits());
        put_document(buf, &self.selector)?;
        put_document(buf, &self.update)
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        get_reserved(&mut body)?;
        let full_collection_name = get_cstring(&mut body)?;
        let flags = UpdateFlags::from_bits(get_u32(&mut body)?);
        let selector = get_document(&mut body)?;
        let update = get_document(&mut body)?;
        ensure_consumed(body)?;

        Ok(Self {
            full_collection_name,
            flags,
            selector,
            update,
        })
    }
}

/// `int32 flags, cstring fullCollectionName, document* documents`
#[derive(Debug, Clone, PartialEq)]
pub struct OpInsert {
    pub flags: InsertFlags,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl WireMessage for OpInsert {
    const OP_CODE: OpCode = OpCode::Insert;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32_le(self.flags.bits());
        put_cstring(buf, &self.full_collection_name)?;
        for document in &self.documents {
            put_document(buf, document)?;
        }
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        let flags = InsertFlags::from_bits(get_u32(&mut body)?);
        let full_collection_name = get_cstring(&mut body)?;
        let documents = get_documents(&mut body)?;

        Ok(Self {
            flags,
            full_collection_name,
            documents,
        })
    }
}

/// `int32 0, cstring fullCollectionName, int32 flags, document selector`
#[derive(Debug, Clone, PartialEq)]
pub struct OpDelete {
    pub full_collection_name: String,
    pub flags: DeleteFlags,
    pub selector: Document,
}

impl WireMessage for OpDelete {
    const OP_CODE: OpCode = OpCode::Delete;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32_le(ZERO);
        put_cstring(buf, &self.full_collection_name)?;
        buf.put_u32_le(self.flags.bits());
        put_document(buf, &self.selector)
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        get_reserved(&mut body)?;
        let full_collection_name = get_cstring(&mut body)?;
        let flags = DeleteFlags::from_bits(get_u32(&mut body)?);
        let selector = get_document(&mut body)?;
        ensure_consumed(body)?;

        Ok(Self {
            full_collection_name,
            flags,
            selector,
        })
    }
}

/// `int32 0, cstring fullCollectionName, int32 numberToReturn, int64 cursorId`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpGetMore {
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl WireMessage for OpGetMore {
    const OP_CODE: OpCode = OpCode::GetMore;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32_le(ZERO);
        put_cstring(buf, &self.full_collection_name)?;
        buf.put_i32_le(self.number_to_return);
        buf.put_i64_le(self.cursor_id);
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        get_reserved(&mut body)?;
        let full_collection_name = get_cstring(&mut body)?;
        let number_to_return = get_i32(&mut body)?;
        let cursor_id = get_i64(&mut body)?;
        ensure_consumed(body)?;

        Ok(Self {
            full_collection_name,
            number_to_return,
            cursor_id,
        })
    }
}

/// `int32 0, int32 numberOfCursorIds, int64* cursorIds`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpKillCursors {
    pub cursor_ids: Vec<i64>,
}

impl WireMessage for OpKillCursors {
    const OP_CODE: OpCode = OpCode::KillCursors;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_i32_le(ZERO);
        let count = i32::try_from(self.cursor_ids.len())
            .map_err(|_| ProtocolSerializationError::new(SerializationReason::CommandSizeTooLarge))?;
        buf.put_i32_le(count);
        for id in &self.cursor_ids {
            buf.put_i64_le(*id);
        }
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        get_reserved(&mut body)?;
        let count = usize::try_from(get_i32(&mut body)?)
            .map_err(|_| ProtocolParsingError::new(ParsingReason::UnexpectedValue))?;

        // Bound the allocation by what the body can actually hold
        let mut cursor_ids = Vec::with_capacity(count.min(body.len() / 8));
        for _ in 0..count {
            cursor_ids.push(get_i64(&mut body)?);
        }
        ensure_consumed(body)?;

        Ok(Self { cursor_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use bson::doc;

    #[test]
    fn test_get_more_example() {
        let get_more = OpGetMore {
            full_collection_name: "db.coll".into(),
            number_to_return: 100,
            cursor_id: 42,
        };

        let encoded = get_more.encode(12, 0).unwrap();
        let body = &encoded[HEADER_SIZE..];
        assert_eq!(&body[0..4], &[0, 0, 0, 0]);
        assert_eq!(&body[4..12], b"db.coll\0");
        assert_eq!(&body[12..16], &100i32.to_le_bytes());
        assert_eq!(&body[16..24], &42i64.to_le_bytes());

        let decoded = OpGetMore::decode_body(body).unwrap();
        assert_eq!(decoded.cursor_id, 42);
        assert_eq!(decoded.full_collection_name, "db.coll");
        assert_eq!(decoded.number_to_return, 100);
    }

    #[test]
    fn test_update_field_order() {
        let update = OpUpdate {
            full_collection_name: "db.c".into(),
            flags: UpdateFlags::UPSERT | UpdateFlags::MULTI_UPDATE,
            selector: doc! { "a": 1 },
            update: doc! { "$set": { "b": 2 } },
        };

        let encoded = update.encode(1, 0).unwrap();
        let body = &encoded[HEADER_SIZE..];
        assert_eq!(&body[0..4], &[0, 0, 0, 0]);
        assert_eq!(&body[4..9], b"db.c\0");
        assert_eq!(&body[9..13], &3u32.to_le_bytes());
        assert_eq!(OpUpdate::decode_body(body).unwrap(), update);
    }

    #[test]
    fn test_insert_and_delete() {
        let insert = OpInsert {
            flags: InsertFlags::CONTINUE_ON_ERROR,
            full_collection_name: "db.c".into(),
            documents: vec![doc! { "x": 1 }, doc! { "x": 2 }],
        };
        let encoded = insert.encode(1, 0).unwrap();
        assert_eq!(OpInsert::decode_body(&encoded[HEADER_SIZE..]).unwrap(), insert);

        let delete = OpDelete {
            full_collection_name: "db.c".into(),
            flags: DeleteFlags::SINGLE_REMOVE,
            selector: doc! { "x": 1 },
        };
        let encoded = delete.encode(2, 0).unwrap();
        assert_eq!(OpDelete::decode_body(&encoded[HEADER_SIZE..]).unwrap(), delete);
    }

    #[test]
    fn test_reserved_field_must_be_zero() {
        let encoded = OpGetMore {
            full_collection_name: "db.c".into(),
            number_to_return: 0,
            cursor_id: 1,
        }
        .encode(1, 0)
        .unwrap();

        let mut body = encoded[HEADER_SIZE..].to_vec();
        body[0] = 1;
        assert_eq!(OpGetMore::decode_body(&body).unwrap_err().reason(), Some("unexpectedValue"));
    }

    #[test]
    fn test_kill_cursors_count_exceeds_body() {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&3i32.to_le_bytes());
        body.extend_from_slice(&9i64.to_le_bytes());

        let err = OpKillCursors::decode_body(&body).unwrap_err();
        assert_eq!(err.reason(), Some("missingDocumentBody"));
    }
}

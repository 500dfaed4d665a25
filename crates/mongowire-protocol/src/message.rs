//! Framing shared by every opcode, and the set of messages a client may send

use bson::Document;
use bytes::{BufMut, BytesMut};
use mongowire_common::{
    ParsingReason, ProtocolParsingError, ProtocolSerializationError, Result, SerializationReason,
};

use crate::header::{MessageHeader, OpCode, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::op_legacy::{OpDelete, OpGetMore, OpInsert, OpKillCursors, OpUpdate};
use crate::op_msg::OpMsg;
use crate::op_query::OpQuery;

/// An opcode body with a fixed binary layout
pub trait WireMessage: Sized {
    const OP_CODE: OpCode;

    /// Append the body (everything after the header) to `buf`
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()>;

    /// Decode a complete body. Trailing bytes are an error.
    fn decode_body(body: &[u8]) -> Result<Self>;

    /// Encode header and body as one framed message
    fn encode(&self, request_id: i32, response_to: i32) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_bytes(0, HEADER_SIZE);
        self.encode_body(&mut buf)?;

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolSerializationError::new(SerializationReason::CommandSizeTooLarge).into());
        }
        let message_length = i32::try_from(buf.len())
            .map_err(|_| ProtocolSerializationError::new(SerializationReason::CommandSizeTooLarge))?;

        let header = MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code: Self::OP_CODE,
        };
        header.encode(&mut &mut buf[..HEADER_SIZE]);

        Ok(buf)
    }
}

pub(crate) fn ensure_consumed(rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(ProtocolParsingError::new(ParsingReason::UnexpectedValue).into())
    }
}

/// Every message a client sends to a server
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    Query(OpQuery),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    Insert(OpInsert),
    Update(OpUpdate),
    Delete(OpDelete),
    Msg(OpMsg),
}

impl RequestMessage {
    /// Build a command for `database` in the framing selected by `op_code`.
    ///
    /// Only `OP_MSG` and `OP_QUERY` (against `<database>.$cmd`) can carry a command.
    pub fn command(op_code: OpCode, database: &str, command: Document) -> Result<Self> {
        match op_code {
            OpCode::Msg => Ok(RequestMessage::Msg(OpMsg::command(command))),
            OpCode::Query => Ok(RequestMessage::Query(OpQuery::command(database, command))),
            OpCode::Reply => Err(ProtocolSerializationError::new(SerializationReason::UnsupportedOpCode).into()),
            _ => Err(ProtocolSerializationError::new(SerializationReason::UnexpectedOpCode).into()),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            RequestMessage::Query(_) => OpCode::Query,
            RequestMessage::GetMore(_) => OpCode::GetMore,
            RequestMessage::KillCursors(_) => OpCode::KillCursors,
            RequestMessage::Insert(_) => OpCode::Insert,
            RequestMessage::Update(_) => OpCode::Update,
            RequestMessage::Delete(_) => OpCode::Delete,
            RequestMessage::Msg(_) => OpCode::Msg,
        }
    }

    /// The command or query document, for OP_MSG and OP_QUERY
    pub fn command_document(&self) -> Option<&Document> {
        match self {
            RequestMessage::Msg(msg) => msg.body(),
            RequestMessage::Query(query) => Some(&query.query),
            _ => None,
        }
    }

    /// Whether the server answers this message
    pub fn expects_reply(&self) -> bool {
        match self {
            RequestMessage::Query(_) | RequestMessage::GetMore(_) => true,
            RequestMessage::Msg(msg) => !msg.more_to_come(),
            RequestMessage::KillCursors(_)
            | RequestMessage::Insert(_)
            | RequestMessage::Update(_)
            | RequestMessage::Delete(_) => false,
        }
    }

    pub fn encode(&self, request_id: i32) -> Result<BytesMut> {
        match self {
            RequestMessage::Query(m) => m.encode(request_id, 0),
            RequestMessage::GetMore(m) => m.encode(request_id, 0),
            RequestMessage::KillCursors(m) => m.encode(request_id, 0),
            RequestMessage::Insert(m) => m.encode(request_id, 0),
            RequestMessage::Update(m) => m.encode(request_id, 0),
            RequestMessage::Delete(m) => m.encode(request_id, 0),
            RequestMessage::Msg(m) => m.encode(request_id, 0),
        }
    }

    /// Decode a request body previously framed by `header`
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        if body.len() != header.body_length() {
            return Err(ProtocolParsingError::new(ParsingReason::UnexpectedValue).into());
        }

        Ok(match header.op_code {
            OpCode::Query => RequestMessage::Query(OpQuery::decode_body(body)?),
            OpCode::GetMore => RequestMessage::GetMore(OpGetMore::decode_body(body)?),
            OpCode::KillCursors => RequestMessage::KillCursors(OpKillCursors::decode_body(body)?),
            OpCode::Insert => RequestMessage::Insert(OpInsert::decode_body(body)?),
            OpCode::Update => RequestMessage::Update(OpUpdate::decode_body(body)?),
            OpCode::Delete => RequestMessage::Delete(OpDelete::decode_body(body)?),
            OpCode::Msg => RequestMessage::Msg(OpMsg::decode_body(body)?),
            OpCode::Reply => {
                return Err(ProtocolParsingError::new(ParsingReason::UnsupportedOpCode).into());
            }
        })
    }
}

impl From<OpQuery> for RequestMessage {
    fn from(m: OpQuery) -> Self {
        RequestMessage::Query(m)
    }
}

impl From<OpGetMore> for RequestMessage {
    fn from(m: OpGetMore) -> Self {
        RequestMessage::GetMore(m)
    }
}

impl From<OpKillCursors> for RequestMessage {
    fn from(m: OpKillCursors) -> Self {
        RequestMessage::KillCursors(m)
    }
}

impl From<OpInsert> for RequestMessage {
    fn from(m: OpInsert) -> Self {
        RequestMessage::Insert(m)
    }
}

impl From<OpUpdate> for RequestMessage {
    fn from(m: OpUpdate) -> Self {
        RequestMessage::Update(m)
    }
}

impl From<OpDelete> for RequestMessage {
    fn from(m: OpDelete) -> Self {
        RequestMessage::Delete(m)
    }
}

impl From<OpMsg> for RequestMessage {
    fn from(m: OpMsg) -> Self {
        RequestMessage::Msg(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bytes::Buf;

    fn split(encoded: &BytesMut) -> (MessageHeader, &[u8]) {
        let mut slice = &encoded[..];
        let header = MessageHeader::decode(&mut slice).unwrap();
        (header, &encoded[HEADER_SIZE..])
    }

    #[test]
    fn test_encode_patches_length() {
        let msg = RequestMessage::from(OpKillCursors { cursor_ids: vec![1, 2] });
        let encoded = msg.encode(99).unwrap();

        assert_eq!(encoded.len(), HEADER_SIZE + 4 + 4 + 16);
        let (header, body) = split(&encoded);
        assert_eq!(header.message_length as usize, encoded.len());
        assert_eq!(header.request_id, 99);
        assert_eq!(header.response_to, 0);
        assert_eq!(header.op_code, OpCode::KillCursors);
        assert_eq!(RequestMessage::decode(&header, body).unwrap(), msg);
    }

    #[test]
    fn test_command_framing_selection() {
        let msg = RequestMessage::command(OpCode::Msg, "app", doc! { "ping": 1 }).unwrap();
        assert_eq!(msg.op_code(), OpCode::Msg);
        assert!(msg.expects_reply());

        let query = RequestMessage::command(OpCode::Query, "app", doc! { "ping": 1 }).unwrap();
        match query {
            RequestMessage::Query(q) => {
                assert_eq!(q.full_collection_name, "app.$cmd");
                assert_eq!(q.number_to_return, -1);
            }
            other => panic!("unexpected message {other:?}"),
        }

        let err = RequestMessage::command(OpCode::Insert, "app", doc! {}).unwrap_err();
        assert_eq!(err.reason(), Some("unexpectedOpCode"));
        let err = RequestMessage::command(OpCode::Reply, "app", doc! {}).unwrap_err();
        assert_eq!(err.reason(), Some("unsupportedOpCode"));
    }

    #[test]
    fn test_fire_and_forget_messages() {
        let insert = RequestMessage::from(OpInsert {
            flags: crate::InsertFlags::empty(),
            full_collection_name: "app.users".into(),
            documents: vec![doc! { "a": 1 }],
        });
        assert!(!insert.expects_reply());
    }

    #[test]
    fn test_reply_is_not_a_request() {
        let reply = crate::OpReply {
            flags: crate::ReplyFlags::empty(),
            cursor_id: 0,
            starting_from: 0,
            number_returned: 0,
            documents: vec![],
        };
        let encoded = reply.encode(1, 2).unwrap();
        let (header, body) = split(&encoded);
        let err = RequestMessage::decode(&header, body).unwrap_err();
        assert_eq!(err.reason(), Some("unsupportedOpCode"));
    }

    #[test]
    fn test_body_length_mismatch() {
        let encoded = RequestMessage::from(OpKillCursors { cursor_ids: vec![5] })
            .encode(1)
            .unwrap();
        let (header, body) = split(&encoded);
        let mut short = body;
        short.advance(1);
        let err = RequestMessage::decode(&header, short).unwrap_err();
        assert_eq!(err.reason(), Some("unexpectedValue"));
    }
}

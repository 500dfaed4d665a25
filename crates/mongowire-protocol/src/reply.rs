//! Server replies

use bson::Document;
use bytes::BytesMut;
use mongowire_common::{
    ConnectionError, ConnectionErrorKind, ConnectionErrorReason, ParsingReason, ProtocolParsingError, Result,
};

use crate::header::{MessageHeader, OpCode};
use crate::message::WireMessage;
use crate::op_msg::OpMsg;
use crate::op_reply::OpReply;

/// The two shapes a server answers with
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Reply(OpReply),
    Message(OpMsg),
}

/// A complete, length-validated server reply
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReply {
    pub header: MessageHeader,
    pub body: ReplyBody,
}

impl ServerReply {
    /// Decode the body of a reply whose header has already been read.
    ///
    /// Only OP_REPLY and OP_MSG are accepted from a server.
    pub fn decode(header: MessageHeader, body: &[u8]) -> Result<Self> {
        let body = match header.op_code {
            OpCode::Reply => ReplyBody::Reply(OpReply::decode_body(body)?),
            OpCode::Msg => ReplyBody::Message(OpMsg::decode_body(body)?),
            _ => return Err(ProtocolParsingError::new(ParsingReason::UnsupportedOpCode).into()),
        };
        Ok(Self { header, body })
    }

    /// Frame an OP_REPLY answering `response_to`
    pub fn encode_reply(reply: &OpReply, request_id: i32, response_to: i32) -> Result<BytesMut> {
        reply.encode(request_id, response_to)
    }

    /// Frame an OP_MSG answering `response_to`
    pub fn encode_message(message: &OpMsg, request_id: i32, response_to: i32) -> Result<BytesMut> {
        message.encode(request_id, response_to)
    }

    /// The request id this reply answers
    pub fn response_to(&self) -> i32 {
        self.header.response_to
    }

    /// The command reply document: the OP_MSG body, or the first OP_REPLY document
    pub fn command_document(&self) -> Option<&Document> {
        match &self.body {
            ReplyBody::Reply(reply) => reply.documents.first(),
            ReplyBody::Message(msg) => msg.body(),
        }
    }

    /// Take the command reply document, failing if the reply carries none
    pub fn into_command_document(self) -> Result<Document> {
        let document = match self.body {
            ReplyBody::Reply(reply) => reply.documents.into_iter().next(),
            ReplyBody::Message(msg) => msg.into_body(),
        };
        document.ok_or_else(|| {
            ConnectionError::new(
                ConnectionErrorKind::InvalidResponse,
                Some(ConnectionErrorReason::MissingReplyDocument),
            )
            .into()
        })
    }

    /// The legacy reply, for callers that sent OP_QUERY/OP_GET_MORE
    pub fn into_legacy(self) -> Result<OpReply> {
        match self.body {
            ReplyBody::Reply(reply) => Ok(reply),
            ReplyBody::Message(_) => Err(ConnectionError::new(
                ConnectionErrorKind::InvalidResponse,
                Some(ConnectionErrorReason::InvalidReplyType),
            )
            .into()),
        }
    }
}

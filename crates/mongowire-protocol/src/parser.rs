//! Incremental reply parser
//!
//! Bytes arrive from the socket in arbitrary chunks. The parser consumes a
//! header as soon as 16 bytes are buffered, remembers it, and waits until the
//! full body is available before decoding. Partial data is never an error.

use bytes::{Buf, BytesMut};
use mongowire_common::{Error, Result};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::header::{MessageHeader, HEADER_SIZE};
use crate::reply::ServerReply;

/// Where the parser is within the current message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// Waiting for 16 header bytes
    #[default]
    AwaitingHeader,
    /// Header consumed, waiting for `body_length()` more bytes
    AwaitingBody(MessageHeader),
}

/// Result of one `parse` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Buffer more bytes and call again
    NeedMoreData,
    /// A reply was decoded and can be taken with `take_reply`
    Continue,
}

/// Resumable parser turning a byte stream into server replies
#[derive(Debug, Default)]
pub struct ReplyParser {
    state: ParserState,
    reply: Option<ServerReply>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Advance over `buffer`, consuming exactly the bytes of at most one message.
    ///
    /// Errors are fatal: the stream can no longer be framed.
    pub fn parse(&mut self, buffer: &mut BytesMut) -> Result<ParseOutcome> {
        let header = match self.state {
            ParserState::AwaitingBody(header) => header,
            ParserState::AwaitingHeader => {
                if buffer.len() < HEADER_SIZE {
                    return Ok(ParseOutcome::NeedMoreData);
                }
                let header = MessageHeader::decode(buffer)?;
                self.state = ParserState::AwaitingBody(header);
                header
            }
        };

        let body_length = header.body_length();
        if buffer.len() < body_length {
            trace!(
                needed = body_length,
                buffered = buffer.len(),
                "Waiting for the rest of the reply body"
            );
            return Ok(ParseOutcome::NeedMoreData);
        }

        let body = buffer.split_to(body_length);
        self.state = ParserState::AwaitingHeader;
        self.reply = Some(ServerReply::decode(header, &body)?);

        Ok(ParseOutcome::Continue)
    }

    /// Take the last decoded reply. Returns it once, then `None`.
    pub fn take_reply(&mut self) -> Option<ServerReply> {
        self.reply.take()
    }

    /// Bytes still required before the current message completes
    pub fn bytes_needed(&self, buffered: usize) -> usize {
        match self.state {
            ParserState::AwaitingHeader => HEADER_SIZE.saturating_sub(buffered),
            ParserState::AwaitingBody(header) => header.body_length().saturating_sub(buffered),
        }
    }
}

/// [`Decoder`] adapter so a connection can drive the parser through `FramedRead`
#[derive(Debug, Default)]
pub struct ReplyCodec {
    parser: ReplyParser,
}

impl ReplyCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ReplyCodec {
    type Item = ServerReply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerReply>> {
        match self.parser.parse(src)? {
            ParseOutcome::Continue => Ok(self.parser.take_reply()),
            ParseOutcome::NeedMoreData => {
                src.reserve(self.parser.bytes_needed(src.len()));
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ServerReply>> {
        match self.decode(buf)? {
            Some(reply) => Ok(Some(reply)),
            None if buf.is_empty() && self.parser.state() == ParserState::AwaitingHeader => Ok(None),
            None => {
                trace!(remaining = buf.remaining(), "Stream ended inside a reply");
                Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed mid-reply").into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::OpCode;
    use crate::op_msg::OpMsg;
    use crate::op_reply::OpReply;
    use bson::doc;

    fn encoded_reply() -> BytesMut {
        let reply = OpReply::new(9, 0, vec![doc! { "a": 1 }, doc! { "b": "two" }]);
        ServerReply::encode_reply(&reply, 100, 7).unwrap()
    }

    #[test]
    fn test_short_buffer_is_not_consumed() {
        let mut parser = ReplyParser::new();
        let mut buffer = BytesMut::from(&encoded_reply()[..10]);

        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::NeedMoreData);
        assert_eq!(buffer.len(), 10);
        assert_eq!(parser.state(), ParserState::AwaitingHeader);
    }

    #[test]
    fn test_header_is_cached_across_calls() {
        let encoded = encoded_reply();
        let mut parser = ReplyParser::new();
        let mut buffer = BytesMut::from(&encoded[..HEADER_SIZE + 3]);

        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::NeedMoreData);
        assert!(matches!(parser.state(), ParserState::AwaitingBody(h) if h.response_to == 7));
        assert_eq!(buffer.len(), 3);

        buffer.extend_from_slice(&encoded[HEADER_SIZE + 3..]);
        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::Continue);
        assert!(buffer.is_empty());
        assert_eq!(parser.state(), ParserState::AwaitingHeader);
    }

    #[test]
    fn test_take_reply_is_one_shot() {
        let mut parser = ReplyParser::new();
        let mut buffer = encoded_reply();

        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::Continue);
        let reply = parser.take_reply().unwrap();
        assert_eq!(reply.response_to(), 7);
        assert!(parser.take_reply().is_none());
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut buffer = encoded_reply();
        buffer.extend_from_slice(&ServerReply::encode_message(&OpMsg::command(doc! { "ok": 1.0 }), 101, 8).unwrap());

        let mut parser = ReplyParser::new();
        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::Continue);
        assert_eq!(parser.take_reply().unwrap().header.op_code, OpCode::Reply);
        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::Continue);
        assert_eq!(parser.take_reply().unwrap().header.op_code, OpCode::Msg);
        assert_eq!(parser.parse(&mut buffer).unwrap(), ParseOutcome::NeedMoreData);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut buffer = encoded_reply();
        buffer[12..16].copy_from_slice(&2012i32.to_le_bytes());

        let err = ReplyParser::new().parse(&mut buffer).unwrap_err();
        assert!(err.is_fatal_to_connection());
        assert_eq!(err.reason(), Some("unsupportedOpCode"));
    }

    #[test]
    fn test_request_opcode_is_rejected_after_body() {
        let mut buffer = encoded_reply();
        buffer[12..16].copy_from_slice(&(OpCode::Query as i32).to_le_bytes());

        let err = ReplyParser::new().parse(&mut buffer).unwrap_err();
        assert_eq!(err.reason(), Some("unsupportedOpCode"));
    }

    #[test]
    fn test_codec_yields_replies() {
        let mut codec = ReplyCodec::new();
        let encoded = encoded_reply();
        let mut buffer = BytesMut::from(&encoded[..20]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&encoded[20..]);
        let reply = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(reply.response_to(), 7);
    }

    #[test]
    fn test_codec_eof_mid_reply() {
        let mut codec = ReplyCodec::new();
        let encoded = encoded_reply();
        let mut buffer = BytesMut::from(&encoded[..HEADER_SIZE + 1]);

        assert!(codec.decode_eof(&mut buffer).is_err());
        assert!(codec.decode_eof(&mut BytesMut::new()).is_err());
    }
}

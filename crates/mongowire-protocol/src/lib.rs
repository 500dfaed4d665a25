//! MongoWire Protocol - MongoDB wire format
//!
//! Encoding and decoding of the 16-byte message header and every opcode body,
//! plus the incremental [`ReplyParser`] that frames server replies out of an
//! arbitrarily chunked byte stream. Nothing in this crate performs I/O.
//!
//! Supported opcodes:
//! - OP_MSG (2013), the modern extensible message
//! - OP_QUERY (2004) / OP_REPLY (1)
//! - OP_GET_MORE (2005), OP_KILL_CURSORS (2007)
//! - OP_INSERT (2002), OP_UPDATE (2001), OP_DELETE (2006)

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod flags;
pub mod header;
pub mod message;
pub mod op_legacy;
pub mod op_msg;
pub mod op_query;
pub mod op_reply;
pub mod parser;
pub mod reply;
mod wire;

pub use flags::{DeleteFlags, InsertFlags, MsgFlags, QueryFlags, ReplyFlags, UpdateFlags};
pub use header::{MessageHeader, OpCode, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use message::{RequestMessage, WireMessage};
pub use op_legacy::{OpDelete, OpGetMore, OpInsert, OpKillCursors, OpUpdate};
pub use op_msg::{OpMsg, Section, SectionKind};
pub use op_query::OpQuery;
pub use op_reply::OpReply;
pub use parser::{ParseOutcome, ParserState, ReplyCodec, ReplyParser};
pub use reply::{ReplyBody, ServerReply};
pub use wire::MAX_DOCUMENT_SIZE;

//! OP_MSG

use bson::Document;
use bytes::{BufMut, BytesMut};
use mongowire_common::{
    ParsingReason, ProtocolParsingError, ProtocolSerializationError, Result, SerializationReason,
};

use crate::flags::MsgFlags;
use crate::header::OpCode;
use crate::message::WireMessage;
use crate::wire::{get_cstring, get_document, get_documents, get_i32, get_u32, get_u8, put_cstring, put_document};

const CHECKSUM_SIZE: usize = 4;

/// OP_MSG section types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionKind {
    Body = 0,
    DocumentSequence = 1,
}

/// One section of an OP_MSG
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    /// The command (request) or command reply (response)
    Body(Document),
    /// Bulk payload, e.g. `documents` for an insert
    Sequence { identifier: String, documents: Vec<Document> },
}

/// An extensible message, the only opcode current servers speak
#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub flags: MsgFlags,
    pub sections: Vec<Section>,
}

impl OpMsg {
    /// A message whose only section is `command`
    pub fn command(command: Document) -> Self {
        Self {
            flags: MsgFlags::empty(),
            sections: vec![Section::Body(command)],
        }
    }

    /// Attach a document sequence, moving bulk payloads out of the body
    #[must_use]
    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sections.push(Section::Sequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    /// The body section
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            Section::Body(document) => Some(document),
            Section::Sequence { .. } => None,
        })
    }

    pub fn body_mut(&mut self) -> Option<&mut Document> {
        self.sections.iter_mut().find_map(|section| match section {
            Section::Body(document) => Some(document),
            Section::Sequence { .. } => None,
        })
    }

    pub fn into_body(self) -> Option<Document> {
        self.sections.into_iter().find_map(|section| match section {
            Section::Body(document) => Some(document),
            Section::Sequence { .. } => None,
        })
    }

    pub fn more_to_come(&self) -> bool {
        self.flags.contains(MsgFlags::MORE_TO_COME)
    }
}

impl WireMessage for OpMsg {
    const OP_CODE: OpCode = OpCode::Msg;

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        let body_sections = self
            .sections
            .iter()
            .filter(|section| matches!(section, Section::Body(_)))
            .count();
        if body_sections != 1 {
            return Err(ProtocolSerializationError::new(SerializationReason::MissingCommandSection).into());
        }

        // Checksums are never produced
        let mut flags = self.flags;
        flags.remove(MsgFlags::CHECKSUM_PRESENT);
        buf.put_u32_le(flags.bits());

        for section in &self.sections {
            match section {
                Section::Body(document) => {
                    buf.put_u8(SectionKind::Body as u8);
                    put_document(buf, document)?;
                }
                Section::Sequence { identifier, documents } => {
                    buf.put_u8(SectionKind::DocumentSequence as u8);
                    let size_at = buf.len();
                    buf.put_i32_le(0);
                    put_cstring(buf, identifier)?;
                    for document in documents {
                        put_document(buf, document)?;
                    }
                    let size = i32::try_from(buf.len() - size_at)
                        .map_err(|_| ProtocolSerializationError::new(SerializationReason::CommandSizeTooLarge))?;
                    buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        let flags = MsgFlags::from_bits(get_u32(&mut body)?);
        if flags.has_unknown_required_bits() {
            return Err(unexpected());
        }

        if flags.contains(MsgFlags::CHECKSUM_PRESENT) {
            // The CRC-32C trailer is skipped, not validated
            let end = body.len().checked_sub(CHECKSUM_SIZE).ok_or_else(unexpected)?;
            body = &body[..end];
        }

        let mut sections = Vec::new();
        while !body.is_empty() {
            match get_u8(&mut body)? {
                0 => sections.push(Section::Body(get_document(&mut body)?)),
                1 => {
                    let mut peek = body;
                    let size = usize::try_from(get_i32(&mut peek)?).map_err(|_| unexpected())?;
                    if size < 4 || size > body.len() {
                        return Err(unexpected());
                    }
                    let (mut section, rest) = body.split_at(size);
                    body = rest;

                    get_i32(&mut section)?;
                    let identifier = get_cstring(&mut section)?;
                    let documents = get_documents(&mut section)?;
                    sections.push(Section::Sequence { identifier, documents });
                }
                _ => return Err(unexpected()),
            }
        }

        let msg = Self { flags, sections };
        if msg.body().is_none() {
            return Err(ProtocolParsingError::new(ParsingReason::MissingDocumentBody).into());
        }
        Ok(msg)
    }
}

fn unexpected() -> mongowire_common::Error {
    ProtocolParsingError::new(ParsingReason::UnexpectedValue).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use bson::doc;

    #[test]
    fn test_single_body_layout() {
        let msg = OpMsg::command(doc! { "ping": 1, "$db": "admin" });
        let encoded = msg.encode(1, 0).unwrap();
        let body = &encoded[HEADER_SIZE..];

        assert_eq!(&body[0..4], &0u32.to_le_bytes());
        assert_eq!(body[4], 0);
        assert_eq!(OpMsg::decode_body(body).unwrap(), msg);
    }

    #[test]
    fn test_document_sequence_roundtrip() {
        let msg = OpMsg::command(doc! { "insert": "users", "$db": "app" })
            .with_sequence("documents", vec![doc! { "_id": 1 }, doc! { "_id": 2 }]);

        let encoded = msg.encode(2, 0).unwrap();
        let decoded = OpMsg::decode_body(&encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.body().unwrap().get_str("insert").unwrap(), "users");
    }

    #[test]
    fn test_missing_command_section() {
        let msg = OpMsg {
            flags: MsgFlags::empty(),
            sections: vec![Section::Sequence {
                identifier: "documents".into(),
                documents: vec![],
            }],
        };
        assert_eq!(msg.encode(1, 0).unwrap_err().reason(), Some("missingCommandSection"));

        let two = OpMsg {
            flags: MsgFlags::empty(),
            sections: vec![Section::Body(doc! {}), Section::Body(doc! {})],
        };
        assert_eq!(two.encode(1, 0).unwrap_err().reason(), Some("missingCommandSection"));
    }

    #[test]
    fn test_checksum_is_skipped() {
        let msg = OpMsg::command(doc! { "ok": 1.0 });
        let encoded = msg.encode(1, 0).unwrap();

        let mut body = encoded[HEADER_SIZE..].to_vec();
        body[0] |= 1;
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let decoded = OpMsg::decode_body(&body).unwrap();
        assert!(decoded.flags.contains(MsgFlags::CHECKSUM_PRESENT));
        assert_eq!(decoded.body(), Some(&doc! { "ok": 1.0 }));
    }

    #[test]
    fn test_unknown_required_flag() {
        let encoded = OpMsg::command(doc! {}).encode(1, 0).unwrap();
        let mut body = encoded[HEADER_SIZE..].to_vec();
        body[0] |= 1 << 4;
        assert_eq!(OpMsg::decode_body(&body).unwrap_err().reason(), Some("unexpectedValue"));
    }

    #[test]
    fn test_unknown_section_kind() {
        let encoded = OpMsg::command(doc! {}).encode(1, 0).unwrap();
        let mut body = encoded[HEADER_SIZE..].to_vec();
        body[4] = 7;
        assert_eq!(OpMsg::decode_body(&body).unwrap_err().reason(), Some("unexpectedValue"));
    }
}

//! Primitive field readers and writers shared by the opcode bodies

use bson::Document;
use bytes::{Buf, BufMut};
use mongowire_common::{
    Error, ParsingReason, ProtocolParsingError, ProtocolSerializationError, Result, SerializationReason,
};

/// Largest document a server accepts (`maxBsonObjectSize`)
pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

// Smallest valid BSON document: int32 length + terminating NUL
const MIN_DOCUMENT_SIZE: usize = 5;

fn truncated() -> Error {
    ProtocolParsingError::new(ParsingReason::MissingDocumentBody).into()
}

fn unexpected() -> Error {
    ProtocolParsingError::new(ParsingReason::UnexpectedValue).into()
}

pub(crate) fn get_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32_le())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn get_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_i64_le())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

/// Read a NUL-terminated UTF-8 string
pub(crate) fn get_cstring(buf: &mut &[u8]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).ok_or_else(truncated)?;
    let value = std::str::from_utf8(&buf[..end]).map_err(|_| unexpected())?.to_string();
    buf.advance(end + 1);
    Ok(value)
}

pub(crate) fn put_cstring<B: BufMut>(buf: &mut B, value: &str) -> Result<()> {
    // An interior NUL would silently truncate the string on the server
    if value.as_bytes().contains(&0) {
        return Err(Error::Document(format!("string '{}' contains a NUL byte", value.escape_debug())));
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Read one length-prefixed document
pub(crate) fn get_document(buf: &mut &[u8]) -> Result<Document> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let declared = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let length = usize::try_from(declared).map_err(|_| unexpected())?;
    if length < MIN_DOCUMENT_SIZE {
        return Err(unexpected());
    }
    if length > buf.remaining() {
        return Err(truncated());
    }

    let (mut raw, rest) = buf.split_at(length);
    let document = Document::from_reader(&mut raw)?;
    *buf = rest;
    Ok(document)
}

/// Read documents until the buffer is exhausted
pub(crate) fn get_documents(buf: &mut &[u8]) -> Result<Vec<Document>> {
    let mut documents = Vec::new();
    while buf.has_remaining() {
        documents.push(get_document(buf)?);
    }
    Ok(documents)
}

/// Serialize a document, enforcing the 16 MiB limit
pub(crate) fn put_document<B: BufMut>(buf: &mut B, document: &Document) -> Result<()> {
    let mut bytes = Vec::new();
    document.to_writer(&mut bytes)?;
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(ProtocolSerializationError::new(SerializationReason::CommandSizeTooLarge).into());
    }
    buf.put_slice(&bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_cstring_roundtrip() {
        let mut out = Vec::new();
        put_cstring(&mut out, "db.coll").unwrap();
        assert_eq!(out, b"db.coll\0");

        let mut slice = out.as_slice();
        assert_eq!(get_cstring(&mut slice).unwrap(), "db.coll");
        assert!(slice.is_empty());
    }

    #[test]
    fn test_unterminated_cstring() {
        let mut slice: &[u8] = b"db.coll";
        assert_eq!(get_cstring(&mut slice).unwrap_err().reason(), Some("missingDocumentBody"));
    }

    #[test]
    fn test_document_leaves_trailing_bytes() {
        let mut out = Vec::new();
        put_document(&mut out, &doc! { "a": 1 }).unwrap();
        out.extend_from_slice(&[9, 9]);

        let mut slice = out.as_slice();
        assert_eq!(get_document(&mut slice).unwrap(), doc! { "a": 1 });
        assert_eq!(slice, &[9, 9]);
    }

    #[test]
    fn test_truncated_document() {
        let mut out = Vec::new();
        put_document(&mut out, &doc! { "name": "truncated" }).unwrap();
        out.truncate(out.len() - 3);

        let mut slice = out.as_slice();
        assert_eq!(get_document(&mut slice).unwrap_err().reason(), Some("missingDocumentBody"));
    }

    #[test]
    fn test_oversized_document_rejected() {
        let big = "x".repeat(MAX_DOCUMENT_SIZE);
        let err = put_document(&mut Vec::new(), &doc! { "payload": big }).unwrap_err();
        assert_eq!(err.reason(), Some("commandSizeTooLarge"));
    }
}

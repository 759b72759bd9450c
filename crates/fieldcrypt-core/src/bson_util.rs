//! Raw-byte round trips for single BSON values.
//!
//! Encrypted fields store the *value bytes* of a BSON element plus its
//! element type tag; reassembling a value from plaintext requires wrapping
//! the bytes back into a one-element document. The wrapper uses an empty
//! field name so the element header is a fixed two bytes.

use bson::spec::ElementType;
use bson::{Bson, Document};

use crate::error::{Error, Result};

// Wrapper layout: [i32 total][u8 type][0x00 empty name][value bytes][0x00].
const VALUE_OFFSET: usize = 6;

/// Extract `(element_type, value_bytes)` for a single BSON value.
pub fn value_to_raw(value: &Bson) -> Result<(u8, Vec<u8>)> {
    let mut wrapper = Document::new();
    wrapper.insert("", value.clone());

    let mut buf = Vec::new();
    wrapper.to_writer(&mut buf)?;

    let element_type = buf[4];
    let raw = buf[VALUE_OFFSET..buf.len() - 1].to_vec();
    Ok((element_type, raw))
}

/// Rebuild a BSON value from its element type tag and raw value bytes.
pub fn raw_to_value(element_type: u8, raw: &[u8]) -> Result<Bson> {
    if ElementType::from(element_type).is_none() {
        return Err(Error::MalformedBson(format!(
            "unknown element type {element_type:#04x}"
        )));
    }

    let total = VALUE_OFFSET + raw.len() + 1;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as i32).to_le_bytes());
    buf.push(element_type);
    buf.push(0); // empty field name
    buf.extend_from_slice(raw);
    buf.push(0); // document terminator

    let doc = Document::from_reader(&buf[..])?;
    doc.get("")
        .cloned()
        .ok_or_else(|| Error::MalformedBson("value did not round-trip".into()))
}

/// Serialize a document to its BSON bytes.
pub fn doc_to_bytes(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)?;
    Ok(buf)
}

/// Parse BSON bytes into a document.
pub fn doc_from_bytes(bytes: &[u8]) -> Result<Document> {
    Ok(Document::from_reader(bytes)?)
}

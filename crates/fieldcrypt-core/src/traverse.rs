//! Depth-first traversal over subtype-6 binaries in a document.
//!
//! Both encrypt and decrypt walk arbitrary command or reply documents looking
//! for encrypted-field binaries: markings on the way out, ciphertext blobs on
//! the way back. Traversal is document order, descending into subdocuments
//! and arrays; that order is observable because it fixes the order key
//! references enter the key broker.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::error::Result;

/// Which discriminator a walk matches on. The first payload byte of a
/// subtype-6 binary distinguishes the two forms: 0 is a marking, 1 or 2 is a
/// ciphertext blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseMatch {
    Ciphertext,
    Marking,
}

/// The slice a visitor receives for a matched binary: the full blob for
/// ciphertext (its first byte is the blob subtype), the payload after the
/// discriminator for markings.
fn matched_slice<'a>(bin: &'a Binary, m: TraverseMatch) -> Option<&'a [u8]> {
    if bin.subtype != BinarySubtype::Encrypted || bin.bytes.is_empty() {
        return None;
    }
    match (m, bin.bytes[0]) {
        (TraverseMatch::Ciphertext, 1 | 2) => Some(&bin.bytes),
        (TraverseMatch::Marking, 0) => Some(&bin.bytes[1..]),
        _ => None,
    }
}

/// Visit every matching binary in `doc`, depth first.
pub fn collect<F>(doc: &Document, m: TraverseMatch, visit: &mut F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    for (_, value) in doc.iter() {
        collect_value(value, m, visit)?;
    }
    Ok(())
}

fn collect_value<F>(value: &Bson, m: TraverseMatch, visit: &mut F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    match value {
        Bson::Document(doc) => collect(doc, m, visit),
        Bson::Array(items) => {
            for item in items {
                collect_value(item, m, visit)?;
            }
            Ok(())
        }
        Bson::Binary(bin) => {
            if let Some(slice) = matched_slice(bin, m) {
                visit(slice)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Rebuild `doc`, replacing each matching binary with the mapper's output
/// under the same field name. A mapper returning `Ok(None)` keeps the
/// original element (partial decryption passes unresolved blobs through).
pub fn transform<F>(doc: &Document, m: TraverseMatch, map: &mut F) -> Result<Document>
where
    F: FnMut(&[u8]) -> Result<Option<Bson>>,
{
    let mut out = Document::new();
    for (name, value) in doc.iter() {
        out.insert(name.clone(), transform_value(value, m, map)?);
    }
    Ok(out)
}

fn transform_value<F>(value: &Bson, m: TraverseMatch, map: &mut F) -> Result<Bson>
where
    F: FnMut(&[u8]) -> Result<Option<Bson>>,
{
    match value {
        Bson::Document(doc) => Ok(Bson::Document(transform(doc, m, map)?)),
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(transform_value(item, m, map)?);
            }
            Ok(Bson::Array(out))
        }
        Bson::Binary(bin) => match matched_slice(bin, m) {
            Some(slice) => Ok(map(slice)?.unwrap_or_else(|| value.clone())),
            None => Ok(value.clone()),
        },
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bson::doc;

    fn encrypted_bin(first: u8, rest: &[u8]) -> Binary {
        let mut bytes = vec![first];
        bytes.extend_from_slice(rest);
        Binary {
            subtype: BinarySubtype::Encrypted,
            bytes,
        }
    }

    #[test]
    fn collect_matches_only_requested_form() {
        let doc = doc! {
            "marking": encrypted_bin(0, b"mk"),
            "blob": encrypted_bin(1, b"ct"),
            "plain": "untouched",
        };

        let mut seen = Vec::new();
        collect(&doc, TraverseMatch::Marking, &mut |b| {
            seen.push(b.to_vec());
            Ok(())
        })
        .unwrap();
        // Marking visitor gets the payload after the discriminator.
        assert_eq!(seen, vec![b"mk".to_vec()]);

        seen.clear();
        collect(&doc, TraverseMatch::Ciphertext, &mut |b| {
            seen.push(b.to_vec());
            Ok(())
        })
        .unwrap();
        // Ciphertext visitor gets the whole blob including the subtype byte.
        assert_eq!(seen, vec![[&[1u8][..], b"ct"].concat()]);
    }

    #[test]
    fn collect_descends_in_document_order() {
        let doc = doc! {
            "a": encrypted_bin(1, b"first"),
            "nested": {"inner": encrypted_bin(2, b"second")},
            "arr": [encrypted_bin(1, b"third"), {"deep": encrypted_bin(2, b"fourth")}],
        };

        let mut order = Vec::new();
        collect(&doc, TraverseMatch::Ciphertext, &mut |b| {
            order.push(b[1..].to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(
            order,
            vec![
                b"first".to_vec(),
                b"second".to_vec(),
                b"third".to_vec(),
                b"fourth".to_vec()
            ]
        );
    }

    #[test]
    fn collect_skips_other_subtypes_and_empty_binaries() {
        let doc = doc! {
            "generic": Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "empty": Binary { subtype: BinarySubtype::Encrypted, bytes: vec![] },
        };
        let mut count = 0;
        collect(&doc, TraverseMatch::Ciphertext, &mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn visitor_error_aborts_traversal() {
        let doc = doc! {
            "a": encrypted_bin(1, b"x"),
            "b": encrypted_bin(1, b"y"),
        };
        let mut visited = 0;
        let err = collect(&doc, TraverseMatch::Ciphertext, &mut |_| {
            visited += 1;
            Err(Error::Cache("stop".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert_eq!(visited, 1);
    }

    #[test]
    fn transform_replaces_under_same_name() {
        let doc = doc! {
            "keep": 1,
            "swap": encrypted_bin(0, b"payload"),
            "nested": {"swap": encrypted_bin(0, b"inner")},
        };
        let out = transform(&doc, TraverseMatch::Marking, &mut |b| {
            Ok(Some(Bson::String(String::from_utf8_lossy(b).into_owned())))
        })
        .unwrap();
        assert_eq!(
            out,
            doc! {
                "keep": 1,
                "swap": "payload",
                "nested": {"swap": "inner"},
            }
        );
    }

    #[test]
    fn transform_none_keeps_original_element() {
        let doc = doc! {
            "arr": [encrypted_bin(1, b"aaa"), encrypted_bin(2, b"bbb")],
        };
        let out = transform(&doc, TraverseMatch::Ciphertext, &mut |b| {
            if b[0] == 1 {
                Ok(Some(Bson::Int32(7)))
            } else {
                Ok(None)
            }
        })
        .unwrap();
        assert_eq!(
            out,
            doc! {"arr": [Bson::Int32(7), Bson::Binary(encrypted_bin(2, b"bbb"))]}
        );
    }

    #[test]
    fn transform_without_matches_is_identity() {
        let doc = doc! {
            "a": 1,
            "b": {"c": [1, 2, {"d": "x"}]},
            "bin": Binary { subtype: BinarySubtype::Generic, bytes: vec![9] },
        };
        let out = transform(&doc, TraverseMatch::Ciphertext, &mut |_| {
            panic!("no matches expected")
        })
        .unwrap();
        assert_eq!(out, doc);
    }
}

//! Content hash of expanded operator trees

use std::fmt;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::expand::ExpandedTree;

/// SHA-256 of the canonical JSON form of an [`ExpandedTree`]
///
/// Argument maps are ordered, so value-equal trees always hash equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashKey([u8; 32]);

/// Streams serializer output straight into the hasher
struct DigestWriter<'a>(&'a mut Sha256);

impl Write for DigestWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl HashKey {
    /// Hash an expanded tree
    pub fn of(tree: &ExpandedTree) -> Result<Self, serde_json::Error> {
        let mut hasher = Sha256::new();
        serde_json::to_writer(DigestWriter(&mut hasher), tree)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashKey({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentObject, DocumentSnapshot, OperatorArgs, OperatorKind, args};
    use crate::expand::expand;

    fn key(kind: OperatorKind, params: &OperatorArgs, doc: &DocumentSnapshot) -> HashKey {
        HashKey::of(&expand(&kind, params, doc, Default::default()).unwrap()).unwrap()
    }

    fn doc_with_tool_width(width: f64) -> DocumentSnapshot {
        [
            DocumentObject::new(
                "Box1",
                OperatorKind::Box,
                args([("Length", 10.0), ("Width", 10.0), ("Height", 10.0)]),
            ),
            DocumentObject::new(
                "Box2",
                OperatorKind::Box,
                args([("Length", 5.0), ("Width", width), ("Height", 5.0)]),
            ),
            DocumentObject::new(
                "Cut1",
                OperatorKind::Cut,
                args([("Base", "Box1"), ("Tool", "Box2")]),
            ),
            DocumentObject::new(
                "Outer",
                OperatorKind::Extrusion,
                args([("Base", "Cut1")]),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let doc = DocumentSnapshot::new();
        let mut a = OperatorArgs::new();
        a.insert("Radius".into(), 1.0.into());
        a.insert("Angle".into(), 90.0.into());
        let mut b = OperatorArgs::new();
        b.insert("Angle".into(), 90.0.into());
        b.insert("Radius".into(), 1.0.into());
        assert_eq!(
            key(OperatorKind::Sphere, &a, &doc),
            key(OperatorKind::Sphere, &b, &doc)
        );
    }

    #[test]
    fn test_equal_trees_from_distinct_documents_hash_equal() {
        let params = args([("Base", "Box1"), ("Tool", "Box2")]);
        assert_eq!(
            key(OperatorKind::Cut, &params, &doc_with_tool_width(5.0)),
            key(OperatorKind::Cut, &params, &doc_with_tool_width(5.0))
        );
    }

    #[test]
    fn test_leaf_change_propagates_to_all_ancestors() {
        let before = doc_with_tool_width(5.0);
        let after = doc_with_tool_width(6.0);
        for name in ["Box2", "Cut1", "Outer"] {
            let object = before.get(name).unwrap();
            assert_ne!(
                key(object.kind.clone(), &object.parameters, &before),
                key(object.kind.clone(), &object.parameters, &after),
                "{} should change",
                name
            );
        }
        let box1 = before.get("Box1").unwrap();
        assert_eq!(
            key(box1.kind.clone(), &box1.parameters, &before),
            key(box1.kind.clone(), &box1.parameters, &after)
        );
    }

    #[test]
    fn test_kind_is_part_of_the_key() {
        let doc = DocumentSnapshot::new();
        let params = args([("Radius", 1.0)]);
        assert_ne!(
            key(OperatorKind::Sphere, &params, &doc),
            key(OperatorKind::Cylinder, &params, &doc)
        );
    }

    #[test]
    fn test_display_is_lowercase_hex() {
        let doc = DocumentSnapshot::new();
        let text = key(OperatorKind::Sphere, &args([("Radius", 1.0)]), &doc).to_string();
        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}

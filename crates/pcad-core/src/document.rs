//! Operator document model
//!
//! A document is a flat set of named objects. Each object names an operator
//! kind and carries the parameters of that operator; boolean and derived
//! operators refer to their operands by object name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The closed set of operator kinds understood by the expander and builders
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperatorKind {
    Box,
    Cylinder,
    Sphere,
    Cone,
    Torus,
    /// Boolean subtraction of `Tool` from `Base`
    Cut,
    /// Multi-shape union over `Shapes`
    Fuse,
    /// Multi-shape intersection over `Shapes`
    Intersection,
    /// Linear sweep of the sketch referenced by `Base`
    Extrusion,
    Sketch,
    /// Geometry imported verbatim from an external file
    RawImport,
    /// Any kind this crate does not know, kept under its original type name
    Passthrough(String),
}

impl OperatorKind {
    /// Parse a document type name
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "Part::Box" => Self::Box,
            "Part::Cylinder" => Self::Cylinder,
            "Part::Sphere" => Self::Sphere,
            "Part::Cone" => Self::Cone,
            "Part::Torus" => Self::Torus,
            "Part::Cut" => Self::Cut,
            "Part::MultiFuse" => Self::Fuse,
            "Part::MultiCommon" => Self::Intersection,
            "Part::Extrusion" => Self::Extrusion,
            "Sketcher::SketchObject" => Self::Sketch,
            "Part::Any" => Self::RawImport,
            other => Self::Passthrough(other.to_string()),
        }
    }

    /// The document type name of this kind
    pub fn type_name(&self) -> &str {
        match self {
            Self::Box => "Part::Box",
            Self::Cylinder => "Part::Cylinder",
            Self::Sphere => "Part::Sphere",
            Self::Cone => "Part::Cone",
            Self::Torus => "Part::Torus",
            Self::Cut => "Part::Cut",
            Self::Fuse => "Part::MultiFuse",
            Self::Intersection => "Part::MultiCommon",
            Self::Extrusion => "Part::Extrusion",
            Self::Sketch => "Sketcher::SketchObject",
            Self::RawImport => "Part::Any",
            Self::Passthrough(name) => name,
        }
    }

    /// Whether this kind is a solid primitive
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Box | Self::Cylinder | Self::Sphere | Self::Cone | Self::Torus
        )
    }
}

impl From<String> for OperatorKind {
    fn from(name: String) -> Self {
        Self::from_type_name(&name)
    }
}

impl From<OperatorKind> for String {
    fn from(kind: OperatorKind) -> Self {
        kind.type_name().to_string()
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A single operator parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Interpret a list of numbers as a fixed-size vector
    pub fn as_vector<const N: usize>(&self) -> Option<[f64; N]> {
        let items = self.as_list()?;
        if items.len() != N {
            return None;
        }
        let mut out = [0.0; N];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_f64()?;
        }
        Some(out)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Operator parameters, ordered by name
pub type OperatorArgs = BTreeMap<String, ParamValue>;

/// Build an [`OperatorArgs`] map from `(name, value)` pairs
pub fn args<I, K, V>(pairs: I) -> OperatorArgs
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParamValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A named entry in the document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentObject {
    /// Name, unique within the document
    pub name: String,
    /// Operator kind
    pub kind: OperatorKind,
    /// Operator parameters
    #[serde(default)]
    pub parameters: OperatorArgs,
}

impl DocumentObject {
    /// Create a new object
    pub fn new(name: impl Into<String>, kind: OperatorKind, parameters: OperatorArgs) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters,
        }
    }
}

/// An edit to a document, as carried between replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentEdit {
    /// Create the object, or replace the object with the same name
    Upsert(DocumentObject),
    /// Delete the named object
    Remove(String),
    /// Rename an object
    Rename { from: String, to: String },
}

/// Serialization format for documents
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentData {
    version: u32,
    objects: Vec<DocumentObject>,
}

/// Owned snapshot of a document: an arena of objects indexed by name
///
/// Expansion and builds read from a snapshot, never from the live replica,
/// so a concurrent edit cannot change the tree halfway through a build.
#[derive(Debug, Clone, Default)]
pub struct DocumentSnapshot {
    objects: Vec<DocumentObject>,
    index: HashMap<String, usize>,
}

impl From<DocumentData> for DocumentSnapshot {
    fn from(data: DocumentData) -> Self {
        let mut doc = Self::new();
        for object in data.objects {
            doc.insert(object);
        }
        doc
    }
}

impl Serialize for DocumentSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let data = DocumentData {
            version: 1,
            objects: self.objects.clone(),
        };
        data.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DocumentSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let data = DocumentData::deserialize(deserializer)?;
        Ok(DocumentSnapshot::from(data))
    }
}

impl FromIterator<DocumentObject> for DocumentSnapshot {
    fn from_iter<T: IntoIterator<Item = DocumentObject>>(iter: T) -> Self {
        let mut doc = Self::new();
        for object in iter {
            doc.insert(object);
        }
        doc
    }
}

impl DocumentSnapshot {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the document has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Insert an object, replacing any object with the same name
    ///
    /// Returns the replaced object, if any.
    pub fn insert(&mut self, object: DocumentObject) -> Option<DocumentObject> {
        match self.index.get(&object.name) {
            Some(&slot) => Some(std::mem::replace(&mut self.objects[slot], object)),
            None => {
                self.index.insert(object.name.clone(), self.objects.len());
                self.objects.push(object);
                None
            }
        }
    }

    /// Get an object by name
    pub fn get(&self, name: &str) -> Option<&DocumentObject> {
        self.index.get(name).map(|&slot| &self.objects[slot])
    }

    /// Get the parameters of an object for editing
    ///
    /// The name itself must be changed through [`Self::rename`].
    pub fn parameters_mut(&mut self, name: &str) -> Option<&mut OperatorArgs> {
        let slot = *self.index.get(name)?;
        Some(&mut self.objects[slot].parameters)
    }

    /// Check whether an object exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Remove an object by name
    pub fn remove(&mut self, name: &str) -> Option<DocumentObject> {
        let slot = self.index.remove(name)?;
        let removed = self.objects.remove(slot);
        for value in self.index.values_mut() {
            if *value > slot {
                *value -= 1;
            }
        }
        Some(removed)
    }

    /// Rename an object
    ///
    /// References held by other objects are not rewritten.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> Result<(), DocumentError> {
        let to = to.into();
        if self.index.contains_key(&to) {
            return Err(DocumentError::NameTaken(to));
        }
        let slot = self
            .index
            .remove(from)
            .ok_or_else(|| DocumentError::ObjectNotFound(from.to_string()))?;
        self.objects[slot].name = to.clone();
        self.index.insert(to, slot);
        Ok(())
    }

    /// Iterate over objects in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &DocumentObject> {
        self.objects.iter()
    }

    /// Apply a replicated edit
    pub fn apply_edit(&mut self, edit: DocumentEdit) -> Result<(), DocumentError> {
        match edit {
            DocumentEdit::Upsert(object) => {
                self.insert(object);
                Ok(())
            }
            DocumentEdit::Remove(name) => self
                .remove(&name)
                .map(|_| ())
                .ok_or(DocumentError::ObjectNotFound(name)),
            DocumentEdit::Rename { from, to } => self.rename(&from, to),
        }
    }

    /// Save document to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        let content = self.to_bytes()?;
        std::fs::write(path.as_ref(), content).map_err(|e| DocumentError::Io(e.to_string()))?;
        Ok(())
    }

    /// Serialize document to RON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| DocumentError::Serialize(e.to_string()))?;
        Ok(content.into_bytes())
    }

    /// Load document from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| DocumentError::Io(e.to_string()))?;
        ron::from_str(&content).map_err(|e| DocumentError::Deserialize(e.to_string()))
    }

    /// Load document from RON bytes
    pub fn load_from_bytes(data: &[u8]) -> Result<Self, DocumentError> {
        let content =
            std::str::from_utf8(data).map_err(|e| DocumentError::Deserialize(e.to_string()))?;
        ron::from_str(content).map_err(|e| DocumentError::Deserialize(e.to_string()))
    }
}

/// Document-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),
    #[error("Object name already in use: {0}")]
    NameTaken(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DocumentSnapshot {
        [
            DocumentObject::new(
                "Box1",
                OperatorKind::Box,
                args([("Length", 10.0), ("Width", 10.0), ("Height", 10.0)]),
            ),
            DocumentObject::new("Sphere1", OperatorKind::Sphere, args([("Radius", 3.0)])),
            DocumentObject::new(
                "Cut1",
                OperatorKind::Cut,
                args([("Base", "Box1"), ("Tool", "Sphere1")]),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_kind_type_names() {
        assert_eq!(OperatorKind::from_type_name("Part::MultiFuse"), OperatorKind::Fuse);
        assert_eq!(OperatorKind::Cut.type_name(), "Part::Cut");
        assert_eq!(
            OperatorKind::from_type_name("Part::Fillet"),
            OperatorKind::Passthrough("Part::Fillet".into())
        );
        assert_eq!(
            OperatorKind::Passthrough("Part::Fillet".into()).type_name(),
            "Part::Fillet"
        );
    }

    #[test]
    fn test_insert_replaces_same_name() {
        let mut doc = sample();
        let replaced = doc.insert(DocumentObject::new(
            "Sphere1",
            OperatorKind::Sphere,
            args([("Radius", 4.0)]),
        ));
        assert!(replaced.is_some());
        assert_eq!(doc.len(), 3);
        assert_eq!(
            doc.get("Sphere1").unwrap().parameters["Radius"],
            ParamValue::Number(4.0)
        );
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut doc = sample();
        assert!(doc.remove("Box1").is_some());
        assert!(doc.get("Box1").is_none());
        assert_eq!(doc.get("Cut1").unwrap().kind, OperatorKind::Cut);
        assert_eq!(doc.get("Sphere1").unwrap().kind, OperatorKind::Sphere);
    }

    #[test]
    fn test_rename() {
        let mut doc = sample();
        doc.rename("Box1", "Block").unwrap();
        assert!(doc.contains("Block"));
        assert!(!doc.contains("Box1"));
        assert!(matches!(
            doc.rename("Block", "Cut1"),
            Err(DocumentError::NameTaken(_))
        ));
        assert!(matches!(
            doc.rename("Missing", "Other"),
            Err(DocumentError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_apply_edits() {
        let mut doc = DocumentSnapshot::new();
        doc.apply_edit(DocumentEdit::Upsert(DocumentObject::new(
            "A",
            OperatorKind::Sphere,
            args([("Radius", 1.0)]),
        )))
        .unwrap();
        doc.apply_edit(DocumentEdit::Rename {
            from: "A".into(),
            to: "B".into(),
        })
        .unwrap();
        assert!(doc.contains("B"));
        doc.apply_edit(DocumentEdit::Remove("B".into())).unwrap();
        assert!(doc.is_empty());
        assert!(doc.apply_edit(DocumentEdit::Remove("B".into())).is_err());
    }

    #[test]
    fn test_ron_roundtrip_preserves_references() {
        let doc = sample();
        let bytes = doc.to_bytes().unwrap();
        let loaded = DocumentSnapshot::load_from_bytes(&bytes).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get("Cut1"), doc.get("Cut1"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ron");
        sample().save(&path).unwrap();
        let loaded = DocumentSnapshot::load(&path).unwrap();
        assert_eq!(
            loaded.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            vec!["Box1", "Sphere1", "Cut1"]
        );
    }

    #[test]
    fn test_vector_param() {
        let value = ParamValue::from(vec![1.0, 2.0, 3.0]);
        assert_eq!(value.as_vector::<3>(), Some([1.0, 2.0, 3.0]));
        assert_eq!(value.as_vector::<2>(), None);
    }
}

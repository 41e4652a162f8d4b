//! The item data model and its BSON wire shape.
//!
//! An item is one DAG node: a header `h` with the document id, version,
//! parent versions, perspective, tombstone and conflict flags and the
//! insertion index, opaque meta data `m`, and the document body `b` as an
//! open map. On the wire and in the data store an item is one BSON document
//! `{h, m, b}`.

use crate::error::Error;
use crate::key;
use anyhow::Result;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, Timestamp};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

/// Default name of the local perspective tree.
pub const DEFAULT_LOCAL: &str = "_local";
/// Default name of the stage tree.
pub const DEFAULT_STAGE: &str = "_stage";
/// Default version byte width.
pub const DEFAULT_VSIZE: usize = 6;
/// Default insertion index byte width.
pub const DEFAULT_ISIZE: usize = 6;

/// Application level document id, opaque bytes without NUL.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Id(Vec<u8>);

impl Id {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        key::validate_id(&bytes)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn to_bson(&self) -> Bson {
        match std::str::from_utf8(&self.0) {
            Ok(s) => Bson::String(s.to_string()),
            Err(_) => Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: self.0.clone(),
            }),
        }
    }

    pub(crate) fn from_bson(bson: &Bson) -> Result<Self> {
        match bson {
            Bson::String(s) => Self::new(s.as_bytes()),
            Bson::Binary(b) => Self::new(b.bytes.clone()),
            other => Err(Error::InvalidItem(format!("id has type {:?}", other.element_type())).into()),
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{}", base64::encode_config(&self.0, base64::URL_SAFE)),
        }
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::str::FromStr for Id {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.as_bytes())
    }
}

/// A short fixed width version, base64 in string contexts.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(SmallVec<[u8; DEFAULT_VSIZE]>);

impl Version {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > key::MAX_LEN {
            return Err(
                Error::InvalidItem(format!("version length {} out of bounds", bytes.len())).into(),
            );
        }
        Ok(Self(SmallVec::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", base64::encode(&self.0[..]))
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::str::FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::decode(s)
            .map_err(|err| Error::InvalidItem(format!("version {:?}: {}", s, err)))?;
        Self::new(&bytes)
    }
}

/// Label of the DAG a node belongs to.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Perspective(String);

impl Perspective {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        key::validate_name(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Perspective {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<str> for Perspective {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl std::str::FromStr for Perspective {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Item header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub id: Id,
    /// Version, absent on virtual merges used during multi LCA reduction.
    pub version: Option<Version>,
    /// Parent versions: empty for roots, one for normal nodes, two or more
    /// for merges.
    pub parents: Vec<Version>,
    pub perspective: Perspective,
    /// Deletion tombstone.
    pub deleted: bool,
    /// Conflict flag.
    pub conflict: bool,
    /// Insertion index, assigned by the tree on write.
    pub index: Option<u64>,
}

impl Header {
    pub fn new(id: Id, perspective: Perspective) -> Self {
        Self {
            id,
            version: None,
            parents: Vec::new(),
            perspective,
            deleted: false,
            conflict: false,
            index: None,
        }
    }
}

/// Opaque item meta data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Meta {
    /// Acknowledged: the item round-tripped through the plain store's
    /// change log.
    pub ack: bool,
    /// Change log pointer of the write that produced the item.
    pub op: Timestamp,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            ack: false,
            op: Timestamp { time: 0, increment: 0 },
        }
    }
}

/// One DAG node.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub header: Header,
    pub meta: Meta,
    pub body: Document,
}

impl Item {
    pub fn new(header: Header, body: Document) -> Self {
        Self {
            header,
            meta: Meta::default(),
            body,
        }
    }

    /// A virtual merge carries parents but no version.
    pub fn is_virtual(&self) -> bool {
        self.header.version.is_none()
    }

    pub fn version(&self) -> Result<&Version> {
        self.header
            .version
            .as_ref()
            .ok_or_else(|| Error::InvalidItem(format!("item for {} has no version", self.header.id)).into())
    }

    /// Validates the header of an item about to be persisted.
    pub fn validate(&self) -> Result<()> {
        key::validate_id(self.header.id.as_bytes())?;
        self.version()?;
        for (n, parent) in self.header.parents.iter().enumerate() {
            if self.header.parents[..n].contains(parent) {
                return Err(
                    Error::InvalidItem(format!("duplicate parent {} on {}", parent, self.header.id))
                        .into(),
                );
            }
        }
        if self
            .header
            .version
            .as_ref()
            .map_or(false, |v| self.header.parents.contains(v))
        {
            return Err(Error::InvalidItem(format!("{} is its own parent", self.header.id)).into());
        }
        Ok(())
    }

    /// Full wire document `{h, m, b}`.
    pub fn to_doc(&self) -> Document {
        let mut h = Document::new();
        h.insert("id", self.header.id.to_bson());
        if let Some(v) = &self.header.version {
            h.insert("v", v.to_string());
        }
        h.insert(
            "pa",
            Bson::Array(
                self.header
                    .parents
                    .iter()
                    .map(|p| Bson::String(p.to_string()))
                    .collect(),
            ),
        );
        h.insert("pe", self.header.perspective.as_str());
        if self.header.deleted {
            h.insert("d", true);
        }
        if self.header.conflict {
            h.insert("c", true);
        }
        if let Some(i) = self.header.index {
            h.insert("i", i as i64);
        }
        let mut m = Document::new();
        m.insert("ack", self.meta.ack);
        m.insert("op", Bson::Timestamp(self.meta.op));
        let mut doc = Document::new();
        doc.insert("h", h);
        doc.insert("m", m);
        doc.insert("b", self.body.clone());
        doc
    }

    /// Wire document with reader projection applied: `h.pa` replaced by
    /// `parents`, `h.pe`, `h.i` and the meta ack/op fields stripped.
    pub fn to_projected_doc(&self, parents: &[Version]) -> Document {
        let mut doc = self.to_doc();
        let h = doc.get_document_mut("h").expect("just inserted");
        h.remove("pe");
        h.remove("i");
        h.insert(
            "pa",
            Bson::Array(parents.iter().map(|p| Bson::String(p.to_string())).collect()),
        );
        doc.remove("m");
        doc
    }

    pub fn from_doc(doc: &Document) -> Result<Self> {
        let h = doc
            .get_document("h")
            .map_err(|_| Error::InvalidItem("missing header".into()))?;
        let id = Id::from_bson(
            h.get("id")
                .ok_or_else(|| Error::InvalidItem("missing h.id".into()))?,
        )?;
        let version = match h.get("v") {
            None | Some(Bson::Null) => None,
            Some(Bson::String(s)) => Some(s.parse()?),
            Some(other) => {
                return Err(
                    Error::InvalidItem(format!("h.v has type {:?}", other.element_type())).into(),
                )
            }
        };
        let parents = match h.get("pa") {
            Some(Bson::Array(pa)) => pa
                .iter()
                .map(|p| match p {
                    Bson::String(s) => s.parse(),
                    other => Err(Error::InvalidItem(format!(
                        "h.pa entry has type {:?}",
                        other.element_type()
                    ))
                    .into()),
                })
                .collect::<Result<Vec<Version>>>()?,
            None => Vec::new(),
            Some(other) => {
                return Err(
                    Error::InvalidItem(format!("h.pa has type {:?}", other.element_type())).into(),
                )
            }
        };
        let perspective = match h.get("pe") {
            Some(Bson::String(s)) => Perspective::new(s.as_str())?,
            _ => return Err(Error::InvalidItem("missing h.pe".into()).into()),
        };
        let deleted = flag(h, "d")?;
        let conflict = flag(h, "c")?;
        let index = match h.get("i") {
            None => None,
            Some(Bson::Int64(i)) if *i >= 0 => Some(*i as u64),
            Some(Bson::Int32(i)) if *i >= 0 => Some(*i as u64),
            Some(other) => {
                return Err(Error::InvalidItem(format!("h.i is {:?}", other)).into());
            }
        };
        let meta = match doc.get_document("m") {
            Ok(m) => Meta {
                ack: m.get_bool("ack").unwrap_or(false),
                op: match m.get("op") {
                    Some(Bson::Timestamp(ts)) => *ts,
                    _ => Timestamp { time: 0, increment: 0 },
                },
            },
            Err(_) => Meta::default(),
        };
        let body = doc.get_document("b").ok().cloned().unwrap_or_default();
        Ok(Self {
            header: Header {
                id,
                version,
                parents,
                perspective,
                deleted,
                conflict,
                index,
            },
            meta,
            body,
        })
    }

    /// Parses an exported wire document (reader projection, `h.pe` and
    /// `h.i` stripped) and binds it to a perspective.
    pub fn from_wire(doc: &Document, perspective: &Perspective) -> Result<Self> {
        let mut doc = doc.clone();
        let h = doc
            .get_document_mut("h")
            .map_err(|_| Error::InvalidItem("missing header".into()))?;
        h.insert("pe", perspective.as_str());
        h.remove("i");
        Self::from_doc(&doc)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.to_doc().to_writer(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let doc = Document::from_reader(bytes)
            .map_err(|err| Error::InvalidItem(format!("not a BSON item: {}", err)))?;
        Self::from_doc(&doc)
    }

    /// Canonical serialization used for content versioning: version,
    /// insertion index and meta are excluded, body keys are sorted, so peers
    /// that reach the same merge serialize the same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut h = Document::new();
        h.insert("id", self.header.id.to_bson());
        h.insert(
            "pa",
            Bson::Array(
                self.header
                    .parents
                    .iter()
                    .map(|p| Bson::String(p.to_string()))
                    .collect(),
            ),
        );
        h.insert("pe", self.header.perspective.as_str());
        h.insert("d", self.header.deleted);
        h.insert("c", self.header.conflict);
        let mut doc = Document::new();
        doc.insert("h", h);
        doc.insert("b", sort_keys(&self.body));
        let mut buf = Vec::new();
        doc.to_writer(&mut buf).expect("serializing to a vec");
        buf
    }

    /// The deterministic content version: SHA-256 of the canonical
    /// serialization, truncated to `v_size` bytes.
    pub fn content_version(&self, v_size: usize) -> Version {
        let digest = Sha256::digest(self.canonical_bytes());
        Version::new(&digest[..v_size]).expect("v_size is 1..=6")
    }

    /// Two items are equivalent if they only differ in insertion index,
    /// conflict flag and meta, the fields the engine assigns. Idempotent
    /// re-writes are detected with this.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.header.id == other.header.id
            && self.header.version == other.header.version
            && self.header.parents == other.header.parents
            && self.header.perspective == other.header.perspective
            && self.header.deleted == other.header.deleted
            && canonical_eq(&Bson::Document(self.body.clone()), &Bson::Document(other.body.clone()))
    }
}

fn flag(h: &Document, name: &str) -> Result<bool> {
    match h.get(name) {
        None => Ok(false),
        Some(Bson::Boolean(b)) => Ok(*b),
        Some(other) => {
            Err(Error::InvalidItem(format!("h.{} has type {:?}", name, other.element_type())).into())
        }
    }
}

/// Rebuilds a document with keys sorted recursively.
pub(crate) fn sort_keys(doc: &Document) -> Document {
    let mut keys = doc.keys().collect::<Vec<_>>();
    keys.sort();
    let mut out = Document::new();
    for k in keys {
        out.insert(k.clone(), sort_keys_bson(doc.get(k).expect("key from iteration")));
    }
    out
}

fn sort_keys_bson(bson: &Bson) -> Bson {
    match bson {
        Bson::Document(doc) => Bson::Document(sort_keys(doc)),
        Bson::Array(arr) => Bson::Array(arr.iter().map(sort_keys_bson).collect()),
        other => other.clone(),
    }
}

/// Value equality irrespective of document key order.
pub(crate) fn canonical_eq(a: &Bson, b: &Bson) -> bool {
    sort_keys_bson(a) == sort_keys_bson(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn item(id: &str, v: &[u8], parents: &[&[u8]], body: Document) -> Item {
        let mut header = Header::new(Id::new(id.as_bytes()).unwrap(), "I".parse().unwrap());
        header.version = Some(Version::new(v).unwrap());
        header.parents = parents.iter().map(|p| Version::new(p).unwrap()).collect();
        Item::new(header, body)
    }

    #[test]
    fn wire_roundtrip() {
        let mut it = item("foo", &[1, 2, 3], &[&[9, 9, 9]], doc! { "baz": "qux" });
        it.header.deleted = true;
        it.header.index = Some(12);
        it.meta.ack = true;
        let bytes = it.to_bytes().unwrap();
        let back = Item::from_bytes(&bytes).unwrap();
        assert_eq!(it, back);
    }

    #[test]
    fn flags_default_to_false_on_the_wire() {
        let it = item("foo", &[1], &[], doc! {});
        let doc = it.to_doc();
        let h = doc.get_document("h").unwrap();
        assert!(h.get("d").is_none());
        assert!(h.get("c").is_none());
        let back = Item::from_doc(&doc).unwrap();
        assert!(!back.header.deleted);
        assert!(!back.header.conflict);
    }

    #[test]
    fn projection_strips_perspective_index_and_meta() {
        let mut it = item("foo", &[1], &[&[2]], doc! { "a": 1 });
        it.header.index = Some(3);
        let surrogate = vec![Version::new(&[7]).unwrap()];
        let doc = it.to_projected_doc(&surrogate);
        let h = doc.get_document("h").unwrap();
        assert!(h.get("pe").is_none());
        assert!(h.get("i").is_none());
        assert!(doc.get("m").is_none());
        assert_eq!(h.get_array("pa").unwrap().len(), 1);
        assert_eq!(h.get_array("pa").unwrap()[0], Bson::String(surrogate[0].to_string()));
    }

    #[test]
    fn content_version_ignores_body_key_order_and_meta() {
        let a = item("foo", &[1], &[], doc! { "x": 1, "y": 2 });
        let mut b = item("foo", &[2], &[], doc! { "y": 2, "x": 1 });
        b.meta.ack = true;
        b.header.index = Some(42);
        assert_eq!(a.content_version(6), b.content_version(6));
        let c = item("foo", &[1], &[], doc! { "x": 1, "y": 3 });
        assert_ne!(a.content_version(6), c.content_version(6));
    }

    #[test]
    fn own_parent_rejected() {
        let it = item("foo", &[1], &[&[1]], doc! {});
        assert!(it.validate().is_err());
    }

    #[test]
    fn version_string_roundtrip() {
        let v = Version::new(&[0, 1, 2, 250, 251, 252]).unwrap();
        let s = v.to_string();
        assert_eq!(s.parse::<Version>().unwrap(), v);
    }
}

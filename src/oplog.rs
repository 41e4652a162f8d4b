//! Contract for consumed change log (oplog) entries.
//!
//! An insert creates a new root (or reconnects a tombstone), a full document
//! update replaces the body, an update with `$` modifiers is applied against
//! the last acknowledged local body, and a delete produces a tombstone.
//! Translation into writes lives in the merge tree; this module only models
//! the entries and modifier application.

use crate::error::Error;
use crate::item::Id;
use anyhow::Result;
use bson::{Bson, Document, Timestamp};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OplogOp {
    Insert,
    Update,
    Delete,
}

impl OplogOp {
    pub fn parse(op: &str) -> Result<Self> {
        match op {
            "i" => Ok(Self::Insert),
            "u" => Ok(Self::Update),
            "d" => Ok(Self::Delete),
            other => Err(Error::InvalidItem(format!("unknown oplog op {:?}", other)).into()),
        }
    }
}

/// One consumed change log record.
#[derive(Clone, Debug)]
pub struct OplogEntry {
    pub op: OplogOp,
    /// Namespace of the plain collection the entry happened in.
    pub ns: String,
    pub ts: Timestamp,
    /// The new document, the update modifier, or the delete criteria.
    pub o: Document,
    /// Update target criteria (`_id`), updates only.
    pub o2: Option<Document>,
}

impl OplogEntry {
    pub fn from_doc(doc: &Document) -> Result<Self> {
        let op = OplogOp::parse(
            doc.get_str("op")
                .map_err(|_| Error::InvalidItem("oplog entry without op".into()))?,
        )?;
        let ns = doc.get_str("ns").unwrap_or_default().to_string();
        let ts = match doc.get("ts") {
            Some(Bson::Timestamp(ts)) => *ts,
            _ => Timestamp { time: 0, increment: 0 },
        };
        let o = doc
            .get_document("o")
            .map_err(|_| Error::InvalidItem("oplog entry without o".into()))?
            .clone();
        let o2 = doc.get_document("o2").ok().cloned();
        Ok(Self { op, ns, ts, o, o2 })
    }

    /// The id of the document the entry applies to.
    pub fn id(&self) -> Result<Id> {
        let id = match self.op {
            OplogOp::Update => self.o2.as_ref().and_then(|o2| o2.get("_id")),
            OplogOp::Insert | OplogOp::Delete => self.o.get("_id"),
        }
        .ok_or_else(|| Error::InvalidItem("oplog entry without _id".into()))?;
        Id::from_bson(id)
    }

    /// True if `o` is an update modifier rather than a full document.
    pub fn is_modifier(&self) -> bool {
        self.o.keys().any(|k| k.starts_with('$'))
    }
}

/// Applies an update modifier document to a base body. Supported modifiers
/// are `$set`, `$unset` and `$inc` with dotted paths; anything else is
/// rejected.
pub fn apply_modifiers(base: &Document, mods: &Document) -> Result<Document> {
    let mut out = base.clone();
    for (op, arg) in mods {
        let arg = arg.as_document().ok_or_else(|| {
            Error::InvalidItem(format!("update modifier {} is not a document", op))
        })?;
        match op.as_str() {
            "$set" => {
                for (path, value) in arg {
                    set_path(&mut out, path, value.clone())?;
                }
            }
            "$unset" => {
                for (path, _) in arg {
                    unset_path(&mut out, path);
                }
            }
            "$inc" => {
                for (path, delta) in arg {
                    let current = get_path(&out, path).cloned();
                    set_path(&mut out, path, add(current.as_ref(), delta)?)?;
                }
            }
            other => {
                return Err(
                    Error::InvalidItem(format!("unsupported update modifier {}", other)).into(),
                )
            }
        }
    }
    Ok(out)
}

fn add(current: Option<&Bson>, delta: &Bson) -> Result<Bson> {
    fn number(bson: &Bson) -> Option<f64> {
        match bson {
            Bson::Int32(n) => Some(*n as f64),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(n) => Some(*n),
            _ => None,
        }
    }
    let delta_n =
        number(delta).ok_or_else(|| Error::InvalidItem(format!("$inc by non-number {}", delta)))?;
    let current_n = match current {
        None => 0.0,
        Some(bson) => number(bson)
            .ok_or_else(|| Error::InvalidItem(format!("$inc of non-number {}", bson)))?,
    };
    let sum = current_n + delta_n;
    let integral = matches!(delta, Bson::Int32(_) | Bson::Int64(_))
        && !matches!(current, Some(Bson::Double(_)));
    Ok(if integral {
        Bson::Int64(sum as i64)
    } else {
        Bson::Double(sum)
    })
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            let inner = doc.get_document_mut(head).expect("just inserted");
            set_path(inner, rest, value)
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Ok(inner) = doc.get_document_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => doc.get_document(head).ok().and_then(|d| get_path(d, rest)),
    }
}

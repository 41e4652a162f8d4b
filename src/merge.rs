//! Pure three-way merge of two document bodies against their lowest common
//! ancestors.
//!
//! With one LCA both sides compute their attribute deltas against it. With
//! two LCAs (one per perspective) each side diffs against its own, which
//! keeps a foreign perspective's narrower field set from reading as a
//! deletion.

use crate::error::Error;
use crate::item::{canonical_eq, Header, Item, Version};
use anyhow::Result;
use bson::{Bson, Document};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq)]
enum Change {
    Added(Bson),
    Changed(Bson),
    Deleted,
}

/// Per attribute delta of `side` against `base`. The `_id` envelope is not
/// diffed.
fn delta(side: &Document, base: &Document) -> BTreeMap<String, Change> {
    let mut changes = BTreeMap::new();
    for (k, v) in side {
        if k == "_id" {
            continue;
        }
        match base.get(k) {
            None => {
                changes.insert(k.clone(), Change::Added(v.clone()));
            }
            Some(b) if !canonical_eq(v, b) => {
                changes.insert(k.clone(), Change::Changed(v.clone()));
            }
            Some(_) => {}
        }
    }
    for k in base.keys() {
        if k != "_id" && !side.contains_key(k) {
            changes.insert(k.clone(), Change::Deleted);
        }
    }
    changes
}

/// Three-way merge of `x` and `y`. `lca_x` is x's lowest common ancestor;
/// `lca_y` is y's own when the sides live on different perspectives, and
/// defaults to `lca_x`.
///
/// Returns the merged item with a fresh header: no version, parents
/// `[x.v, y.v]`, the perspective of `x`, a tombstone only if both sides are
/// tombstones. Conflicting attributes fail the merge with
/// [`Error::MergeConflict`] listing their names.
pub fn merge3(x: &Item, y: &Item, lca_x: &Item, lca_y: Option<&Item>) -> Result<Item> {
    let lca_y = lca_y.unwrap_or(lca_x);
    let dx = delta(&x.body, &lca_x.body);
    let dy = delta(&y.body, &lca_y.body);

    let mut attrs = BTreeSet::new();
    for doc in [&x.body, &y.body, &lca_x.body, &lca_y.body] {
        attrs.extend(doc.keys().filter(|k| *k != "_id").cloned());
    }

    let mut merged = Document::new();
    let mut conflicts = Vec::new();
    for attr in attrs {
        let out = match (dx.get(&attr), dy.get(&attr)) {
            (None, None) => match (x.body.get(&attr), y.body.get(&attr)) {
                (Some(vx), Some(vy)) if canonical_eq(vx, vy) => Some(vx.clone()),
                (Some(_), Some(_)) => {
                    conflicts.push(attr);
                    continue;
                }
                // present in one perspective's field set only, untouched
                (Some(vx), None) => Some(vx.clone()),
                (None, Some(vy)) => Some(vy.clone()),
                (None, None) => None,
            },
            (Some(Change::Added(vx)), None) => match y.body.get(&attr) {
                None => Some(vx.clone()),
                Some(vy) if canonical_eq(vx, vy) => Some(vx.clone()),
                Some(_) => {
                    conflicts.push(attr);
                    continue;
                }
            },
            (None, Some(Change::Added(vy))) => match x.body.get(&attr) {
                None => Some(vy.clone()),
                Some(vx) if canonical_eq(vx, vy) => Some(vy.clone()),
                Some(_) => {
                    conflicts.push(attr);
                    continue;
                }
            },
            (Some(Change::Changed(vx)), None) => Some(vx.clone()),
            (None, Some(Change::Changed(vy))) => Some(vy.clone()),
            (Some(Change::Added(vx)), Some(Change::Added(vy)))
            | (Some(Change::Changed(vx)), Some(Change::Changed(vy)))
            | (Some(Change::Added(vx)), Some(Change::Changed(vy)))
            | (Some(Change::Changed(vx)), Some(Change::Added(vy))) => {
                if canonical_eq(vx, vy) {
                    Some(vx.clone())
                } else {
                    conflicts.push(attr);
                    continue;
                }
            }
            (Some(Change::Deleted), None) | (None, Some(Change::Deleted)) => None,
            (Some(Change::Deleted), Some(Change::Deleted)) => None,
            (Some(Change::Deleted), Some(_)) | (Some(_), Some(Change::Deleted)) => {
                conflicts.push(attr);
                continue;
            }
        };
        if let Some(value) = out {
            merged.insert(attr, value);
        }
    }

    if !conflicts.is_empty() {
        return Err(Error::MergeConflict(conflicts).into());
    }

    let mut header = Header::new(x.header.id.clone(), x.header.perspective.clone());
    header.parents = merge_parents(x, y);
    header.deleted = x.header.deleted && y.header.deleted;
    Ok(Item::new(header, merged))
}

/// Parents of a merged item: the versions of both sides, or for a virtual
/// side (no version) its own parents.
fn merge_parents(x: &Item, y: &Item) -> Vec<Version> {
    let mut parents: Vec<Version> = Vec::new();
    for side in [x, y] {
        let own = match &side.header.version {
            Some(v) => std::slice::from_ref(v),
            None => &side.header.parents[..],
        };
        for v in own {
            if !parents.contains(v) {
                parents.push(v.clone());
            }
        }
    }
    parents
}

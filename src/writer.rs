//! Writer pipeline: ingests foreign perspective batches, guarantees the DAG
//! invariants, ensures local perspective siblings and merges new heads.
//!
//! A batch is processed to completion per id: ancestry checks run against a
//! virtual view chaining the persisted tree with the in-flight items, local
//! siblings are synthesized with perspective bound merges, the surviving new
//! head is merged with the previous local head, and only then is anything
//! persisted. Re-submitting persisted items is a no-op.

use crate::error::Error;
use crate::item::{Header, Id, Item, Meta, Perspective, Version};
use crate::lca::find_lcas;
use crate::merge::merge3;
use crate::tree::{DagRead, Tree};
use anyhow::Result;
use bson::Document;
use std::collections::BTreeMap;

/// The companion unversioned document store the winning local version is
/// synced to.
pub trait PlainStore {
    fn upsert(&mut self, id: &Id, body: &Document) -> Result<()>;
    fn remove(&mut self, id: &Id) -> Result<()>;
}

/// In-memory [`PlainStore`].
#[derive(Debug, Default)]
pub struct MemoryPlainStore {
    docs: BTreeMap<Vec<u8>, Document>,
}

impl MemoryPlainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Id) -> Option<&Document> {
        self.docs.get(id.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl PlainStore for MemoryPlainStore {
    fn upsert(&mut self, id: &Id, body: &Document) -> Result<()> {
        self.docs.insert(id.as_bytes().to_vec(), body.clone());
        Ok(())
    }

    fn remove(&mut self, id: &Id) -> Result<()> {
        self.docs.remove(id.as_bytes());
        Ok(())
    }
}

/// Read-only virtual collection: one or more persisted trees chained with
/// the in-flight batch. Lookups resolve intra-batch parents; nothing is
/// written here.
pub(crate) struct View<'a> {
    label: String,
    trees: Vec<&'a Tree>,
    batch: Vec<Item>,
}

impl<'a> View<'a> {
    pub fn new(label: &str, trees: Vec<&'a Tree>) -> Self {
        Self {
            label: label.to_string(),
            trees,
            batch: Vec::new(),
        }
    }

    pub fn push(&mut self, item: Item) {
        self.batch.push(item);
    }

    pub fn batch(&self) -> &[Item] {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut [Item] {
        &mut self.batch
    }

    fn fold_heads(&self, id: &Id) -> Result<Vec<Item>> {
        let (base, rest) = self.trees.split_first().expect("view over at least one tree");
        let mut heads = Vec::new();
        for entry in base.head_entries(id)? {
            let mut item = base
                .get_by_version(&entry.version)?
                .ok_or_else(|| Error::InvalidItem(format!("dangling head {}", entry.version)))?;
            // the head index carries the authoritative conflict bit
            item.header.conflict = entry.conflict;
            heads.push(item);
        }
        for tree in rest {
            for res in tree.iter_id(id, false) {
                apply_head(&mut heads, res?);
            }
        }
        for item in &self.batch {
            if &item.header.id == id {
                apply_head(&mut heads, item.clone());
            }
        }
        Ok(heads)
    }

    /// The working head of an id: the most recent non-deleted,
    /// non-conflicting candidate, or failing that the most recent tombstone.
    pub fn head(&self, id: &Id) -> Result<Option<Item>> {
        let mut live = None;
        let mut tombstone = None;
        for item in self.fold_heads(id)? {
            if item.header.conflict {
                continue;
            }
            if item.header.deleted {
                tombstone = Some(item);
            } else {
                live = Some(item);
            }
        }
        Ok(live.or(tombstone))
    }
}

fn apply_head(heads: &mut Vec<Item>, item: Item) {
    heads.retain(|h| match &h.header.version {
        Some(v) => !item.header.parents.contains(v),
        None => true,
    });
    heads.push(item);
}

impl DagRead for View<'_> {
    fn label(&self) -> &str {
        &self.label
    }

    fn get_version(&self, version: &Version) -> Result<Option<Item>> {
        for item in self.batch.iter().rev() {
            if item.header.version.as_ref() == Some(version) {
                return Ok(Some(item.clone()));
            }
        }
        for tree in self.trees.iter().rev() {
            if let Some(item) = tree.get_by_version(version)? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn iter_rev<'b>(&'b self, id: &Id) -> Box<dyn Iterator<Item = Result<Item>> + 'b> {
        let batch = self
            .batch
            .iter()
            .rev()
            .filter(|item| &item.header.id == id)
            .map(|item| Ok(item.clone()))
            .collect::<Vec<_>>();
        let mut iter: Box<dyn Iterator<Item = Result<Item>> + 'b> = Box::new(batch.into_iter());
        // newest layer first: in-flight items, then the stage, then the base
        for tree in self.trees.iter().rev() {
            iter = Box::new(iter.chain(tree.iter_id(id, true)));
        }
        iter
    }
}

/// Everything the pipeline needs to know about the local side.
pub(crate) struct WriterCtx<'a> {
    /// The confirmed local tree.
    pub local: &'a Tree,
    /// When staging, new local items land here instead of `local`.
    pub stage: Option<&'a Tree>,
    pub local_perspective: Perspective,
    pub v_size: usize,
    pub proceed_on_error: bool,
}

impl<'a> WriterCtx<'a> {
    fn target(&self) -> &'a Tree {
        self.stage.unwrap_or(self.local)
    }

    fn local_trees(&self) -> Vec<&'a Tree> {
        let mut trees = vec![self.local];
        trees.extend(self.stage);
        trees
    }
}

/// What a remote batch produced.
#[derive(Debug, Default)]
pub(crate) struct IngestOutcome {
    /// Final clean local head per id, in batch order, as persisted.
    pub heads: Vec<Item>,
    /// Engine generated merges with the local head they merged against.
    pub merges: Vec<(Item, Option<Item>)>,
    /// Items persisted into the target (local or stage) tree.
    pub written: usize,
}

/// Ingests one batch of foreign perspective items.
pub(crate) fn ingest_remote(
    ctx: &WriterCtx,
    remote: &Tree,
    items: Vec<Item>,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();
    let pe = match items.first() {
        Some(item) => item.header.perspective.clone(),
        None => return Ok(outcome),
    };
    if pe.as_str() != remote.name() {
        return Err(Error::PerspectiveMismatch {
            expected: remote.name().to_string(),
            actual: pe.to_string(),
        }
        .into());
    }
    for item in &items {
        if item.header.perspective != pe {
            return Err(Error::PerspectiveMismatch {
                expected: pe.to_string(),
                actual: item.header.perspective.to_string(),
            }
            .into());
        }
    }

    // group per id, keeping first-seen order
    let mut groups: Vec<(Id, Vec<Item>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(id, _)| id == &item.header.id) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.header.id.clone(), vec![item])),
        }
    }

    for (id, group) in groups {
        match ingest_remote_id(ctx, remote, &id, group, &mut outcome) {
            Ok(()) => {}
            Err(err) if ctx.proceed_on_error => {
                tracing::warn!("skipping {}: {}", id, err);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(outcome)
}

fn ingest_remote_id(
    ctx: &WriterCtx,
    remote: &Tree,
    id: &Id,
    group: Vec<Item>,
    outcome: &mut IngestOutcome,
) -> Result<()> {
    let mut rv = View::new(remote.name(), vec![remote]);
    // (item, needs persisting)
    let mut accepted: Vec<(Item, bool)> = Vec::new();
    for mut item in group {
        item.validate()?;
        let version = item.version()?.clone();
        if let Some(existing) = rv.get_version(&version)? {
            // replay of a persisted or in-batch item
            if !accepted.iter().any(|(a, _)| a.header.version == existing.header.version) {
                accepted.push((existing, false));
            }
            continue;
        }
        if item.header.parents.is_empty() {
            match rv.head(id)? {
                None => {}
                Some(tail) if tail.header.deleted => {
                    // reconnect the new root to the tombstone
                    item.header.parents = vec![tail.version()?.clone()];
                }
                Some(_) => return Err(Error::RootPreceded(id.to_string()).into()),
            }
        } else {
            for parent in &item.header.parents {
                if rv.get_version(parent)?.is_none() {
                    return Err(Error::ParentNotFound {
                        version: version.to_string(),
                        parent: parent.to_string(),
                    }
                    .into());
                }
            }
        }
        rv.push(item.clone());
        accepted.push((item, true));
    }

    let mut lv = View::new(ctx.local.name(), ctx.local_trees());
    let pre_head = lv.head(id)?;
    for (x, _) in &accepted {
        ensure_local(ctx, &rv, &mut lv, x)?;
    }

    // one-head enforcement over the new local items
    let mut head_positions: Vec<usize> = Vec::new();
    for (n, item) in lv.batch().iter().enumerate() {
        head_positions.retain(|p| {
            let v = lv.batch()[*p].header.version.clone();
            v.map_or(true, |v| !item.header.parents.contains(&v))
        });
        head_positions.push(n);
    }
    let mut clean: Vec<usize> = head_positions
        .iter()
        .copied()
        .filter(|p| {
            let h = &lv.batch()[*p].header;
            !h.conflict && !h.deleted
        })
        .collect();
    for p in clean.iter().skip(1) {
        lv.batch_mut()[*p].header.conflict = true;
        tracing::info!("{}: conflicting new head for {}", ctx.target().name(), id);
    }
    clean.truncate(1);

    // merge the surviving new head with the previous local head
    let mut merged_head: Option<Item> = None;
    if let (Some(p), Some(cur)) = (clean.first().copied(), &pre_head) {
        let new_head = lv.batch()[p].clone();
        if new_head.header.version != cur.header.version && !cur.header.deleted {
            match merge_heads(ctx, &lv, &new_head, cur)? {
                HeadMerge::FastForward => {}
                HeadMerge::Conflict(attrs) => {
                    tracing::info!(
                        "merge conflict for {} on {:?}, flagging {}",
                        id,
                        attrs,
                        new_head.header.version.as_ref().expect("ensured"),
                    );
                    lv.batch_mut()[p].header.conflict = true;
                    clean.clear();
                }
                HeadMerge::Merged(m) => {
                    lv.push(m.clone());
                    merged_head = Some(m.clone());
                    outcome.merges.push((m, Some(cur.clone())));
                }
            }
        }
    }

    // persist: remote originals first, then the new local items
    for (item, persist) in &accepted {
        if *persist {
            remote.write(item)?;
        }
    }
    let target = ctx.target();
    let mut final_head = None;
    let head_version = merged_head
        .as_ref()
        .and_then(|m| m.header.version.clone())
        .or_else(|| clean.first().and_then(|p| lv.batch()[*p].header.version.clone()));
    for item in lv.batch() {
        let stored = target.write(item)?;
        outcome.written += 1;
        if stored.header.version == head_version && head_version.is_some() {
            final_head = Some(stored);
        }
    }
    if let Some(head) = final_head {
        outcome.heads.push(head);
    }
    Ok(())
}

/// Ensures the local perspective sibling of a foreign item, synthesizing its
/// body with a perspective bound merge so fields only the local perspective
/// carries survive.
fn ensure_local(ctx: &WriterCtx, rv: &View, lv: &mut View, x: &Item) -> Result<()> {
    let xv = x.version()?.clone();
    if lv.get_version(&xv)?.is_some() {
        return Ok(());
    }
    let head = lv.head(&x.header.id)?;
    let sibling = match &head {
        None => clone_to_local(ctx, x, x.header.parents.clone(), x.body.clone()),
        Some(l) => {
            let lv_head = l.clone();
            let lcas = find_lcas(x, rv, &lv_head, lv)?;
            if lcas.is_empty() {
                if lv_head.header.deleted && x.header.parents.is_empty() {
                    // reconnect to the local tombstone
                    clone_to_local(ctx, x, vec![lv_head.version()?.clone()], x.body.clone())
                } else {
                    return Err(Error::NoLca(
                        xv.to_string(),
                        lv_head.version()?.to_string(),
                    )
                    .into());
                }
            } else if lcas.len() == 1 && lcas[0] == xv {
                // already part of the local history
                return Ok(());
            } else {
                let (base_x, base_y) = resolve_bases(rv, lv, &lcas)?;
                match merge3(x, &base_y, &base_x, Some(&base_y)) {
                    Ok(merged) => clone_to_local(ctx, x, x.header.parents.clone(), merged.body),
                    Err(err) => match err.downcast_ref::<Error>() {
                        Some(Error::MergeConflict(attrs)) => {
                            tracing::info!(
                                "conflict ensuring {} for {}: {:?}",
                                xv,
                                x.header.id,
                                attrs
                            );
                            let mut sibling =
                                clone_to_local(ctx, x, x.header.parents.clone(), x.body.clone());
                            sibling.header.conflict = true;
                            sibling
                        }
                        _ => return Err(err),
                    },
                }
            }
        }
    };
    for parent in &sibling.header.parents {
        if lv.get_version(parent)?.is_none() {
            return Err(Error::ParentNotFound {
                version: xv.to_string(),
                parent: parent.to_string(),
            }
            .into());
        }
    }
    lv.push(sibling);
    Ok(())
}

fn clone_to_local(ctx: &WriterCtx, x: &Item, parents: Vec<Version>, body: Document) -> Item {
    let mut header = Header::new(x.header.id.clone(), ctx.local_perspective.clone());
    header.version = x.header.version.clone();
    header.parents = parents;
    header.deleted = x.header.deleted;
    let mut item = Item::new(header, body);
    item.meta = Meta {
        ack: false,
        op: x.meta.op,
    };
    item
}

/// The lowest common ancestor items of both sides. With a single LCA each
/// side takes its own copy; multiple LCAs are reduced to one virtual LCA per
/// perspective.
fn resolve_bases(rv: &View, lv: &View, lcas: &[Version]) -> Result<(Item, Item)> {
    if lcas.len() == 1 {
        let base_x = required(rv, &lcas[0])?;
        let base_y = required(lv, &lcas[0])?;
        Ok((base_x, base_y))
    } else {
        Ok((virtual_base(rv, lcas)?, virtual_base(lv, lcas)?))
    }
}

fn required(view: &impl DagRead, version: &Version) -> Result<Item> {
    view.get_version(version)?.ok_or_else(|| {
        Error::InvalidItem(format!("lca {} missing from {}", version, view.label())).into()
    })
}

/// Reduces multiple LCAs to one virtual LCA by merging them pairwise in
/// canonical order, each partial result feeding the next merge.
pub(crate) fn virtual_base(view: &impl DagRead, lcas: &[Version]) -> Result<Item> {
    let mut items = lcas
        .iter()
        .map(|v| required(view, v))
        .collect::<Result<Vec<Item>>>()?;
    items.sort_by(|a, b| {
        (&a.header.version, &a.header.perspective).cmp(&(&b.header.version, &b.header.perspective))
    });
    let mut items = items.into_iter();
    let mut acc = items.next().expect("at least one lca");
    for next in items {
        acc = merge_pair(view, acc, next)?;
    }
    Ok(acc)
}

fn merge_pair(view: &impl DagRead, a: Item, b: Item) -> Result<Item> {
    let lcas = find_lcas(&a, view, &b, view)?;
    if lcas.is_empty() {
        return Err(Error::NoLca(
            a.header.version.as_ref().map(|v| v.to_string()).unwrap_or_default(),
            b.header.version.as_ref().map(|v| v.to_string()).unwrap_or_default(),
        )
        .into());
    }
    if lcas.len() == 1 {
        if a.header.version.as_ref() == Some(&lcas[0]) {
            return Ok(b);
        }
        if b.header.version.as_ref() == Some(&lcas[0]) {
            return Ok(a);
        }
        let base = required(view, &lcas[0])?;
        return merge3(&a, &b, &base, None);
    }
    let base = virtual_base(view, &lcas)?;
    merge3(&a, &b, &base, None)
}

pub(crate) enum HeadMerge {
    FastForward,
    Conflict(Vec<String>),
    Merged(Item),
}

/// Merges a new local head with the current one, generating the
/// deterministic content version for the merge.
pub(crate) fn merge_heads(
    ctx: &WriterCtx,
    lv: &View,
    new_head: &Item,
    cur: &Item,
) -> Result<HeadMerge> {
    let lcas = find_lcas(new_head, lv, cur, lv)?;
    if lcas.is_empty() {
        return Err(Error::NoLca(
            new_head.version()?.to_string(),
            cur.version()?.to_string(),
        )
        .into());
    }
    if lcas.len() == 1
        && (Some(&lcas[0]) == new_head.header.version.as_ref()
            || Some(&lcas[0]) == cur.header.version.as_ref())
    {
        return Ok(HeadMerge::FastForward);
    }
    let base = if lcas.len() == 1 {
        required(lv, &lcas[0])?
    } else {
        virtual_base(lv, &lcas)?
    };
    match merge3(new_head, cur, &base, None) {
        Ok(mut merged) => {
            merged.header.version = Some(merged.content_version(ctx.v_size));
            Ok(HeadMerge::Merged(merged))
        }
        Err(err) => match err.downcast_ref::<Error>() {
            Some(Error::MergeConflict(attrs)) => Ok(HeadMerge::Conflict(attrs.clone())),
            _ => Err(err),
        },
    }
}

/// Appends a fresh local write: the engine picks the parents (the current
/// local head) and generates a content version when the caller supplied
/// none.
pub(crate) fn ingest_local(ctx: &WriterCtx, mut item: Item) -> Result<Item> {
    item.header.perspective = ctx.local_perspective.clone();
    item.header.parents = match ctx.local.head(&item.header.id)? {
        None => Vec::new(),
        Some(head) => vec![head.version()?.clone()],
    };
    if item.header.version.is_none() {
        item.header.version = Some(item.content_version(ctx.v_size));
    }
    ctx.local.write(&item)
}

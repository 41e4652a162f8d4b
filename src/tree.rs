//! Per-perspective append-only store of DAG nodes.
//!
//! All named trees share one ordered keyspace; the tree name prefixes every
//! key (see [`crate::key`]). A node write persists four entries in one
//! atomic batch: the serialized item (dskey), the insertion order index
//! (ikey), the version lookup (vkey) and the head index entry (headkey).

use crate::error::Error;
use crate::item::{Id, Item, Perspective, Version, DEFAULT_ISIZE, DEFAULT_VSIZE};
use crate::key;
use anyhow::Result;
use std::ops::Bound;

/// Width configuration shared by the trees of one store.
#[derive(Clone, Debug)]
pub struct TreeOptions {
    /// Version byte width, 1..=6.
    pub v_size: usize,
    /// Insertion index byte width, 1..=6.
    pub i_size: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            v_size: DEFAULT_VSIZE,
            i_size: DEFAULT_ISIZE,
        }
    }
}

impl TreeOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=6).contains(&self.v_size) {
            return Err(Error::InvalidItem(format!("vSize {} out of range", self.v_size)).into());
        }
        if !(1..=6).contains(&self.i_size) {
            return Err(Error::InvalidItem(format!("iSize {} out of range", self.i_size)).into());
        }
        Ok(())
    }
}

/// One head index entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeadEntry {
    pub version: Version,
    pub conflict: bool,
    pub index: u64,
}

/// Counters over one tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeStats {
    pub items: u64,
    pub heads: u64,
    pub conflicted_heads: u64,
    pub next_index: u64,
}

/// Read access to one DAG, either a persisted tree or a virtual view that
/// chains a tree with in-flight items.
pub trait DagRead {
    /// Identity of the view; two views with one label share one insertion
    /// order.
    fn label(&self) -> &str;

    fn get_version(&self, version: &Version) -> Result<Option<Item>>;

    /// Items of one id in reverse insertion order.
    fn iter_rev<'a>(&'a self, id: &Id) -> Box<dyn Iterator<Item = Result<Item>> + 'a>;

    /// True if `ancestor` is reachable from `from` over parent links. A
    /// version is its own ancestor.
    fn ancestor_of(&self, ancestor: &Version, from: &Version) -> Result<bool> {
        let mut frontier = vec![from.clone()];
        let mut seen = std::collections::HashSet::new();
        while let Some(v) = frontier.pop() {
            if &v == ancestor {
                return Ok(true);
            }
            if !seen.insert(v.clone()) {
                continue;
            }
            if let Some(item) = self.get_version(&v)? {
                frontier.extend(item.header.parents.iter().cloned());
            }
        }
        Ok(false)
    }
}

impl DagRead for Tree {
    fn label(&self) -> &str {
        &self.name
    }

    fn get_version(&self, version: &Version) -> Result<Option<Item>> {
        self.get_by_version(version)
    }

    fn iter_rev<'a>(&'a self, id: &Id) -> Box<dyn Iterator<Item = Result<Item>> + 'a> {
        Box::new(self.iter_id(id, true))
    }
}

/// A named append-only DAG store.
#[derive(Clone)]
pub struct Tree {
    store: sled::Tree,
    name: String,
    v_size: usize,
    i_size: usize,
    /// Items may reference parents persisted elsewhere. Only the stage tree
    /// is partial: its items chain onto the local tree.
    partial: bool,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut m = f.debug_map();
        for res in self.iter_all(false) {
            if let Ok(item) = res {
                m.entry(&(item.header.id.clone(), item.header.index), &item.header.version);
            }
        }
        m.finish()
    }
}

impl Tree {
    pub fn open(store: sled::Tree, name: &str, opts: &TreeOptions) -> Result<Self> {
        key::validate_name(name)?;
        opts.validate()?;
        Ok(Self {
            store,
            name: name.to_string(),
            v_size: opts.v_size,
            i_size: opts.i_size,
            partial: false,
        })
    }

    /// Opens a partial tree: parent existence is not enforced because its
    /// items may chain onto another tree.
    pub fn open_partial(store: sled::Tree, name: &str, opts: &TreeOptions) -> Result<Self> {
        let mut tree = Self::open(store, name, opts)?;
        tree.partial = true;
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn v_size(&self) -> usize {
        self.v_size
    }

    /// The insertion index the next write will receive.
    pub fn next_index(&self) -> Result<u64> {
        match self.store.scan_prefix(key::i_prefix(&self.name)).keys().next_back() {
            Some(last) => Ok(key::parse_i_key(&self.name, &last.map_err(Error::from)?)? + 1),
            None => Ok(0),
        }
    }

    /// Writes one item, assigning the next insertion index and updating the
    /// head index. Re-writing an equivalent (id, version) is an idempotent
    /// no-op returning the persisted item.
    pub fn write(&self, item: &Item) -> Result<Item> {
        item.validate()?;
        let version = item.version()?;
        if let Some(existing) = self.get_by_version(version)? {
            if existing.equivalent(item) {
                return Ok(existing);
            }
            return Err(Error::InvalidItem(format!(
                "version {} already exists in {} with different content",
                version, self.name
            ))
            .into());
        }
        if !self.partial {
            for parent in &item.header.parents {
                match self.get_by_version(parent)? {
                    Some(p) if p.header.id == item.header.id => {}
                    _ => {
                        return Err(Error::ParentNotFound {
                            version: version.to_string(),
                            parent: parent.to_string(),
                        }
                        .into())
                    }
                }
            }
        }

        let i = self.next_index()?;
        if i >= 1 << (8 * self.i_size) {
            return Err(Error::InvalidItem(format!(
                "insertion index {} overflows iSize {}",
                i, self.i_size
            ))
            .into());
        }

        let id = item.header.id.as_bytes();
        let mut batch = sled::Batch::default();

        // parents that are heads stop being heads
        let mut remaining = Vec::new();
        for entry in self.head_entries(&item.header.id)? {
            if item.header.parents.contains(&entry.version) {
                batch.remove(key::head_key(&self.name, id, entry.version.as_bytes()));
            } else {
                remaining.push(entry);
            }
        }

        let mut stored = item.clone();
        stored.header.index = Some(i);
        remaining.push(HeadEntry {
            version: version.clone(),
            conflict: stored.header.conflict,
            index: i,
        });
        let new_head_conflict =
            self.enforce_one_head(&stored, &mut remaining, &mut batch)?;

        let ds = key::ds_key(&self.name, id, i);
        batch.insert(ds.clone(), stored.to_bytes()?);
        batch.insert(key::i_key(&self.name, i), key::head_key(&self.name, id, version.as_bytes()));
        batch.insert(key::v_key(&self.name, version.as_bytes()), ds);
        batch.insert(
            key::head_key(&self.name, id, version.as_bytes()),
            key::head_value(new_head_conflict, i),
        );
        self.store.apply_batch(batch).map_err(Error::from)?;
        Ok(stored)
    }

    /// All but the first non-deleted, non-conflicting head (by insertion
    /// order) get the conflict bit in the head index. Returns the bit for
    /// the head entry of the item being written.
    fn enforce_one_head(
        &self,
        stored: &Item,
        remaining: &mut [HeadEntry],
        batch: &mut sled::Batch,
    ) -> Result<bool> {
        let id = &stored.header.id;
        remaining.sort_by_key(|e| e.index);
        let mut new_head_conflict = stored.header.conflict;
        let mut clean = 0;
        for entry in remaining.iter_mut() {
            if entry.conflict {
                continue;
            }
            let own = Some(&entry.version) == stored.header.version.as_ref();
            let deleted = if own {
                stored.header.deleted
            } else {
                self.load(id, entry.index)?.header.deleted
            };
            if deleted {
                continue;
            }
            clean += 1;
            if clean < 2 {
                continue;
            }
            entry.conflict = true;
            tracing::debug!("{}: conflicting head {} for {}", self.name, entry.version, id);
            if own {
                new_head_conflict = true;
            } else {
                batch.insert(
                    key::head_key(&self.name, id.as_bytes(), entry.version.as_bytes()),
                    key::head_value(true, entry.index),
                );
            }
        }
        Ok(new_head_conflict)
    }

    fn load(&self, id: &Id, i: u64) -> Result<Item> {
        let ds = key::ds_key(&self.name, id.as_bytes(), i);
        let bytes = self
            .store
            .get(ds)
            .map_err(Error::from)?
            .ok_or_else(|| Error::InvalidItem(format!("{}: missing item {} {}", self.name, id, i)))?;
        Item::from_bytes(&bytes)
    }

    /// Version lookup through the version index.
    pub fn get_by_version(&self, version: &Version) -> Result<Option<Item>> {
        let ds = match self.store.get(key::v_key(&self.name, version.as_bytes())).map_err(Error::from)? {
            Some(ds) => ds,
            None => return Ok(None),
        };
        let bytes = self.store.get(&ds).map_err(Error::from)?.ok_or_else(|| {
            Error::InvalidItem(format!("{}: dangling version index for {}", self.name, version))
        })?;
        Ok(Some(Item::from_bytes(&bytes)?))
    }

    pub fn contains_version(&self, version: &Version) -> Result<bool> {
        Ok(self
            .store
            .contains_key(key::v_key(&self.name, version.as_bytes()))
            .map_err(Error::from)?)
    }

    /// Head index entries of one id. Order is stable: by version bytes.
    pub fn head_entries(&self, id: &Id) -> Result<Vec<HeadEntry>> {
        let mut entries = Vec::new();
        for res in self.store.scan_prefix(key::head_prefix(&self.name, id.as_bytes())) {
            let (k, v) = res.map_err(Error::from)?;
            let (_, version) = key::parse_head_key(&self.name, &k)?;
            let (conflict, index) = key::parse_head_value(&v)?;
            entries.push(HeadEntry {
                version: Version::new(version)?,
                conflict,
                index,
            });
        }
        Ok(entries)
    }

    /// Heads of one id as items.
    pub fn heads(&self, id: &Id, skip_deleted: bool, skip_conflicts: bool) -> Result<Vec<Item>> {
        let mut heads = Vec::new();
        for entry in self.head_entries(id)? {
            if skip_conflicts && entry.conflict {
                continue;
            }
            let item = self.load(id, entry.index)?;
            if skip_deleted && item.header.deleted {
                continue;
            }
            heads.push(item);
        }
        Ok(heads)
    }

    /// The current non-conflicting head of an id, tombstone included. At
    /// most one non-deleted, non-conflicting head may exist.
    pub fn head(&self, id: &Id) -> Result<Option<Item>> {
        let mut live = None;
        let mut tombstone: Option<Item> = None;
        for item in self.heads(id, false, true)? {
            if item.header.deleted {
                match &tombstone {
                    Some(t) if t.header.index >= item.header.index => {}
                    _ => tombstone = Some(item),
                }
            } else if live.is_some() {
                return Err(Error::AmbiguousHeads(id.to_string()).into());
            } else {
                live = Some(item);
            }
        }
        Ok(live.or(tombstone))
    }

    /// Walks the whole tree in insertion order.
    pub fn iter_all(&self, reverse: bool) -> impl Iterator<Item = Result<Item>> + '_ {
        let iter = self.store.scan_prefix(key::i_prefix(&self.name));
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if reverse { Box::new(iter.rev()) } else { Box::new(iter) };
        iter.map(move |res| {
            let (k, head) = res.map_err(Error::from)?;
            let i = key::parse_i_key(&self.name, &k)?;
            let (id, _) = key::parse_head_key(&self.name, &head)?;
            self.load(&Id::new(id.to_vec())?, i)
        })
    }

    /// Walks the items of one id in insertion order.
    pub fn iter_id(&self, id: &Id, reverse: bool) -> impl Iterator<Item = Result<Item>> + '_ {
        let iter = self.store.scan_prefix(key::ds_prefix(&self.name, id.as_bytes()));
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            if reverse { Box::new(iter.rev()) } else { Box::new(iter) };
        iter.map(|res| {
            let (_, bytes) = res.map_err(Error::from)?;
            Item::from_bytes(&bytes)
        })
    }

    /// Walks one id between two versions in insertion order.
    pub fn iter_id_range(
        &self,
        id: &Id,
        first: Option<&Version>,
        last: Option<&Version>,
        exclude_first: bool,
        exclude_last: bool,
    ) -> Result<Vec<Item>> {
        let start = match first {
            Some(v) => {
                let i = self.index_of(v)?;
                let k = key::ds_key(&self.name, id.as_bytes(), i);
                if exclude_first {
                    Bound::Excluded(k)
                } else {
                    Bound::Included(k)
                }
            }
            None => Bound::Included(key::ds_prefix(&self.name, id.as_bytes())),
        };
        let end = match last {
            Some(v) => {
                let i = self.index_of(v)?;
                let k = key::ds_key(&self.name, id.as_bytes(), i);
                if exclude_last {
                    Bound::Excluded(k)
                } else {
                    Bound::Included(k)
                }
            }
            None => {
                let mut upper = key::ds_prefix(&self.name, id.as_bytes());
                upper.push(0xff);
                Bound::Excluded(upper)
            }
        };
        let mut items = Vec::new();
        for res in self.store.range((start, end)) {
            let (_, bytes) = res.map_err(Error::from)?;
            items.push(Item::from_bytes(&bytes)?);
        }
        Ok(items)
    }

    /// The first item in insertion order after index `after`, or the very
    /// first item when `after` is `None`. This is the reader's cursor; a
    /// range scan tolerates the gaps the stage tree leaves behind.
    pub fn first_after(&self, after: Option<u64>) -> Result<Option<Item>> {
        let start = match after {
            Some(i) => Bound::Excluded(key::i_key(&self.name, i)),
            None => Bound::Included(key::i_prefix(&self.name)),
        };
        let mut upper = key::i_prefix(&self.name);
        upper.push(0xff);
        match self.store.range((start, Bound::Excluded(upper))).next() {
            Some(res) => {
                let (k, head) = res.map_err(Error::from)?;
                let i = key::parse_i_key(&self.name, &k)?;
                let (id, _) = key::parse_head_key(&self.name, &head)?;
                Ok(Some(self.load(&Id::new(id.to_vec())?, i)?))
            }
            None => Ok(None),
        }
    }

    fn index_of(&self, version: &Version) -> Result<u64> {
        let ds = self
            .store
            .get(key::v_key(&self.name, version.as_bytes()))
            .map_err(Error::from)?
            .ok_or_else(|| Error::OffsetNotFound(version.to_string()))?;
        let (_, i) = key::parse_ds_key(&self.name, &ds)?;
        Ok(i)
    }

    /// The version of the most recently inserted item of a perspective,
    /// used as a replication watermark.
    pub fn last_by_perspective(&self, perspective: &Perspective) -> Result<Option<Version>> {
        for res in self.iter_all(true) {
            let item = res?;
            if &item.header.perspective == perspective {
                return Ok(Some(item.version()?.clone()));
            }
        }
        Ok(None)
    }

    /// Tails inserts on this tree's insertion order index.
    pub fn watch(&self) -> sled::Subscriber {
        self.store.watch_prefix(key::i_prefix(&self.name))
    }

    /// Removes an item and its index entries. Only the stage tree does this,
    /// when promoting confirmed items to local.
    pub fn remove(&self, item: &Item) -> Result<()> {
        let version = item.version()?;
        let i = match item.header.index {
            Some(i) => i,
            None => self.index_of(version)?,
        };
        let id = item.header.id.as_bytes();
        let mut batch = sled::Batch::default();
        batch.remove(key::ds_key(&self.name, id, i));
        batch.remove(key::i_key(&self.name, i));
        batch.remove(key::v_key(&self.name, version.as_bytes()));
        batch.remove(key::head_key(&self.name, id, version.as_bytes()));
        self.store.apply_batch(batch).map_err(Error::from)?;
        Ok(())
    }

    /// Marks the persisted (id, version) as acknowledged. Returns false if
    /// the version is unknown.
    pub(crate) fn ack(&self, version: &Version) -> Result<bool> {
        let ds = match self.store.get(key::v_key(&self.name, version.as_bytes())).map_err(Error::from)? {
            Some(ds) => ds,
            None => return Ok(false),
        };
        let bytes = self.store.get(&ds).map_err(Error::from)?.ok_or_else(|| {
            Error::InvalidItem(format!("{}: dangling version index for {}", self.name, version))
        })?;
        let mut item = Item::from_bytes(&bytes)?;
        if !item.meta.ack {
            item.meta.ack = true;
            self.store.insert(ds, item.to_bytes()?).map_err(Error::from)?;
        }
        Ok(true)
    }

    /// User store entry, arbitrary bytes under a caller chosen key.
    pub fn put_user(&self, user: &[u8], value: &[u8]) -> Result<()> {
        key::validate_id(user)?;
        self.store
            .insert(key::us_key(&self.name, user), value)
            .map_err(Error::from)?;
        Ok(())
    }

    pub fn get_user(&self, user: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .store
            .get(key::us_key(&self.name, user))
            .map_err(Error::from)?
            .map(|v| v.to_vec()))
    }

    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            next_index: self.next_index()?,
            ..TreeStats::default()
        };
        for res in self.store.scan_prefix(key::i_prefix(&self.name)).keys() {
            res.map_err(Error::from)?;
            stats.items += 1;
        }
        for res in self.store.scan_prefix(key::prefix(&self.name, key::HEADKEY)) {
            let (_, v) = res.map_err(Error::from)?;
            let (conflict, _) = key::parse_head_value(&v)?;
            stats.heads += 1;
            if conflict {
                stats.conflicted_heads += 1;
            }
        }
        Ok(stats)
    }
}

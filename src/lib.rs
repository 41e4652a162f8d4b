//! # dagsync
//!
//! A versioned DAG engine for master-master replication of a document
//! collection.
//!
//! ## Perspectives
//! Every document id has one version history per *perspective*: the local
//! one, one per remote peer, and a stage. A history is a DAG of items
//! linked by parent versions; versions are short content hashes, so two
//! peers that reach the same merge reach the same version. A remote item is
//! mirrored into the local perspective under the same version with its
//! parents rewritten to local versions, which is what makes master-master
//! convergence observable: the local tree eventually carries every version
//! of every peer.
//!
//! ## Writer pipeline
//! Foreign batches pass through the writer pipeline: ancestry and parent
//! existence checks against a virtual view (persisted tree plus the
//! in-flight batch), local sibling synthesis with perspective bound
//! three-way merges, single head enforcement, and a deterministic merge of
//! the new head against the previous local one. Merge conflicts are not
//! fatal: the offending head is persisted with its conflict flag and
//! surfaced, never resolved silently.
//!
//! ## Stage
//! With a merge handler configured, new local items are parked in the stage
//! tree. The handler receives every engine generated merge; writing the
//! merge's version back through the local write stream confirms it and
//! atomically promotes the staged prefix to the local tree. Without a
//! handler merges auto confirm.
//!
//! ## Reader
//! The reader streams a filtered, hook transformed projection of a tree
//! from an offset version, optionally tailing new writes. Parent links of
//! suppressed items are rewritten to their nearest filter matching
//! ancestors, so consumers always observe a connected subgraph.
//!
//! ## Storage
//! Everything lives in one ordered byte keyspace (sled). Keys follow a
//! binary grammar (see [`key`]) that sorts data store entries, insertion
//! order, heads and version lookups into adjacent ranges; one item write is
//! one atomic batch over all four.

mod error;
mod item;
pub mod key;
mod lca;
mod merge;
mod mergetree;
mod oplog;
#[cfg(test)]
mod props;
mod reader;
mod tree;
mod writer;

pub use crate::error::Error;
pub use crate::item::{Header, Id, Item, Meta, Perspective, Version};
pub use crate::lca::find_lcas;
pub use crate::merge::merge3;
pub use crate::mergetree::{
    LocalSink, MergeHandler, MergeTree, MergeTreeOptions, RemoteSink, Transform,
};
pub use crate::oplog::{apply_modifiers, OplogEntry, OplogOp};
pub use crate::reader::{Emitted, Hook, Reader, ReaderHandle, ReaderOptions};
pub use crate::tree::{DagRead, HeadEntry, Tree, TreeOptions, TreeStats};
pub use crate::writer::{MemoryPlainStore, PlainStore};

use thiserror::Error;

/// Error taxonomy of the engine.
///
/// Invariants are enforced at write time; readers only ever surface
/// [`Error::Store`]. [`Error::MergeConflict`] is not fatal to a batch, the
/// offending head is persisted with its conflict flag set and the writer
/// pipeline continues with the remaining ids.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or ill-typed header fields.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// Batch with heterogeneous perspectives, or a write under a reserved or
    /// undeclared perspective name.
    #[error("perspective mismatch: expected {expected}, got {actual}")]
    PerspectiveMismatch { expected: String, actual: String },

    /// A new root is only permitted if the previous tail is a deletion
    /// tombstone.
    #[error("root for {0} preceded by non-deleted item")]
    RootPreceded(String),

    /// Multiple non-deleted, non-conflicting heads where one is required.
    #[error("ambiguous heads for {0}")]
    AmbiguousHeads(String),

    /// Three-way merge produced conflicts; carries the attribute names.
    #[error("merge conflict on attributes {0:?}")]
    MergeConflict(Vec<String>),

    /// LCA search found nothing and the tombstone reconnection rule does not
    /// apply.
    #[error("no lowest common ancestor between {0} and {1}")]
    NoLca(String, String),

    /// Reader offset not encountered within the tree as of stream start.
    #[error("offset {0} not found")]
    OffsetNotFound(String),

    /// Referenced parent version missing in the virtual collection.
    #[error("parent {parent} of {version} not found")]
    ParentNotFound { version: String, parent: String },

    /// A local write confirmed a staged version out of order.
    #[error("out of order confirmation of {0}")]
    OutOfOrderConfirmation(String),

    /// Opaque error from the key-value store.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
}

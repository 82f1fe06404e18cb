use std::fmt;

use crate::shape::Shape;

// Blob - a named N-D array with a parallel gradient array
//
// A Blob record is metadata only: its name, its current shape and the two
// storage slots (values and gradients) it resolves to inside a BlobArena.
// Two blobs alias when they resolve to the same slot; nothing else about
// them has to match except the element count.

/// Handle to a blob inside a [`BlobArena`](crate::BlobArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(pub(crate) usize);

impl BlobId {
    /// Position of the blob in its arena.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a storage slot inside a [`BlobArena`](crate::BlobArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

/// Metadata of one blob.
#[derive(Debug, Clone)]
pub struct Blob {
    pub(crate) name: String,
    pub(crate) shape: Shape,
    pub(crate) data: SlotId,
    pub(crate) diff: SlotId,
}

impl Blob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of elements the shape describes.
    pub fn count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Slot holding the values.
    pub fn data_slot(&self) -> SlotId {
        self.data
    }

    /// Slot holding the gradients.
    pub fn diff_slot(&self) -> SlotId {
        self.diff
    }
}

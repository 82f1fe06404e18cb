use crate::blob::{Blob, BlobId, SlotId};
use crate::dtype::{Accumulator, Element, Precision};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::storage::Storage;

// BlobArena - handle-based owner of every blob and its storage
//
// Layers never hold blob references. The graph owns one BlobArena and hands
// layers lists of BlobId handles; every access goes through the arena.
//
// ARCHITECTURE:
//
//   blobs: Vec<Blob>           name, shape, data slot, diff slot
//   slots: Vec<Option<Slot>>   refcounted Storage, None once freed
//
//   share_values(a, b) re-points a's data slot at b's slot. When a slot's
//   refcount drops to zero it is freed and its index is reused.
//
// SHARED RESIZE:
//
//   Reshaping a blob to a new element count resizes its slots in place, so
//   every holder of those slots sees the new length. A holder whose shape no
//   longer matches the slot length is stale: value and gradient access on it
//   fails with StaleAlias until it is reshaped to a matching count. Reshaping
//   a stale blob to the slot's current count allocates nothing.
//
// PRECISION:
//
//   Every slot holds the arena's storage dtype. Kernels either borrow typed
//   slices (values::<S>) or go through the conversion contract
//   (load_values::<S, C> / store_values::<S, C>) when they compute in C.

#[derive(Debug)]
struct Slot {
    storage: Storage,
    refs: usize,
}

/// Owner of blobs and their (possibly shared) storage.
#[derive(Debug)]
pub struct BlobArena {
    precision: Precision,
    byte_limit: Option<usize>,
    blobs: Vec<Blob>,
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
}

impl BlobArena {
    /// Create an empty arena storing values as `precision.storage()`.
    pub fn new(precision: Precision) -> Self {
        BlobArena {
            precision,
            byte_limit: None,
            blobs: Vec::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Create an arena that refuses to hold more than `bytes` of storage.
    pub fn with_byte_limit(precision: Precision, bytes: usize) -> Self {
        let mut arena = BlobArena::new(precision);
        arena.byte_limit = Some(bytes);
        arena
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Number of blobs ever created.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Bytes held by all live slots.
    pub fn bytes_in_use(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.storage.size_in_bytes())
            .sum()
    }

    /// Number of live storage slots.
    pub fn live_slots(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    // Creation

    /// Create a blob with the given shape, values and gradients zeroed.
    pub fn create(&mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Result<BlobId> {
        let shape = shape.into();
        let n = self.checked_count(&shape)?;
        self.check_budget(2 * self.bytes_for(n)?)?;
        let dtype = self.precision.storage();
        let data = self.insert_slot(Storage::zeros(dtype, n)?);
        let diff = self.insert_slot(Storage::zeros(dtype, n)?);
        let id = BlobId(self.blobs.len());
        self.blobs.push(Blob {
            name: name.into(),
            shape,
            data,
            diff,
        });
        Ok(id)
    }

    /// Create a blob with shape `[0]` and no elements.
    pub fn create_empty(&mut self, name: impl Into<String>) -> BlobId {
        let dtype = self.precision.storage();
        let data = self.insert_slot(Storage::from_f64_slice(&[], dtype));
        let diff = self.insert_slot(Storage::from_f64_slice(&[], dtype));
        let id = BlobId(self.blobs.len());
        self.blobs.push(Blob {
            name: name.into(),
            shape: Shape::from(0),
            data,
            diff,
        });
        id
    }

    // Metadata

    pub fn blob(&self, id: BlobId) -> Result<&Blob> {
        self.blobs.get(id.0).ok_or(Error::UnknownBlob(id.0))
    }

    pub fn name(&self, id: BlobId) -> Result<&str> {
        Ok(self.blob(id)?.name())
    }

    pub fn shape(&self, id: BlobId) -> Result<&Shape> {
        Ok(self.blob(id)?.shape())
    }

    /// Element count described by the blob's shape.
    pub fn count(&self, id: BlobId) -> Result<usize> {
        Ok(self.blob(id)?.count())
    }

    /// Find a blob by name (first match).
    pub fn find(&self, name: &str) -> Option<BlobId> {
        self.blobs.iter().position(|b| b.name == name).map(BlobId)
    }

    /// Whether the blob's shape disagrees with its (shared) storage length.
    pub fn is_stale(&self, id: BlobId) -> Result<bool> {
        Ok(self.check_fresh(id).is_err())
    }

    // Reshaping

    /// Change the blob's shape.
    ///
    /// Keeps the storage (and its contents) when the slots already hold the
    /// new element count. Otherwise the slots are replaced with zeroed
    /// storage of the new count, which every blob sharing them observes.
    pub fn reshape(&mut self, id: BlobId, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        let n = self.checked_count(&shape)?;
        let (data, diff) = {
            let b = self.blob(id)?;
            (b.data, b.diff)
        };

        let mut grow = Vec::with_capacity(2);
        for slot in [data, diff] {
            if self.slot(slot)?.storage.len() != n && !grow.contains(&slot) {
                grow.push(slot);
            }
        }
        if !grow.is_empty() {
            let released: usize = grow
                .iter()
                .map(|&s| self.slot(s).map(|s| s.storage.size_in_bytes()))
                .sum::<Result<usize>>()?;
            let wanted = self.bytes_for(n)?.saturating_mul(grow.len());
            self.check_budget(wanted.saturating_sub(released))?;
            for slot in grow {
                let shared = self.slot(slot)?.refs > 1;
                if shared {
                    tracing::debug!(
                        blob = %self.blobs[id.0].name,
                        elems = n,
                        "resizing shared storage slot"
                    );
                }
                let storage = Storage::zeros(self.precision.storage(), n)?;
                self.slot_mut(slot)?.storage = storage;
            }
        }
        self.blobs[id.0].shape = shape;
        Ok(())
    }

    /// Adopt the shape of another blob.
    pub fn reshape_like(&mut self, id: BlobId, other: BlobId) -> Result<()> {
        let shape = self.shape(other)?.clone();
        self.reshape(id, shape)
    }

    // Aliasing

    /// Make `id` resolve its values to `other`'s value slot.
    pub fn share_values(&mut self, id: BlobId, other: BlobId) -> Result<()> {
        self.check_share(id, other)?;
        let target = self.blobs[other.0].data;
        let old = std::mem::replace(&mut self.blobs[id.0].data, target);
        self.retarget(old, target)
    }

    /// Make `id` resolve its gradients to `other`'s gradient slot.
    pub fn share_diff(&mut self, id: BlobId, other: BlobId) -> Result<()> {
        self.check_share(id, other)?;
        let target = self.blobs[other.0].diff;
        let old = std::mem::replace(&mut self.blobs[id.0].diff, target);
        self.retarget(old, target)
    }

    /// Turn `id` into a view of `source` with a different shape of the same
    /// element count: both values and gradients are shared, nothing is copied.
    pub fn alias_as(&mut self, id: BlobId, source: BlobId, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        self.check_fresh(source)?;
        let src = self.count(source)?;
        let dst = self.checked_count(&shape)?;
        if src != dst {
            return Err(Error::ReshapeElementMismatch {
                src,
                dst,
                dst_shape: shape,
            });
        }
        self.blob(id)?;
        let (data, diff) = (self.blobs[source.0].data, self.blobs[source.0].diff);
        let old = std::mem::replace(&mut self.blobs[id.0].data, data);
        self.retarget(old, data)?;
        let old = std::mem::replace(&mut self.blobs[id.0].diff, diff);
        self.retarget(old, diff)?;
        self.blobs[id.0].shape = shape;
        Ok(())
    }

    /// Whether two blobs resolve their values to the same slot.
    pub fn is_alias(&self, a: BlobId, b: BlobId) -> Result<bool> {
        Ok(self.blob(a)?.data == self.blob(b)?.data)
    }

    /// Whether two blobs resolve their gradients to the same slot.
    pub fn is_diff_alias(&self, a: BlobId, b: BlobId) -> Result<bool> {
        Ok(self.blob(a)?.diff == self.blob(b)?.diff)
    }

    /// Give `id` its own value slot again (a copy of the current contents).
    pub fn unshare_values(&mut self, id: BlobId) -> Result<()> {
        let slot = self.blob(id)?.data;
        if self.slot(slot)?.refs == 1 {
            return Ok(());
        }
        let storage = self.slot(slot)?.storage.clone();
        self.check_budget(storage.size_in_bytes())?;
        let fresh = self.insert_slot(storage);
        self.blobs[id.0].data = fresh;
        self.release(slot)
    }

    // Typed access

    /// Read-only storage-typed values.
    pub fn values<S: Element>(&self, id: BlobId) -> Result<&[S]> {
        self.check_fresh(id)?;
        self.slot(self.blobs[id.0].data)?.storage.as_slice()
    }

    /// Exclusive storage-typed values.
    pub fn values_mut<S: Element>(&mut self, id: BlobId) -> Result<&mut [S]> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].data;
        self.slot_mut(slot)?.storage.as_mut_slice()
    }

    /// Read-only storage-typed gradients.
    pub fn diff<S: Element>(&self, id: BlobId) -> Result<&[S]> {
        self.check_fresh(id)?;
        self.slot(self.blobs[id.0].diff)?.storage.as_slice()
    }

    /// Exclusive storage-typed gradients.
    pub fn diff_mut<S: Element>(&mut self, id: BlobId) -> Result<&mut [S]> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].diff;
        self.slot_mut(slot)?.storage.as_mut_slice()
    }

    /// The untyped value storage (for persistence).
    pub fn values_storage(&self, id: BlobId) -> Result<&Storage> {
        self.check_fresh(id)?;
        Ok(&self.slot(self.blobs[id.0].data)?.storage)
    }

    /// Overwrite the values from storage of any dtype with the same length.
    pub fn load_storage(&mut self, id: BlobId, storage: &Storage) -> Result<()> {
        self.check_fresh(id)?;
        let expected = self.count(id)?;
        if storage.len() != expected {
            return Err(Error::msg(format!(
                "blob '{}' holds {expected} elements, got {}",
                self.blobs[id.0].name,
                storage.len()
            )));
        }
        let converted = storage.cast(self.precision.storage());
        let slot = self.blobs[id.0].data;
        self.slot_mut(slot)?.storage = converted;
        Ok(())
    }

    // Conversion contract

    /// Values widened into the compute type.
    pub fn load_values<S: Element, C: Accumulator>(&self, id: BlobId) -> Result<Vec<C>> {
        Ok(self.values::<S>(id)?.iter().map(|&s| C::load(s)).collect())
    }

    /// Gradients widened into the compute type.
    pub fn load_diff<S: Element, C: Accumulator>(&self, id: BlobId) -> Result<Vec<C>> {
        Ok(self.diff::<S>(id)?.iter().map(|&s| C::load(s)).collect())
    }

    /// Write compute-typed results into the values, rounding once per element.
    pub fn store_values<S: Element, C: Accumulator>(&mut self, id: BlobId, src: &[C]) -> Result<()> {
        let dst = self.values_mut::<S>(id)?;
        store_into(dst, src)
    }

    /// Write compute-typed results into the gradients.
    pub fn store_diff<S: Element, C: Accumulator>(&mut self, id: BlobId, src: &[C]) -> Result<()> {
        let dst = self.diff_mut::<S>(id)?;
        store_into(dst, src)
    }

    /// Add compute-typed contributions to the gradients (`diff += src`).
    /// The addition happens in `C`; only the result is rounded.
    pub fn accumulate_diff<S: Element, C: Accumulator>(
        &mut self,
        id: BlobId,
        src: &[C],
    ) -> Result<()> {
        let dst = self.diff_mut::<S>(id)?;
        if dst.len() != src.len() {
            return Err(Error::msg(format!(
                "accumulate_diff: blob holds {} elements, got {}",
                dst.len(),
                src.len()
            )));
        }
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = (C::load(*d) + s).store();
        }
        Ok(())
    }

    // Convenience I/O in f64

    pub fn to_f64_values(&self, id: BlobId) -> Result<Vec<f64>> {
        self.check_fresh(id)?;
        Ok(self.slot(self.blobs[id.0].data)?.storage.to_f64_vec())
    }

    pub fn to_f64_diff(&self, id: BlobId) -> Result<Vec<f64>> {
        self.check_fresh(id)?;
        Ok(self.slot(self.blobs[id.0].diff)?.storage.to_f64_vec())
    }

    pub fn set_values_f64(&mut self, id: BlobId, data: &[f64]) -> Result<()> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].data;
        self.slot_mut(slot)?.storage.copy_from_f64(data)
    }

    pub fn set_diff_f64(&mut self, id: BlobId, data: &[f64]) -> Result<()> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].diff;
        self.slot_mut(slot)?.storage.copy_from_f64(data)
    }

    pub fn fill_values(&mut self, id: BlobId, value: f64) -> Result<()> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].data;
        self.slot_mut(slot)?.storage.fill(value);
        Ok(())
    }

    pub fn fill_diff(&mut self, id: BlobId, value: f64) -> Result<()> {
        self.check_fresh(id)?;
        let slot = self.blobs[id.0].diff;
        self.slot_mut(slot)?.storage.fill(value);
        Ok(())
    }

    pub fn zero_diff(&mut self, id: BlobId) -> Result<()> {
        self.fill_diff(id, 0.0)
    }

    /// Copy the values of `src` into `dst` (element counts must agree).
    pub fn copy_values(&mut self, src: BlobId, dst: BlobId) -> Result<()> {
        self.check_fresh(src)?;
        self.check_fresh(dst)?;
        let (from, to) = (self.blobs[src.0].data, self.blobs[dst.0].data);
        if from == to {
            return Ok(());
        }
        let (a, b) = (self.count(src)?, self.count(dst)?);
        if a != b {
            return Err(Error::ReshapeElementMismatch {
                src: a,
                dst: b,
                dst_shape: self.blobs[dst.0].shape.clone(),
            });
        }
        let storage = self.slot(from)?.storage.clone();
        self.slot_mut(to)?.storage = storage;
        Ok(())
    }

    /// Legacy accessor: value at (n, c, h, w), widened to f64.
    pub fn value_at(&self, id: BlobId, n: usize, c: usize, h: usize, w: usize) -> Result<f64> {
        let offset = self.shape(id)?.offset(n, c, h, w)?;
        self.check_fresh(id)?;
        Ok(element_f64(&self.slot(self.blobs[id.0].data)?.storage, offset))
    }

    /// Legacy accessor: gradient at (n, c, h, w), widened to f64.
    pub fn diff_at(&self, id: BlobId, n: usize, c: usize, h: usize, w: usize) -> Result<f64> {
        let offset = self.shape(id)?.offset(n, c, h, w)?;
        self.check_fresh(id)?;
        Ok(element_f64(&self.slot(self.blobs[id.0].diff)?.storage, offset))
    }

    // Internals

    fn checked_count(&self, shape: &Shape) -> Result<usize> {
        let n = shape.checked_elem_count().ok_or_else(|| Error::Allocation {
            requested_bytes: usize::MAX,
            reason: format!("element count of shape {shape} overflows"),
        })?;
        self.bytes_for(n)?;
        Ok(n)
    }

    fn bytes_for(&self, n: usize) -> Result<usize> {
        n.checked_mul(self.precision.storage().size_in_bytes())
            .ok_or_else(|| Error::Allocation {
                requested_bytes: usize::MAX,
                reason: format!("{n} elements overflow the address space"),
            })
    }

    fn check_budget(&self, additional: usize) -> Result<()> {
        if let Some(limit) = self.byte_limit {
            let in_use = self.bytes_in_use();
            if in_use.saturating_add(additional) > limit {
                return Err(Error::Allocation {
                    requested_bytes: additional,
                    reason: format!("arena limit of {limit} bytes ({in_use} in use)"),
                });
            }
        }
        Ok(())
    }

    fn check_fresh(&self, id: BlobId) -> Result<()> {
        let b = self.blob(id)?;
        let n = b.count();
        for slot in [b.data, b.diff] {
            let len = self.slot(slot)?.storage.len();
            if len != n {
                return Err(Error::StaleAlias {
                    blob: b.name.clone(),
                    shape: b.shape.clone(),
                    storage_len: len,
                });
            }
        }
        Ok(())
    }

    fn check_share(&self, id: BlobId, other: BlobId) -> Result<()> {
        self.check_fresh(other)?;
        let (a, b) = (self.count(id)?, self.count(other)?);
        if a != b {
            return Err(Error::ReshapeElementMismatch {
                src: b,
                dst: a,
                dst_shape: self.blobs[id.0].shape.clone(),
            });
        }
        Ok(())
    }

    fn slot(&self, id: SlotId) -> Result<&Slot> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::msg(format!("storage slot {} was freed", id.0)))
    }

    fn slot_mut(&mut self, id: SlotId) -> Result<&mut Slot> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::msg(format!("storage slot {} was freed", id.0)))
    }

    fn insert_slot(&mut self, storage: Storage) -> SlotId {
        let slot = Slot { storage, refs: 1 };
        match self.free_slots.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                SlotId(i)
            }
            None => {
                self.slots.push(Some(slot));
                SlotId(self.slots.len() - 1)
            }
        }
    }

    fn retarget(&mut self, old: SlotId, new: SlotId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        self.slot_mut(new)?.refs += 1;
        self.release(old)
    }

    fn release(&mut self, id: SlotId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        slot.refs -= 1;
        if slot.refs == 0 {
            self.slots[id.0] = None;
            self.free_slots.push(id.0);
        }
        Ok(())
    }
}

fn store_into<S: Element, C: Accumulator>(dst: &mut [S], src: &[C]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::msg(format!(
            "store: blob holds {} elements, got {}",
            dst.len(),
            src.len()
        )));
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s.store();
    }
    Ok(())
}

fn element_f64(storage: &Storage, offset: usize) -> f64 {
    match storage {
        Storage::F16(v) => v[offset].to_f64(),
        Storage::BF16(v) => v[offset].to_f64(),
        Storage::F32(v) => v[offset] as f64,
        Storage::F64(v) => v[offset],
    }
}

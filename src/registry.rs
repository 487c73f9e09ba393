// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-handle resource registries.
//!
//! Every open handle owns one table of mapped MMIO regions and one table of
//! pinned workspaces. The mapping itself happens elsewhere; these tables only
//! record what must be torn down together with the handle.
//!
//! Identifiers carry the id of the owning handle and a sequence number that
//! is never reused while the handle is open, so a stale identifier or one
//! taken from another handle always resolves to [`FpgaError::NotFound`].

use crate::error::{FpgaError, FpgaResult};
use crate::handle::HandleId;
use std::collections::HashMap;
use std::marker::PhantomData;

/// Record type that can be stored in a [`Registry`].
pub trait Resource {
    /// Short name used in error messages and logs.
    const KIND: &'static str;
}

/// A memory-mapped register window of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioRegion {
    /// MMIO space index (BAR / port region number).
    pub index: u32,
    /// User virtual address of the mapping.
    pub addr: u64,
    /// Mapping length in bytes.
    pub len: usize,
}

impl Resource for MmioRegion {
    const KIND: &'static str = "mmio";
}

/// A pinned buffer shared with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workspace {
    /// User virtual address of the buffer.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: usize,
    /// IO virtual address the device uses for the buffer.
    pub iova: u64,
}

impl Resource for Workspace {
    const KIND: &'static str = "workspace";
}

/// Identifier of a registered resource, scoped to one handle.
pub struct ResourceId<T> {
    owner: HandleId,
    seq: u64,
    _kind: PhantomData<fn() -> T>,
}

/// Identifier of a registered MMIO region.
pub type MmioId = ResourceId<MmioRegion>;

/// Identifier of a registered workspace.
pub type WorkspaceId = ResourceId<Workspace>;

impl<T> ResourceId<T> {
    /// Handle that issued this identifier.
    pub fn owner(&self) -> HandleId {
        self.owner
    }

    /// Sequence number within the owning handle.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

// Manual impls: derives would require `T` itself to be Copy/Eq/Hash.
impl<T> Clone for ResourceId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ResourceId<T> {}

impl<T> PartialEq for ResourceId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.seq == other.seq
    }
}

impl<T> Eq for ResourceId<T> {}

impl<T> std::hash::Hash for ResourceId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.seq.hash(state);
    }
}

impl<T: Resource> std::fmt::Debug for ResourceId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}.{}", T::KIND, self.owner.as_u64(), self.seq)
    }
}

impl<T: Resource> std::fmt::Display for ResourceId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Table of resources registered against one handle.
#[derive(Debug)]
pub struct Registry<T> {
    owner: HandleId,
    next_seq: u64,
    entries: HashMap<u64, T>,
}

impl<T: Resource> Registry<T> {
    pub(crate) fn new(owner: HandleId) -> Self {
        Self {
            owner,
            next_seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Add a record and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`FpgaError::NoMemory`] if the table cannot grow.
    pub fn register(&mut self, record: T) -> FpgaResult<ResourceId<T>> {
        self.entries.try_reserve(1).map_err(|e| {
            FpgaError::NoMemory(format!("cannot grow {} table: {}", T::KIND, e))
        })?;

        let seq = self.next_seq;
        self.next_seq = seq.checked_add(1).ok_or_else(|| {
            FpgaError::NoMemory(format!("{} identifiers exhausted", T::KIND))
        })?;
        self.entries.insert(seq, record);

        Ok(ResourceId {
            owner: self.owner,
            seq,
            _kind: PhantomData,
        })
    }

    /// Look up a record.
    ///
    /// # Errors
    ///
    /// Returns [`FpgaError::NotFound`] if the identifier was issued by
    /// another handle, was never issued, or has been deregistered.
    pub fn lookup(&self, id: ResourceId<T>) -> FpgaResult<&T> {
        self.check_owner(id)?;
        self.entries
            .get(&id.seq)
            .ok_or_else(|| FpgaError::NotFound(format!("{} not registered", id)))
    }

    /// Remove a record without releasing it.
    pub(crate) fn remove(&mut self, id: ResourceId<T>) -> FpgaResult<T> {
        self.check_owner(id)?;
        self.entries
            .remove(&id.seq)
            .ok_or_else(|| FpgaError::NotFound(format!("{} not registered", id)))
    }

    /// Remove every record, newest first.
    pub(crate) fn drain_newest_first(&mut self) -> Vec<(ResourceId<T>, T)> {
        let owner = self.owner;
        let mut drained: Vec<(ResourceId<T>, T)> = self
            .entries
            .drain()
            .map(|(seq, record)| {
                let id = ResourceId {
                    owner,
                    seq,
                    _kind: PhantomData,
                };
                (id, record)
            })
            .collect();
        drained.sort_by(|a, b| b.0.seq.cmp(&a.0.seq));
        drained
    }

    /// Identifiers of all registered records, oldest first.
    pub fn ids(&self) -> Vec<ResourceId<T>> {
        let mut seqs: Vec<u64> = self.entries.keys().copied().collect();
        seqs.sort_unstable();
        seqs.into_iter()
            .map(|seq| ResourceId {
                owner: self.owner,
                seq,
                _kind: PhantomData,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_owner(&self, id: ResourceId<T>) -> FpgaResult<()> {
        if id.owner != self.owner {
            return Err(FpgaError::NotFound(format!(
                "{} belongs to another handle",
                id
            )));
        }
        Ok(())
    }
}

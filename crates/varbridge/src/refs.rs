//! Reference table: small integer handles for values that cannot cross the wire.
//!
//! Handles start at 1 (0 means "no reference"). Released handles go onto a free list
//! and are reused before a new integer is minted. The free list starts empty and only
//! grows when a held handle is released.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReferenceError;

/// Default capacity of a reference table.
pub const DEFAULT_MAX_HANDLES: usize = 4096;

/// Name of a value held on the responding side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Build a handle from its wire value. Zero and negative values name nothing.
    pub fn from_wire(raw: i32) -> Result<Self, ReferenceError> {
        if raw <= 0 {
            return Err(ReferenceError::NullHandle);
        }
        Ok(Self(raw as u32))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn to_wire(self) -> i32 {
        self.0 as i32
    }

    fn slot(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Values pinned behind handles, plus the pending-result slot.
#[derive(Debug)]
pub struct ReferenceTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<Handle>,
    pending: Option<Handle>,
    max_handles: usize,
}

impl<T> Default for ReferenceTable<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDLES)
    }
}

impl<T> ReferenceTable<T> {
    pub fn new(max_handles: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pending: None,
            max_handles: max_handles.min(i32::MAX as usize),
        }
    }

    /// Pin a value, reusing a released handle when one is available.
    pub fn hold(&mut self, value: T) -> Result<Handle, ReferenceError> {
        if let Some(handle) = self.free.pop() {
            self.slots[handle.slot()] = Some(value);
            tracing::trace!(%handle, "Reused reference handle");
            return Ok(handle);
        }

        if self.slots.len() >= self.max_handles {
            return Err(ReferenceError::Exhausted(self.slots.len()));
        }

        self.slots.push(Some(value));
        let handle = Handle(self.slots.len() as u32);
        tracing::trace!(%handle, "Minted reference handle");
        Ok(handle)
    }

    pub fn resolve(&self, handle: Handle) -> Result<&T, ReferenceError> {
        self.slots
            .get(handle.slot())
            .and_then(Option::as_ref)
            .ok_or(ReferenceError::NotHeld(handle))
    }

    pub fn resolve_mut(&mut self, handle: Handle) -> Result<&mut T, ReferenceError> {
        self.slots
            .get_mut(handle.slot())
            .and_then(Option::as_mut)
            .ok_or(ReferenceError::NotHeld(handle))
    }

    /// Swap the value behind a live handle.
    pub fn replace(&mut self, handle: Handle, value: T) -> Result<T, ReferenceError> {
        let slot = self.resolve_mut(handle)?;
        Ok(std::mem::replace(slot, value))
    }

    /// Free a handle. Releasing a handle that is not held is reported, never applied.
    pub fn release(&mut self, handle: Handle) -> Result<T, ReferenceError> {
        let value = self
            .slots
            .get_mut(handle.slot())
            .and_then(Option::take)
            .ok_or(ReferenceError::NotHeld(handle))?;

        if self.pending == Some(handle) {
            self.pending = None;
        }
        self.free.push(handle);
        tracing::trace!(%handle, "Released reference handle");
        Ok(value)
    }

    /// Hold a value as the pending result of the last cycle.
    ///
    /// An older pending value nobody claimed is released first.
    pub fn hold_pending(&mut self, value: T) -> Result<Handle, ReferenceError> {
        if let Some(stale) = self.pending.take() {
            tracing::debug!(handle = %stale, "Dropping unclaimed pending result");
            let _ = self.release(stale);
        }
        let handle = self.hold(value)?;
        self.pending = Some(handle);
        Ok(handle)
    }

    /// Claim the pending result. The value stays held under the returned handle.
    pub fn take_pending(&mut self) -> Option<(Handle, &T)> {
        let handle = self.pending.take()?;
        self.resolve(handle).ok().map(|value| (handle, value))
    }

    pub fn pending(&self) -> Option<Handle> {
        self.pending
    }

    pub fn is_held(&self, handle: Handle) -> bool {
        self.resolve(handle).is_ok()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

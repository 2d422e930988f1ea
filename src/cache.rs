//! Last-known instrument parameters with a dirty flag.
//!
//! Writes only record what was commanded and mark the value unconfirmed. Reads
//! of a clean value never touch the device; reads of a dirty value run exactly
//! one query and confirm the result.

use std::future::Future;

/// A cached parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedParameter<T> {
    value: T,
    dirty: bool,
}

impl<T: Clone> CachedParameter<T> {
    /// A value known to match the device.
    pub fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    /// A placeholder that must be confirmed before it is trusted.
    pub fn unconfirmed(value: T) -> Self {
        Self { value, dirty: true }
    }

    /// Last known value, confirmed or not.
    pub fn peek(&self) -> &T {
        &self.value
    }

    /// True while the value is unconfirmed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Records a commanded value; it stays dirty until confirmed.
    pub fn record_write(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }

    /// Edits the commanded value in place and marks it dirty.
    pub fn modify(&mut self, edit: impl FnOnce(&mut T)) {
        edit(&mut self.value);
        self.dirty = true;
    }

    /// Stores a value read back from the device.
    pub fn confirm(&mut self, value: T) {
        self.value = value;
        self.dirty = false;
    }

    /// Forgets that the value was confirmed.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    /// Returns the cached value, refreshing it first when dirty.
    ///
    /// On a failed refresh the parameter stays dirty and the error is returned.
    pub async fn get_or_refresh<F, Fut, E>(&mut self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.dirty {
            return Ok(self.value.clone());
        }
        let value = refresh().await?;
        self.confirm(value.clone());
        Ok(value)
    }
}

impl<T: Clone + Default> Default for CachedParameter<T> {
    fn default() -> Self {
        Self::unconfirmed(T::default())
    }
}

//! Owner id remapping for extracted archive entries.

use anyhow::Result;

use crate::error::StoreError;

/// A contiguous block of host ids that archive owner ids are shifted into.
///
/// The zero range performs no remapping at all; otherwise an archive id `u`
/// maps to `u + offset` and ids at or past `size` are rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UidRange {
    pub offset: u64,
    pub size: u64,
}

impl UidRange {
    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// The identity range: ids pass through unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    /// Shift an archive owner id into the host range.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::UidRange`] when the id falls outside the
    /// range (and the range is not the identity).
    pub fn remap(&self, id: u64) -> Result<u64> {
        if self.is_identity() {
            return Ok(id);
        }
        if id < self.size {
            Ok(id + self.offset)
        } else {
            Err(StoreError::UidRange {
                id,
                size: self.size,
            }
            .into())
        }
    }
}

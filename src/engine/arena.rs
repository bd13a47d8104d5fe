//! Committed arena storage backing all runtime tensors of one graph.
//!
//! The arena is one contiguous host buffer sized by the planner and bound
//! at allocate time. It is released when the owning graph instance drops,
//! one ownership unit with deterministic teardown.

use crate::error::AllocError;

use super::planner::Binding;

/// One physically backed arena buffer.
///
/// Backed by `u64` words so the base pointer is 8-byte aligned; combined
/// with the planner's 64-byte offset alignment, every element type can be
/// cast in place from its binding.
#[derive(Debug)]
pub(crate) struct Arena {
    words: Vec<u64>,
    len_bytes: usize,
}

impl Arena {
    /// Commit backing storage for `total_bytes`.
    ///
    /// Fails with [`AllocError::OutOfMemory`] when the host cannot provide
    /// the reservation.
    pub(crate) fn commit(total_bytes: usize) -> Result<Self, AllocError> {
        let n_words = total_bytes.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(n_words)
            .map_err(|_| AllocError::OutOfMemory(total_bytes))?;
        words.resize(n_words, 0);
        Ok(Self {
            words,
            len_bytes: total_bytes,
        })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len_bytes]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len_bytes;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..len]
    }

    /// Shared view of one bound tensor.
    pub(crate) fn slice(&self, binding: &Binding) -> &[u8] {
        &self.bytes()[binding.offset..binding.offset + binding.len]
    }

    /// Mutable view of one bound tensor.
    pub(crate) fn slice_mut(&mut self, binding: &Binding) -> &mut [u8] {
        &mut self.bytes_mut()[binding.offset..binding.offset + binding.len]
    }
}

//! Per-scan accumulator for response bodies.
//!
//! Parsers never see the network: the scanner pushes every chunk it reads
//! into a [`BufferState`] and hands that to the parser. The state also
//! tracks how many bytes the current read budget still allows, which a
//! parser may extend after looking at the first chunk.
//!
//! A `BufferState` belongs to exactly one scan and is dropped with it.

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct BufferState {
    /// Everything read so far.
    spill: BytesMut,

    /// Stream offset of the first spilled byte, non-zero after a ranged
    /// request.
    base: u64,

    /// Bytes left in the current read budget.
    remaining: usize,

    /// Set until the parser has seen enough of the first bytes.
    first_chunk: bool,

    /// Set once the body ended or no more bytes will be read.
    eof: bool,
}

impl BufferState {
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self::at_offset(0, budget)
    }

    /// Creates a state for a body that starts `base` bytes into the stream.
    #[must_use]
    pub fn at_offset(base: u64, budget: usize) -> Self {
        Self {
            spill: BytesMut::new(),
            base,
            remaining: budget,
            first_chunk: true,
            eof: false,
        }
    }

    /// Spills a chunk. The whole chunk is kept even when it overshoots the
    /// budget.
    pub fn push(&mut self, chunk: &[u8]) {
        self.spill.extend_from_slice(chunk);
        self.remaining = self.remaining.saturating_sub(chunk.len());
    }

    /// Marks that no more bytes will arrive.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether the read budget has been used up.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Whether the parser has yet to look at the start of the body. Cleared
    /// by [`BufferState::parsed`].
    #[must_use]
    pub fn is_first_chunk(&self) -> bool {
        self.first_chunk
    }

    /// Records that the parser has seen the start of the body.
    pub fn parsed(&mut self) {
        self.first_chunk = false;
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Replaces the budget by `total` bytes counted from the start of the
    /// body.
    pub fn set_budget(&mut self, total: usize) {
        self.remaining = total.saturating_sub(self.spill.len());
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.spill
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.spill.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spill.is_empty()
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the first `len` spilled bytes.
    #[must_use]
    pub fn head(&self, len: usize) -> Bytes {
        Bytes::copy_from_slice(&self.spill[..len.min(self.spill.len())])
    }
}

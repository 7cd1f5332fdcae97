//! Per-connection channel ID allocation.
//!
//! IDs are handed out from `[1, max]` by scanning a bitset forward from the
//! last issued ID. An issued ID is never handed out again while the allocator
//! lives; the whole allocator is discarded when its connection goes away.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("max channels reached ({max})")]
pub struct MaxChannels {
    pub max: u16,
}

#[derive(Debug, Clone)]
pub struct ChannelIdAllocator {
    bits: Vec<u64>,
    max: u16,
    cursor: u16,
}

impl ChannelIdAllocator {
    pub fn new(max: u16) -> Self {
        let words = (max as usize + 1).div_ceil(64);
        Self {
            bits: vec![0; words],
            max,
            cursor: 0,
        }
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn is_set(&self, id: u16) -> bool {
        let id = id as usize;
        self.bits
            .get(id / 64)
            .is_some_and(|word| word & (1 << (id % 64)) != 0)
    }

    /// Mark an ID chosen by the peer as in use.
    ///
    /// Returns `false` if the ID is out of range or already taken.
    pub fn reserve(&mut self, id: u16) -> bool {
        if id == 0 || id > self.max || self.is_set(id) {
            return false;
        }
        self.set(id);
        true
    }

    /// Allocate the next free ID above the cursor.
    pub fn next(&mut self) -> Result<u16, MaxChannels> {
        let mut id = self.cursor;
        while id < self.max {
            id += 1;
            if !self.is_set(id) {
                self.set(id);
                self.cursor = id;
                return Ok(id);
            }
        }
        self.cursor = self.max;
        Err(MaxChannels { max: self.max })
    }

    fn set(&mut self, id: u16) {
        let id = id as usize;
        self.bits[id / 64] |= 1 << (id % 64);
    }
}

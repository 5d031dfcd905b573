//! Per-contract block cursor.
//!
//! The cursor is the last block whose events were fully applied for a contract.
//! It only moves forward; the durable copy lives in [crate::store::Store].

/// Cursor: last fully processed block height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub last_polled_block: u64,
}

impl Cursor {
    pub fn new(last_polled_block: u64) -> Self {
        Self { last_polled_block }
    }

    /// Inclusive block range still to be polled when the chain head is `head`.
    ///
    /// A fresh cursor (0) starts from genesis; otherwise from the block after the cursor.
    /// Returns None when there is nothing new.
    pub fn next_range(&self, head: u64) -> Option<(u64, u64)> {
        if head <= self.last_polled_block {
            return None;
        }
        let from = if self.last_polled_block == 0 {
            0
        } else {
            self.last_polled_block + 1
        };
        Some((from, head))
    }

    /// Move forward to `to`; never backwards. Returns true if the cursor changed.
    pub fn advance(&mut self, to: u64) -> bool {
        if to > self.last_polled_block {
            self.last_polled_block = to;
            true
        } else {
            false
        }
    }
}

// store.rs — Visited-state store for recurrence detection
//
// A growable stack of configurations plus a fixed-size bucket array mapping
// hash buckets to chains of stack positions. A state's stack position is
// its identity for later cycle reconstruction.
//
// Preconditions: all stored states are shaped for the same graph.
// Postconditions: `store` either records a new state or returns the stack
//                 position of its earlier occurrence.
// Failure modes: `ResourceExhausted` when the configured stack bound is hit.
// Side effects: none beyond allocation.

use crate::error::{AnalysisError, Bounds};
use crate::state::{state_bucket, CsdfState};

/// Position of a state on the stack.
pub type StackPos = usize;

pub struct StateStore {
    stack: Vec<CsdfState>,
    /// Bucket heads: chains of stack positions, newest first.
    buckets: Vec<Vec<StackPos>>,
    max_stack: usize,
}

impl StateStore {
    pub fn new(bounds: &Bounds) -> Self {
        StateStore {
            stack: Vec::new(),
            buckets: vec![Vec::new(); bounds.max_hash_size],
            max_stack: bounds.max_stack_size,
        }
    }

    /// Forget all stored states, keeping the allocations.
    pub fn clear(&mut self) {
        self.stack.clear();
        for b in &mut self.buckets {
            b.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn stack(&self) -> &[CsdfState] {
        &self.stack
    }

    /// Store `s` unless an equal state is already present.
    ///
    /// Returns `Ok(Some(pos))` with the position of the earlier occurrence
    /// when the state was seen before (a cycle), `Ok(None)` when it was
    /// newly stored.
    pub fn store(&mut self, s: &CsdfState) -> Result<Option<StackPos>, AnalysisError> {
        let bucket = state_bucket(s, self.buckets.len());
        for &pos in &self.buckets[bucket] {
            if self.stack[pos].equal(s) {
                return Ok(Some(pos));
            }
        }
        if self.stack.len() >= self.max_stack {
            return Err(AnalysisError::ResourceExhausted(format!(
                "state stack limit of {} states",
                self.max_stack
            )));
        }
        if self.stack.len() == self.stack.capacity() {
            log::debug!("growing state stack past {} states", self.stack.len());
        }
        self.buckets[bucket].push(self.stack.len());
        self.stack.push(s.clone());
        Ok(None)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_bounds() -> Bounds {
        Bounds {
            max_stack_size: 4,
            max_hash_size: 8,
        }
    }

    fn state_with_clock(clk: u64) -> CsdfState {
        let mut s = CsdfState::new(1, 1, 2);
        s.glb_clk = clk;
        s
    }

    #[test]
    fn first_store_is_new() {
        let mut store = StateStore::new(&small_bounds());
        assert_eq!(store.store(&state_with_clock(1)).unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn revisit_returns_first_position() {
        let mut store = StateStore::new(&small_bounds());
        store.store(&state_with_clock(1)).unwrap();
        store.store(&state_with_clock(2)).unwrap();
        assert_eq!(store.store(&state_with_clock(1)).unwrap(), Some(0));
        assert_eq!(store.store(&state_with_clock(2)).unwrap(), Some(1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn stack_bound_enforced() {
        let mut store = StateStore::new(&small_bounds());
        for clk in 0..4 {
            store.store(&state_with_clock(clk)).unwrap();
        }
        assert!(matches!(
            store.store(&state_with_clock(99)),
            Err(AnalysisError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn clear_forgets_states() {
        let mut store = StateStore::new(&small_bounds());
        store.store(&state_with_clock(1)).unwrap();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.store(&state_with_clock(1)).unwrap(), None);
    }
}

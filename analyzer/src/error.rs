// error.rs — Unified analysis error model
//
// Provides the typed error surface shared by every analysis entry point.
// Errors are raised at the lowest-level operation and propagate unchanged;
// intermediate state-space structures are released by ownership on unwind.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use thiserror::Error;

/// Error raised by any analysis entry point.
///
/// Analyses never mutate their input graph; on failure no partial result is
/// committed and every state-space structure owned by the invocation has
/// been dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The balance equations have no positive integer solution, or the
    /// graph description is structurally malformed.
    #[error("inconsistent graph: {0}")]
    InconsistentGraph(String),

    /// A channel's initial tokens exceed its assigned storage space.
    #[error("channel '{0}' holds more initial tokens than its storage space")]
    InsufficientInitialSpace(String),

    /// A full maximal time step made no progress and no process has finite
    /// remaining execution time.
    #[error("graph '{0}' has a deadlock")]
    Deadlock(String),

    /// An analysis precondition on the graph shape is violated.
    #[error("unsupported topology: {0}")]
    UnsupportedTopology(String),

    /// The reduced transition system is not a single strongly connected
    /// component; no long-run distribution exists.
    #[error("graph '{0}' does not imply an ergodic Markov chain")]
    NonErgodic(String),

    /// Gaussian elimination hit a zero pivot after pivot deferral.
    #[error("equilibrium system is singular at row {0}")]
    SingularSystem(usize),

    /// A configured stack, hash, or configuration bound was exceeded.
    #[error("resource bound exceeded: {0}")]
    ResourceExhausted(String),
}

/// Caller-supplied bounds on the state-space structures.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    /// Maximum number of stacked configurations (stack grows geometrically
    /// up to this limit).
    pub max_stack_size: usize,
    /// Number of buckets in the visited-state hash.
    pub max_hash_size: usize,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            max_stack_size: 1 << 20,
            max_hash_size: 1 << 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = AnalysisError::InsufficientInitialSpace("c0".into());
        assert_eq!(
            format!("{e}"),
            "channel 'c0' holds more initial tokens than its storage space"
        );
        let e = AnalysisError::SingularSystem(3);
        assert_eq!(format!("{e}"), "equilibrium system is singular at row 3");
    }

    #[test]
    fn default_bounds_nonzero() {
        let b = Bounds::default();
        assert!(b.max_stack_size > 0);
        assert!(b.max_hash_size > 0);
    }
}

// throughput.rs — State-space throughput analysis
//
// Computes the throughput of a timed CSDF graph under unconstrained
// storage and auto-concurrency. A graph that is not strongly connected is
// decomposed into its components; each component's throughput is scaled by
// the ratio of its local repetition count to the global one, and the
// minimum over components is returned.
//
// Preconditions: the graph has consistent rates.
// Postconditions: the input graph is not mutated.
// Failure modes: `InconsistentGraph`, `ResourceExhausted`.
// Side effects: none.

use crate::engine::Engine;
use crate::error::{AnalysisError, Bounds};
use crate::graph::{Capacity, Graph};

/// Throughput in iteration completions per time unit; `+inf` when nothing
/// constrains the rate (no channels at all).
pub fn state_space_throughput(g: &Graph, bounds: &Bounds) -> Result<f64, AnalysisError> {
    let rep = g.repetition_vector()?;

    if g.n_channels() == 0 {
        return Ok(f64::INFINITY);
    }

    if !g.is_strongly_connected() {
        let mut thr = f64::INFINITY;
        for component in g.strongly_connected_components() {
            let (sub, old_ids) = g.component_subgraph(&component);
            if sub.n_channels() == 0 {
                // An acyclic component imposes no rate bound.
                continue;
            }
            let thr_c = state_space_throughput(&sub, bounds)?;
            let rep_c = sub.repetition_vector()?;
            // Scale component-local iterations to global iterations.
            let scaled = thr_c * rep_c[0] as f64 / rep[old_ids[0].index()] as f64;
            if scaled < thr {
                thr = scaled;
            }
        }
        return Ok(thr);
    }

    let caps = vec![Capacity::Unbounded; g.n_channels()];
    let mut engine = Engine::new(g, bounds)?;
    let outcome = engine.execute(&caps)?;
    Ok(outcome.throughput)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_actor_cycle() {
        let mut g = Graph::new("two-actor");
        let a = g.add_actor("A", vec![2]);
        let b = g.add_actor("B", vec![3]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![1], 1, None);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(thr, 1.0 / 5.0);
    }

    #[test]
    fn disconnected_acyclic_part_is_unconstrained() {
        // A self-loop cycle plus a dangling consumer: the consumer's
        // component has no channels and contributes no bound.
        let mut g = Graph::new("mixed");
        let a = g.add_actor("A", vec![4]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        g.connect("c1", a, vec![1], b, vec![1], 0, None);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(thr, 1.0 / 4.0);
    }

    #[test]
    fn fully_acyclic_graph_is_infinite() {
        let mut g = Graph::new("chain");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![2]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert!(thr.is_infinite());
    }

    #[test]
    fn slowest_component_wins() {
        // Two independent self-loop cycles; the slower one bounds the graph.
        let mut g = Graph::new("two-loops");
        let a = g.add_actor("A", vec![4]);
        let b = g.add_actor("B", vec![10]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        g.connect("c1", b, vec![1], b, vec![1], 1, None);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(thr, 1.0 / 10.0);
    }

    #[test]
    fn component_scaling_uses_repetition_ratio() {
        // B fires twice per global iteration but its component alone fires
        // it once per local iteration: local throughput 1/2 scales to 1/4
        // in global iterations, slower than A's cycle at 1/3.
        let mut g = Graph::new("scaled");
        let a = g.add_actor("A", vec![3]);
        let b = g.add_actor("B", vec![2]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        g.connect("c1", b, vec![1], b, vec![1], 1, None);
        g.connect("c2", a, vec![2], b, vec![1], 0, None);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(thr, 1.0 / 4.0);
    }

    #[test]
    fn no_channels_is_infinite() {
        let mut g = Graph::new("lonely");
        g.add_actor("A", vec![7]);
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert!(thr.is_infinite());
    }
}

// End-to-end scenarios for the CSDF state-space analyses: throughput,
// buffer sizing, dependency detection, and the boundary behaviors of the
// self-timed execution semantics.

use dpa::buffer::state_space_buffer_analysis;
use dpa::error::Bounds;
use dpa::graph::Graph;
use dpa::throughput::state_space_throughput;

fn bounds() -> Bounds {
    Bounds::default()
}

/// A (exec 2) -> B (exec 3), back edge with one token: the single token on
/// the cycle serializes the two actors into a period of 5.
fn two_actor_graph() -> Graph {
    let mut g = Graph::new("two-actor");
    let a = g.add_actor("A", vec![2]);
    let b = g.add_actor("B", vec![3]);
    g.connect("c0", a, vec![1], b, vec![1], 0, None);
    g.connect("c1", b, vec![1], a, vec![1], 1, None);
    g
}

#[test]
fn two_actor_throughput() {
    let g = two_actor_graph();
    let thr = state_space_throughput(&g, &bounds()).unwrap();
    assert_eq!(thr, 1.0 / 5.0);
}

#[test]
fn two_actor_pareto_front() {
    let g = two_actor_graph();
    let front = state_space_buffer_analysis(&g, f64::INFINITY, &bounds()).unwrap();
    let sets = front.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].total, 2);
    assert_eq!(sets[0].throughput, 1.0 / 5.0);
    let dists = front.distributions(sets[0]);
    assert_eq!(dists.len(), 1);
    assert_eq!(dists[0].sizes, vec![1, 1]);
}

#[test]
fn self_edge_throughput_independent_of_buffer() {
    let mut g = Graph::new("self");
    let a = g.add_actor("A", vec![5]);
    g.connect("c0", a, vec![1], a, vec![1], 1, None);
    assert_eq!(g.repetition_vector().unwrap(), vec![1]);
    let thr = state_space_throughput(&g, &bounds()).unwrap();
    assert_eq!(thr, 1.0 / 5.0);
    // The self-edge is never grown, so the front is a single point.
    let front = state_space_buffer_analysis(&g, f64::INFINITY, &bounds()).unwrap();
    let sets = front.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].throughput, 1.0 / 5.0);
}

#[test]
fn cyclo_static_throughput() {
    // A out [2,1] / exec [3,1] feeding B in [1,2] / exec [1,2], three
    // tokens on the back edge: two firings of A complete every 5 time
    // units in the periodic regime.
    let mut g = Graph::new("cyclo");
    let a = g.add_actor("A", vec![3, 1]);
    let b = g.add_actor("B", vec![1, 2]);
    g.connect("c0", a, vec![2, 1], b, vec![1, 2], 0, None);
    g.connect("c1", b, vec![1, 2], a, vec![2, 1], 3, None);
    assert_eq!(g.repetition_vector().unwrap(), vec![2, 2]);
    let thr = state_space_throughput(&g, &bounds()).unwrap();
    assert_eq!(thr, 1.0 / 5.0);
}

#[test]
fn equal_phase_rates_match_single_phase_firing_rate() {
    // Splitting every sequence into two equal phases doubles the firings
    // per iteration and halves the iteration rate: the firing rate of the
    // output actor is unchanged.
    let single = two_actor_graph();
    let mut split = Graph::new("two-actor-split");
    let a = split.add_actor("A", vec![2, 2]);
    let b = split.add_actor("B", vec![3, 3]);
    split.connect("c0", a, vec![1, 1], b, vec![1, 1], 0, None);
    split.connect("c1", b, vec![1, 1], a, vec![1, 1], 1, None);

    let thr_single = state_space_throughput(&single, &bounds()).unwrap();
    let thr_split = state_space_throughput(&split, &bounds()).unwrap();
    let rep_single = single.repetition_vector().unwrap();
    let rep_split = split.repetition_vector().unwrap();
    assert_eq!(rep_split, vec![2, 2]);
    assert_eq!(
        thr_single * rep_single[0] as f64,
        thr_split * rep_split[0] as f64
    );
}

#[test]
fn deadlock_detection_marks_channels() {
    // A needs two tokens per firing from the back edge but only one is
    // ever present: no actor can fire at any storage assignment.
    let mut g = Graph::new("dead");
    let a = g.add_actor("A", vec![1]);
    let b = g.add_actor("B", vec![1]);
    g.connect("c0", a, vec![2], b, vec![1], 0, None);
    g.connect("c1", b, vec![1], a, vec![2], 1, None);
    assert_eq!(g.repetition_vector().unwrap(), vec![1, 2]);

    let mut engine = dpa::engine::Engine::new(&g, &bounds()).unwrap();
    let caps = vec![
        dpa::graph::Capacity::Bounded(2),
        dpa::graph::Capacity::Bounded(2),
    ];
    let out = engine.execute(&caps).unwrap();
    assert_eq!(out.throughput, 0.0);
    assert!(out.dep[0], "the forward channel must carry a dependency");
    assert!(out.dep[1]);

    // The front collapses to the all-zero distribution at throughput 0.
    let front = state_space_buffer_analysis(&g, f64::INFINITY, &bounds()).unwrap();
    let sets = front.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].total, 0);
    assert_eq!(sets[0].throughput, 0.0);
}

#[test]
fn front_maximum_matches_unconstrained_throughput() {
    for (exec_a, exec_b, tokens) in [(2u32, 3u32, 1u64), (1, 4, 2), (3, 3, 2)] {
        let mut g = Graph::new("pair");
        let a = g.add_actor("A", vec![exec_a]);
        let b = g.add_actor("B", vec![exec_b]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![1], tokens, None);
        let thr = state_space_throughput(&g, &bounds()).unwrap();
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &bounds()).unwrap();
        assert_eq!(
            front.max_throughput(),
            thr,
            "front must end at the unconstrained throughput for exec=({exec_a},{exec_b}) t={tokens}"
        );
    }
}

#[test]
fn pipelined_cycle_throughput() {
    // Two tokens on the cycle let the actors overlap: two iterations per
    // period of 5.
    let mut g = Graph::new("pipelined");
    let a = g.add_actor("A", vec![2]);
    let b = g.add_actor("B", vec![3]);
    g.connect("c0", a, vec![1], b, vec![1], 0, None);
    g.connect("c1", b, vec![1], a, vec![1], 2, None);
    let thr = state_space_throughput(&g, &bounds()).unwrap();
    assert_eq!(thr, 2.0 / 5.0);
}

#[test]
fn disconnected_components_take_the_minimum() {
    let mut g = Graph::new("mixed");
    let a = g.add_actor("A", vec![2]);
    let b = g.add_actor("B", vec![7]);
    g.connect("c0", a, vec![1], a, vec![1], 1, None);
    g.connect("c1", b, vec![1], b, vec![1], 1, None);
    g.connect("c2", a, vec![1], b, vec![1], 0, None);
    let thr = state_space_throughput(&g, &bounds()).unwrap();
    assert_eq!(thr, 1.0 / 7.0);
}

#[test]
fn resource_bounds_propagate() {
    let g = two_actor_graph();
    let tight = Bounds {
        max_stack_size: 1,
        max_hash_size: 2,
    };
    assert!(matches!(
        state_space_throughput(&g, &tight),
        Err(dpa::AnalysisError::ResourceExhausted(_))
    ));
}

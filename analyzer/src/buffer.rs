// buffer.rs — Storage-distribution trade-off exploration
//
// Breadth-first search over storage distributions ordered by total size.
// Each distribution is executed to measure its throughput and storage
// dependencies; every non-self-edge channel with a dependency spawns a
// grown distribution. Sets whose best throughput does not improve on the
// previous size are discarded, as are sub-maximal distributions within a
// set. The search stops at a throughput bound, at the unconstrained
// maximum, or on exhaustion.
//
// Preconditions: the graph has consistent rates.
// Postconditions: the returned front holds only minimal distributions up to
//                 the stopping size; the input graph is not mutated.
// Failure modes: `InconsistentGraph`, `ResourceExhausted` (all partially
//                built distributions are released by ownership).
// Side effects: none.

use std::fmt;

use crate::engine::Engine;
use crate::error::{AnalysisError, Bounds};
use crate::fraction::gcd;
use crate::graph::{Capacity, Graph};
use crate::throughput::state_space_throughput;

// ── Public types ────────────────────────────────────────────────────────────

/// One storage distribution: a capacity per channel plus its measured
/// throughput and dependency bits.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub sizes: Vec<u64>,
    pub dep: Vec<bool>,
    pub throughput: f64,
    pub total: u64,
    next: Option<u32>,
    prev: Option<u32>,
}

/// All distributions of one total size, with the best throughput among them.
#[derive(Debug, Clone)]
pub struct DistributionSet {
    pub total: u64,
    pub throughput: f64,
    head: Option<u32>,
    next: Option<u32>,
    prev: Option<u32>,
}

/// The throughput/storage Pareto front: distribution sets linked in
/// increasing total size, each holding its minimal distributions.
///
/// Both lists live in index arenas; an `Option<u32>` is a link, never a
/// pointer.
#[derive(Debug, Default)]
pub struct ParetoFront {
    dists: Vec<Distribution>,
    sets: Vec<DistributionSet>,
    first: Option<u32>,
    free_dists: Vec<u32>,
    free_sets: Vec<u32>,
}

impl ParetoFront {
    /// Distribution sets in increasing size order.
    pub fn sets(&self) -> Vec<&DistributionSet> {
        let mut out = Vec::new();
        let mut cur = self.first;
        while let Some(s) = cur {
            out.push(&self.sets[s as usize]);
            cur = self.sets[s as usize].next;
        }
        out
    }

    /// Distributions of one set, in list order.
    pub fn distributions(&self, set: &DistributionSet) -> Vec<&Distribution> {
        let mut out = Vec::new();
        let mut cur = set.head;
        while let Some(d) = cur {
            out.push(&self.dists[d as usize]);
            cur = self.dists[d as usize].next;
        }
        out
    }

    /// Best throughput of the largest explored size.
    pub fn max_throughput(&self) -> f64 {
        self.sets().last().map_or(0.0, |s| s.throughput)
    }

    // ── Arena management ────────────────────────────────────────────────

    fn alloc_dist(&mut self, sizes: Vec<u64>, n_channels: usize) -> u32 {
        let total = sizes.iter().sum();
        let d = Distribution {
            sizes,
            dep: vec![false; n_channels],
            throughput: 0.0,
            total,
            next: None,
            prev: None,
        };
        if let Some(i) = self.free_dists.pop() {
            self.dists[i as usize] = d;
            i
        } else {
            self.dists.push(d);
            (self.dists.len() - 1) as u32
        }
    }

    fn free_dist(&mut self, d: u32) {
        self.dists[d as usize].sizes = Vec::new();
        self.dists[d as usize].dep = Vec::new();
        self.free_dists.push(d);
    }

    fn alloc_set(&mut self, total: u64, head: u32) -> u32 {
        let s = DistributionSet {
            total,
            throughput: 0.0,
            head: Some(head),
            next: None,
            prev: None,
        };
        if let Some(i) = self.free_sets.pop() {
            self.sets[i as usize] = s;
            i
        } else {
            self.sets.push(s);
            (self.sets.len() - 1) as u32
        }
    }

    // ── Checklist insertion ─────────────────────────────────────────────

    /// Insert `d` into the size-ordered checklist unless an equal
    /// distribution of the same size is already present.
    fn add_to_checklist(&mut self, d: u32) -> bool {
        let total = self.dists[d as usize].total;

        let Some(mut s) = self.first else {
            let s = self.alloc_set(total, d);
            self.first = Some(s);
            return true;
        };

        // Find the last set not larger than d.
        while let Some(next) = self.sets[s as usize].next {
            if self.sets[next as usize].total <= total {
                s = next;
            } else {
                break;
            }
        }

        if self.sets[s as usize].total == total {
            // Reject duplicates, then push at the head of the set's list.
            let mut cur = self.sets[s as usize].head;
            while let Some(i) = cur {
                if self.dists[i as usize].sizes == self.dists[d as usize].sizes {
                    return false;
                }
                cur = self.dists[i as usize].next;
            }
            let old_head = self.sets[s as usize].head;
            if let Some(h) = old_head {
                self.dists[h as usize].prev = Some(d);
            }
            self.dists[d as usize].next = old_head;
            self.dists[d as usize].prev = None;
            self.sets[s as usize].head = Some(d);
        } else {
            // New set spliced after s.
            let after = self.sets[s as usize].next;
            let ns = self.alloc_set(total, d);
            self.sets[ns as usize].prev = Some(s);
            self.sets[ns as usize].next = after;
            if let Some(a) = after {
                self.sets[a as usize].prev = Some(ns);
            }
            self.sets[s as usize].next = Some(ns);
        }
        true
    }

    // ── Minimization ────────────────────────────────────────────────────

    /// Remove non-minimal distributions from a fully explored set: all of
    /// them when the previous size already reached the same throughput,
    /// otherwise the ones below the set's best.
    fn minimize_set(&mut self, s: u32) {
        let thr = self.sets[s as usize].throughput;
        let prev_reaches = self.sets[s as usize]
            .prev
            .is_some_and(|p| self.sets[p as usize].throughput == thr);
        if prev_reaches {
            let mut cur = self.sets[s as usize].head;
            while let Some(d) = cur {
                cur = self.dists[d as usize].next;
                self.free_dist(d);
            }
            self.sets[s as usize].head = None;
            return;
        }
        let mut cur = self.sets[s as usize].head;
        while let Some(d) = cur {
            let next = self.dists[d as usize].next;
            if self.dists[d as usize].throughput < thr {
                self.unlink_dist(s, d);
                self.free_dist(d);
            }
            cur = next;
        }
    }

    fn unlink_dist(&mut self, s: u32, d: u32) {
        let (prev, next) = (self.dists[d as usize].prev, self.dists[d as usize].next);
        match prev {
            Some(p) => self.dists[p as usize].next = next,
            None => self.sets[s as usize].head = next,
        }
        if let Some(n) = next {
            self.dists[n as usize].prev = prev;
        }
    }

    fn remove_set(&mut self, s: u32) {
        let (prev, next) = (self.sets[s as usize].prev, self.sets[s as usize].next);
        match prev {
            Some(p) => self.sets[p as usize].next = next,
            None => self.first = next,
        }
        if let Some(n) = next {
            self.sets[n as usize].prev = prev;
        }
        self.free_sets.push(s);
    }

    /// Drop every set after `s`, releasing its distributions.
    fn truncate_after(&mut self, s: u32) {
        let mut cur = self.sets[s as usize].next;
        self.sets[s as usize].next = None;
        while let Some(x) = cur {
            let mut d = self.sets[x as usize].head;
            while let Some(i) = d {
                d = self.dists[i as usize].next;
                self.free_dist(i);
            }
            cur = self.sets[x as usize].next;
            self.free_sets.push(x);
        }
    }
}

impl fmt::Display for ParetoFront {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for set in self.sets() {
            writeln!(f, "size={} throughput={:.6}", set.total, set.throughput)?;
            for d in self.distributions(set) {
                writeln!(f, "  sizes={:?} throughput={:.6}", d.sizes, d.throughput)?;
            }
        }
        Ok(())
    }
}

// ── Lower bounds ────────────────────────────────────────────────────────────

/// Per-channel storage lower bound: for a self-edge the production rate
/// plus the larger of consumption rate and initial tokens; otherwise
/// `p + c − gcd(p,c) + t mod gcd(p,c)`, clamped below by `t`, minimized
/// over the common rate period.
pub fn minimal_channel_sizes(g: &Graph) -> Vec<u64> {
    g.channels()
        .iter()
        .map(|ch| {
            let src = g.src_rates(ch.id);
            let dst = g.dst_rates(ch.id);
            let period = gcd(src.len() as u64, dst.len() as u64) as usize;
            let t = ch.initial_tokens;
            let mut lb = u64::MAX;
            for i in 0..period {
                let p = src.rate(i) as u64;
                let c = dst.rate(i) as u64;
                let bound = if ch.src == ch.dst {
                    p + c.max(t)
                } else {
                    let div = gcd(p, c);
                    if div == 0 {
                        t
                    } else {
                        (p + c - div + t % div).max(t)
                    }
                };
                lb = lb.min(bound);
            }
            lb
        })
        .collect()
}

/// Per-channel growth step: gcd of every production and consumption rate.
pub fn minimal_channel_steps(g: &Graph) -> Vec<u64> {
    g.channels()
        .iter()
        .map(|ch| {
            let mut step = g.src_rates(ch.id).rate(0) as u64;
            for &r in g.src_rates(ch.id).iter() {
                step = gcd(step, r as u64);
            }
            for &r in g.dst_rates(ch.id).iter() {
                step = gcd(step, r as u64);
            }
            step
        })
        .collect()
}

// ── Exploration ─────────────────────────────────────────────────────────────

/// Explore the throughput/storage trade-off space until every minimal
/// distribution is found or `thr_bound` is reached.
pub fn state_space_buffer_analysis(
    g: &Graph,
    thr_bound: f64,
    bounds: &Bounds,
) -> Result<ParetoFront, AnalysisError> {
    let min_sz = minimal_channel_sizes(g);
    let min_step = minimal_channel_steps(g);
    let max_throughput = state_space_throughput(g, bounds)?;
    let mut engine = Engine::new(g, bounds)?;
    let n = g.n_channels();

    let mut front = ParetoFront::default();
    let seed = front.alloc_dist(min_sz, n);
    front.add_to_checklist(seed);

    let mut cur = front.first;
    let mut stopped = None;
    while let Some(s) = cur {
        log::debug!(
            "exploring storage distributions of size {}",
            front.sets[s as usize].total
        );

        // Measure every distribution of this size and spawn grown ones.
        let mut d = front.sets[s as usize].head;
        while let Some(di) = d {
            let caps: Vec<Capacity> = front.dists[di as usize]
                .sizes
                .iter()
                .map(|&sz| Capacity::Bounded(sz))
                .collect();
            let out = engine.execute(&caps)?;
            front.dists[di as usize].throughput = out.throughput;
            front.dists[di as usize].dep = out.dep;
            if out.throughput > front.sets[s as usize].throughput {
                front.sets[s as usize].throughput = out.throughput;
            }
            for c in 0..n {
                if !front.dists[di as usize].dep[c] || g.is_self_edge(g.channels()[c].id) {
                    continue;
                }
                let mut sizes = front.dists[di as usize].sizes.clone();
                sizes[c] += min_step[c];
                let nd = front.alloc_dist(sizes, n);
                if !front.add_to_checklist(nd) {
                    front.free_dist(nd);
                }
            }
            d = front.dists[di as usize].next;
        }

        front.minimize_set(s);

        if front.sets[s as usize].throughput >= thr_bound
            || front.sets[s as usize].throughput == max_throughput
        {
            stopped = Some(s);
            break;
        }

        cur = front.sets[s as usize].next;
        if front.sets[s as usize].head.is_none() {
            front.remove_set(s);
        }
    }

    if let Some(s) = stopped {
        front.truncate_after(s);
    }

    // A deadlocking seed is not a minimal distribution; the all-zero
    // distribution is the unique minimal point at throughput 0.
    if let Some(f) = front.first {
        if front.sets[f as usize].throughput == 0.0 {
            front.sets[f as usize].total = 0;
            if let Some(h) = front.sets[f as usize].head {
                front.dists[h as usize].total = 0;
                front.dists[h as usize].sizes = vec![0; n];
            }
        }
    }

    Ok(front)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn two_actor_graph() -> Graph {
        let mut g = Graph::new("two-actor");
        let a = g.add_actor("A", vec![2]);
        let b = g.add_actor("B", vec![3]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![1], 1, None);
        g
    }

    #[test]
    fn minimal_sizes_two_actor() {
        let g = two_actor_graph();
        assert_eq!(minimal_channel_sizes(&g), vec![1, 1]);
    }

    #[test]
    fn minimal_sizes_self_edge() {
        let mut g = Graph::new("self");
        let a = g.add_actor("A", vec![5]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        assert_eq!(minimal_channel_sizes(&g), vec![2]);
    }

    #[test]
    fn minimal_sizes_multirate() {
        // p=2, c=3, t=0: 2+3-1+0 = 4.
        let mut g = Graph::new("multi");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![2], b, vec![3], 0, None);
        assert_eq!(minimal_channel_sizes(&g), vec![4]);
    }

    #[test]
    fn minimal_steps_are_rate_gcds() {
        let mut g = Graph::new("multi");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![4], b, vec![6], 0, None);
        g.connect("c1", b, vec![6], a, vec![4], 12, None);
        assert_eq!(minimal_channel_steps(&g), vec![2, 2]);
    }

    #[test]
    fn two_actor_front_is_single_point() {
        let g = two_actor_graph();
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &Bounds::default()).unwrap();
        let sets = front.sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].total, 2);
        assert_eq!(sets[0].throughput, 1.0 / 5.0);
        let dists = front.distributions(sets[0]);
        assert_eq!(dists.len(), 1);
        assert_eq!(dists[0].sizes, vec![1, 1]);
    }

    #[test]
    fn front_matches_unconstrained_throughput() {
        let g = two_actor_graph();
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &Bounds::default()).unwrap();
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(front.max_throughput(), thr);
    }

    #[test]
    fn self_edge_not_grown() {
        let mut g = Graph::new("self");
        let a = g.add_actor("A", vec![5]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &Bounds::default()).unwrap();
        let sets = front.sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].total, 2);
        assert_eq!(sets[0].throughput, 1.0 / 5.0);
    }

    #[test]
    fn deadlocking_graph_collapses_to_zero_point() {
        // A must read two tokens from the back edge but only one exists:
        // every finite storage assignment deadlocks.
        let mut g = Graph::new("dead");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![2], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![2], 1, None);
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &Bounds::default()).unwrap();
        let sets = front.sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].total, 0);
        assert_eq!(sets[0].throughput, 0.0);
        let dists = front.distributions(sets[0]);
        assert_eq!(dists[0].sizes, vec![0, 0]);
    }

    #[test]
    fn multirate_front_grows_to_maximum() {
        // A (exec 1) feeding B (exec 1) at rates 2:1 with a serializing
        // self-edge on each actor; growing c0 past its lower bound cannot
        // improve on the actors' own serialization, so the front stops at
        // the first size that reaches the maximum.
        let mut g = Graph::new("grow");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("sa", a, vec![1], a, vec![1], 1, None);
        g.connect("sb", b, vec![1], b, vec![1], 1, None);
        g.connect("c0", a, vec![2], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![2], 4, None);
        let front = state_space_buffer_analysis(&g, f64::INFINITY, &Bounds::default()).unwrap();
        let thr = state_space_throughput(&g, &Bounds::default()).unwrap();
        assert_eq!(front.max_throughput(), thr);
        // Sizes increase strictly along the front.
        let sets = front.sets();
        for w in sets.windows(2) {
            assert!(w[0].total < w[1].total);
        }
    }

    #[test]
    fn throughput_bound_stops_early() {
        let g = two_actor_graph();
        // Any positive throughput satisfies a zero bound.
        let front = state_space_buffer_analysis(&g, 0.0, &Bounds::default()).unwrap();
        assert_eq!(front.sets().len(), 1);
    }
}

// graph.rs — Timed (C)SDF graph model
//
// In-memory dataflow graph: actors with cyclic rate and execution-time
// sequences, ports, channels with initial tokens and optional capacities.
// Provides the repetition vector (balance equations over exact fractions),
// strongly-connected-component decomposition, and component subgraphs.
//
// Preconditions: graphs are built through `Graph::add_actor`/`Graph::connect`,
//                so every port is connected to exactly one channel.
// Postconditions: analyses treat the graph as immutable shared input.
// Failure modes: unsolvable balance equations or mismatched phase lengths
//                produce `AnalysisError::InconsistentGraph`.
// Side effects: none.

use std::fmt;

use crate::error::AnalysisError;
use crate::fraction::{gcd, Fraction};

// ── Public types ────────────────────────────────────────────────────────────

/// Unique identifier for an actor within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub u32);

/// Unique identifier for a channel within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl ActorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ChannelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Direction of a port relative to its actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    In,
    Out,
}

/// Storage capacity assigned to a channel during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(u64),
    Unbounded,
}

impl Capacity {
    pub fn is_bounded(self) -> bool {
        matches!(self, Capacity::Bounded(_))
    }
}

impl From<Option<u64>> for Capacity {
    fn from(v: Option<u64>) -> Self {
        match v {
            Some(n) => Capacity::Bounded(n),
            None => Capacity::Unbounded,
        }
    }
}

/// A cyclic sequence of rates, indexed by phase position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSeq(Vec<u32>);

impl RateSeq {
    pub fn new(rates: Vec<u32>) -> Self {
        assert!(!rates.is_empty(), "rate sequence must not be empty");
        RateSeq(rates)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Rate at a (cyclic) phase position.
    pub fn rate(&self, pos: usize) -> u32 {
        self.0[pos % self.0.len()]
    }

    /// Total production/consumption over one full period.
    pub fn sum(&self) -> u64 {
        self.0.iter().map(|&r| r as u64).sum()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, u32> {
        self.0.iter()
    }
}

impl From<Vec<u32>> for RateSeq {
    fn from(v: Vec<u32>) -> Self {
        RateSeq::new(v)
    }
}

/// A port on an actor, connected to exactly one channel.
#[derive(Debug, Clone)]
pub struct Port {
    pub dir: PortDir,
    pub rates: RateSeq,
    pub channel: ChannelId,
}

/// An actor with a cyclic execution-time sequence and its ports.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
    pub exec_times: Vec<u32>,
    pub ports: Vec<Port>,
}

/// A channel between a source port and a destination port.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub src: ActorId,
    pub dst: ActorId,
    /// Index of the source port within the source actor's port list.
    pub src_port: usize,
    /// Index of the destination port within the destination actor's port list.
    pub dst_port: usize,
    pub initial_tokens: u64,
    /// `None` means unbounded.
    pub capacity: Option<u64>,
}

/// A timed (C)SDF graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    actors: Vec<Actor>,
    channels: Vec<Channel>,
}

// ── Construction ────────────────────────────────────────────────────────────

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            actors: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Add an actor with its per-phase execution times.
    pub fn add_actor(&mut self, name: impl Into<String>, exec_times: Vec<u32>) -> ActorId {
        assert!(!exec_times.is_empty(), "execution-time sequence must not be empty");
        let id = ActorId(self.actors.len() as u32);
        self.actors.push(Actor {
            id,
            name: name.into(),
            exec_times,
            ports: Vec::new(),
        });
        id
    }

    /// Connect two actors with a channel, creating the output port on `src`
    /// and the input port on `dst`.
    pub fn connect(
        &mut self,
        name: impl Into<String>,
        src: ActorId,
        src_rates: impl Into<RateSeq>,
        dst: ActorId,
        dst_rates: impl Into<RateSeq>,
        initial_tokens: u64,
        capacity: Option<u64>,
    ) -> ChannelId {
        let id = ChannelId(self.channels.len() as u32);
        let src_port = self.actors[src.index()].ports.len();
        self.actors[src.index()].ports.push(Port {
            dir: PortDir::Out,
            rates: src_rates.into(),
            channel: id,
        });
        let dst_port = self.actors[dst.index()].ports.len();
        self.actors[dst.index()].ports.push(Port {
            dir: PortDir::In,
            rates: dst_rates.into(),
            channel: id,
        });
        self.channels.push(Channel {
            id,
            name: name.into(),
            src,
            dst,
            src_port,
            dst_port,
            initial_tokens,
            capacity,
        });
        id
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn n_actors(&self) -> usize {
        self.actors.len()
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn actor(&self, id: ActorId) -> &Actor {
        &self.actors[id.index()]
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn is_self_edge(&self, id: ChannelId) -> bool {
        let c = &self.channels[id.index()];
        c.src == c.dst
    }

    /// Rate sequence of the channel's source (producer) port.
    pub fn src_rates(&self, id: ChannelId) -> &RateSeq {
        let c = &self.channels[id.index()];
        &self.actors[c.src.index()].ports[c.src_port].rates
    }

    /// Rate sequence of the channel's destination (consumer) port.
    pub fn dst_rates(&self, id: ChannelId) -> &RateSeq {
        let c = &self.channels[id.index()];
        &self.actors[c.dst.index()].ports[c.dst_port].rates
    }

    /// Largest execution time of any phase of any actor.
    pub fn max_exec_time(&self) -> u32 {
        self.actors
            .iter()
            .flat_map(|a| a.exec_times.iter().copied())
            .max()
            .unwrap_or(0)
    }

    // ── Repetition vector ───────────────────────────────────────────────

    /// Solve the balance equations and return the number of firings of each
    /// actor in one graph iteration.
    ///
    /// Every phase sequence of an actor (execution times and all its port
    /// rates) must share one length; the per-period firing counts are scaled
    /// by that length so one iteration restores all sequence positions.
    pub fn repetition_vector(&self) -> Result<Vec<u64>, AnalysisError> {
        for a in &self.actors {
            let phases = a.exec_times.len();
            for p in &a.ports {
                if p.rates.len() != phases {
                    return Err(AnalysisError::InconsistentGraph(format!(
                        "actor '{}' mixes phase sequences of length {} and {}",
                        a.name,
                        phases,
                        p.rates.len()
                    )));
                }
            }
        }

        // Fractional period counts per actor, propagated over channels.
        let mut period_count = vec![Fraction::new(0, 1); self.actors.len()];
        for seed in 0..self.actors.len() {
            if period_count[seed] != Fraction::new(0, 1) {
                continue;
            }
            period_count[seed] = Fraction::new(1, 1);
            let mut work = vec![seed];
            while let Some(a) = work.pop() {
                for p in &self.actors[a].ports {
                    let c = &self.channels[p.channel.index()];
                    let (src_sum, dst_sum) =
                        (self.src_rates(c.id).sum(), self.dst_rates(c.id).sum());
                    if src_sum == 0 && dst_sum == 0 {
                        continue;
                    }
                    if src_sum == 0 || dst_sum == 0 {
                        return Err(AnalysisError::InconsistentGraph(format!(
                            "channel '{}' produces and consumes unbalanced zero rates",
                            c.name
                        )));
                    }
                    let (known, other, ratio) = if p.dir == PortDir::Out {
                        (c.src, c.dst, Fraction::new(src_sum as i64, dst_sum as i64))
                    } else {
                        (c.dst, c.src, Fraction::new(dst_sum as i64, src_sum as i64))
                    };
                    let derived = period_count[known.index()] * ratio;
                    let cur = &period_count[other.index()];
                    if *cur == Fraction::new(0, 1) {
                        period_count[other.index()] = derived;
                        work.push(other.index());
                    } else if *cur != derived {
                        return Err(AnalysisError::InconsistentGraph(format!(
                            "balance equations have no solution at channel '{}'",
                            c.name
                        )));
                    }
                }
            }
        }

        // Scale to the smallest positive integer solution.
        let mut scale: u64 = 1;
        for f in &period_count {
            scale = crate::fraction::lcm(scale, f.denominator().unsigned_abs());
        }
        let mut counts: Vec<u64> = period_count
            .iter()
            .map(|f| (f.numerator().unsigned_abs()) * (scale / f.denominator().unsigned_abs()))
            .collect();
        let mut common = 0;
        for &c in &counts {
            common = gcd(common, c);
        }
        if common > 1 {
            for c in counts.iter_mut() {
                *c /= common;
            }
        }

        // One iteration fires each actor through whole periods.
        Ok(self
            .actors
            .iter()
            .zip(&counts)
            .map(|(a, &c)| c * a.exec_times.len() as u64)
            .collect())
    }

    // ── Strongly connected components ───────────────────────────────────

    /// Decompose the graph into strongly connected components.
    ///
    /// Two depth-first passes: finish-time ordering on the forward graph,
    /// then tree discovery on the transposed graph in decreasing finish
    /// order.
    pub fn strongly_connected_components(&self) -> Vec<Vec<ActorId>> {
        let n = self.actors.len();
        let mut fwd: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut rev: Vec<Vec<usize>> = vec![Vec::new(); n];
        for c in &self.channels {
            fwd[c.src.index()].push(c.dst.index());
            rev[c.dst.index()].push(c.src.index());
        }

        // Pass 1: forward DFS, record finish order.
        let mut finished = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        for s in 0..n {
            if seen[s] {
                continue;
            }
            // (node, next-neighbor cursor)
            let mut stack = vec![(s, 0usize)];
            seen[s] = true;
            while let Some(&mut (u, ref mut i)) = stack.last_mut() {
                if *i < fwd[u].len() {
                    let v = fwd[u][*i];
                    *i += 1;
                    if !seen[v] {
                        seen[v] = true;
                        stack.push((v, 0));
                    }
                } else {
                    finished.push(u);
                    stack.pop();
                }
            }
        }

        // Pass 2: transposed DFS in decreasing finish order.
        let mut comp_of = vec![usize::MAX; n];
        let mut components: Vec<Vec<ActorId>> = Vec::new();
        for &s in finished.iter().rev() {
            if comp_of[s] != usize::MAX {
                continue;
            }
            let comp_id = components.len();
            let mut comp = Vec::new();
            let mut stack = vec![s];
            comp_of[s] = comp_id;
            while let Some(u) = stack.pop() {
                comp.push(ActorId(u as u32));
                for &v in &rev[u] {
                    if comp_of[v] == usize::MAX {
                        comp_of[v] = comp_id;
                        stack.push(v);
                    }
                }
            }
            comp.sort();
            components.push(comp);
        }
        components
    }

    pub fn is_strongly_connected(&self) -> bool {
        self.strongly_connected_components().len() == 1
    }

    /// Build the subgraph restricted to one component.
    ///
    /// Actors and channels are relabelled densely from zero; ports not
    /// incident to an internal channel are dropped. Returns the subgraph
    /// and the mapping from new actor index to the original id.
    pub fn component_subgraph(&self, component: &[ActorId]) -> (Graph, Vec<ActorId>) {
        let mut inside = vec![false; self.actors.len()];
        for a in component {
            inside[a.index()] = true;
        }
        let mut sub = Graph::new(self.name.clone());
        let mut old_of_new = Vec::with_capacity(component.len());
        let mut new_of_old = vec![ActorId(u32::MAX); self.actors.len()];
        for a in component {
            let actor = &self.actors[a.index()];
            let new_id = sub.add_actor(actor.name.clone(), actor.exec_times.clone());
            new_of_old[a.index()] = new_id;
            old_of_new.push(*a);
        }
        for c in &self.channels {
            if inside[c.src.index()] && inside[c.dst.index()] {
                sub.connect(
                    c.name.clone(),
                    new_of_old[c.src.index()],
                    self.src_rates(c.id).clone(),
                    new_of_old[c.dst.index()],
                    self.dst_rates(c.id).clone(),
                    c.initial_tokens,
                    c.capacity,
                );
            }
        }
        (sub, old_of_new)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph '{}': {} actors, {} channels",
            self.name,
            self.actors.len(),
            self.channels.len()
        )?;
        for c in &self.channels {
            writeln!(
                f,
                "  {}: {} -> {} (tokens={}, capacity={})",
                c.name,
                self.actors[c.src.index()].name,
                self.actors[c.dst.index()].name,
                c.initial_tokens,
                c.capacity.map_or("inf".to_string(), |v| v.to_string()),
            )?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A (exec 2) -> B (exec 3) with a single-token back edge.
    fn two_actor_graph() -> Graph {
        let mut g = Graph::new("two-actor");
        let a = g.add_actor("A", vec![2]);
        let b = g.add_actor("B", vec![3]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![1], 1, None);
        g
    }

    #[test]
    fn repetition_vector_two_actor() {
        let g = two_actor_graph();
        assert_eq!(g.repetition_vector().unwrap(), vec![1, 1]);
    }

    #[test]
    fn repetition_vector_is_pure() {
        let g = two_actor_graph();
        assert_eq!(g.repetition_vector().unwrap(), g.repetition_vector().unwrap());
    }

    #[test]
    fn repetition_vector_multirate() {
        let mut g = Graph::new("multirate");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![2], b, vec![3], 0, None);
        assert_eq!(g.repetition_vector().unwrap(), vec![3, 2]);
    }

    #[test]
    fn repetition_vector_cyclo_static() {
        // A out [2,1] against B in [1,2]: per-period totals balance 1:1,
        // so each actor fires once per phase.
        let mut g = Graph::new("cyclo");
        let a = g.add_actor("A", vec![3, 1]);
        let b = g.add_actor("B", vec![1, 2]);
        g.connect("c0", a, vec![2, 1], b, vec![1, 2], 0, None);
        g.connect("c1", b, vec![1, 2], a, vec![2, 1], 3, None);
        assert_eq!(g.repetition_vector().unwrap(), vec![2, 2]);
    }

    #[test]
    fn repetition_vector_phase_scaling() {
        // A (1 phase, rate 2) feeding B (2 phases, rate 1 each): B's two
        // phases consume one period of A.
        let mut g = Graph::new("phases");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1, 1]);
        g.connect("c0", a, vec![2], b, vec![1, 1], 0, None);
        assert_eq!(g.repetition_vector().unwrap(), vec![1, 2]);
    }

    #[test]
    fn repetition_vector_single_actor_self_loop() {
        let mut g = Graph::new("self");
        let a = g.add_actor("A", vec![5]);
        g.connect("c0", a, vec![1], a, vec![1], 1, None);
        assert_eq!(g.repetition_vector().unwrap(), vec![1]);
    }

    #[test]
    fn inconsistent_rates_rejected() {
        let mut g = Graph::new("bad");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![2], b, vec![1], 0, None);
        g.connect("c1", b, vec![1], a, vec![1], 1, None);
        assert!(matches!(
            g.repetition_vector(),
            Err(AnalysisError::InconsistentGraph(_))
        ));
    }

    #[test]
    fn mismatched_phase_lengths_rejected() {
        let mut g = Graph::new("bad-phases");
        let a = g.add_actor("A", vec![1, 2]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        assert!(matches!(
            g.repetition_vector(),
            Err(AnalysisError::InconsistentGraph(_))
        ));
    }

    #[test]
    fn scc_single_component() {
        let g = two_actor_graph();
        let comps = g.strongly_connected_components();
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0], vec![ActorId(0), ActorId(1)]);
        assert!(g.is_strongly_connected());
    }

    #[test]
    fn scc_chain_splits() {
        let mut g = Graph::new("chain");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        g.connect("c0", a, vec![1], b, vec![1], 0, None);
        let comps = g.strongly_connected_components();
        assert_eq!(comps.len(), 2);
        assert!(!g.is_strongly_connected());
    }

    #[test]
    fn scc_two_cycles_bridged() {
        let mut g = Graph::new("bridged");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        let c = g.add_actor("C", vec![1]);
        let d = g.add_actor("D", vec![1]);
        g.connect("ab", a, vec![1], b, vec![1], 1, None);
        g.connect("ba", b, vec![1], a, vec![1], 0, None);
        g.connect("cd", c, vec![1], d, vec![1], 1, None);
        g.connect("dc", d, vec![1], c, vec![1], 0, None);
        g.connect("bc", b, vec![1], c, vec![1], 0, None);
        let comps = g.strongly_connected_components();
        assert_eq!(comps.len(), 2);
        let mut sizes: Vec<usize> = comps.iter().map(|c| c.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn component_subgraph_relabels() {
        let mut g = Graph::new("bridged");
        let a = g.add_actor("A", vec![1]);
        let b = g.add_actor("B", vec![1]);
        let c = g.add_actor("C", vec![2]);
        g.connect("ab", a, vec![1], b, vec![1], 1, None);
        g.connect("ba", b, vec![1], a, vec![1], 0, None);
        g.connect("bc", b, vec![1], c, vec![1], 0, None);
        let comps = g.strongly_connected_components();
        let cycle = comps.iter().find(|comp| comp.len() == 2).unwrap();
        let (sub, old) = g.component_subgraph(cycle);
        assert_eq!(sub.n_actors(), 2);
        // Only the two internal channels survive; the bridge port is gone.
        assert_eq!(sub.n_channels(), 2);
        assert_eq!(old, vec![ActorId(0), ActorId(1)]);
        assert_eq!(sub.actor(ActorId(0)).id, ActorId(0));
        assert!(sub
            .actors()
            .iter()
            .all(|actor| actor.ports.iter().all(|p| p.channel.index() < 2)));
    }

    #[test]
    fn rate_seq_cyclic_indexing() {
        let r = RateSeq::new(vec![2, 1]);
        assert_eq!(r.rate(0), 2);
        assert_eq!(r.rate(1), 1);
        assert_eq!(r.rate(2), 2);
        assert_eq!(r.sum(), 3);
    }

    #[test]
    fn max_exec_time() {
        let g = two_actor_graph();
        assert_eq!(g.max_exec_time(), 3);
    }
}

// engine.rs — Self-timed CSDF execution
//
// Time-stepped execution of a timed CSDF graph under a storage assignment:
// firings start when tokens and space permit, clocks advance by the minimal
// positive remaining time, firings end producing tokens and releasing
// space. Execution stops at the first revisit of a stored configuration
// (recurrence) or when a full maximal time step makes no progress
// (deadlock). Before returning, the periodic phase is re-executed once to
// derive the storage-dependency bitset.
//
// Preconditions: `caps` assigns a capacity to every channel of the graph.
// Postconditions: the input graph is never mutated; all execution state is
//                 owned by the engine.
// Failure modes: `InconsistentGraph` from the repetition vector,
//                `ResourceExhausted` from the state store.
// Side effects: none.

use crate::depend::{deadlock_dependencies, find_storage_dependencies, DependencyGraph};
use crate::error::{AnalysisError, Bounds};
use crate::graph::{Capacity, Graph, PortDir};
use crate::state::CsdfState;
use crate::store::{StackPos, StateStore};

/// Result of executing one storage assignment.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Recurrent-cycle iteration completions per time unit; 0 on deadlock.
    pub throughput: f64,
    /// Per-channel storage-dependency bits.
    pub dep: Vec<bool>,
}

/// Owning execution context for one graph.
///
/// The engine may be reused across storage assignments; every `execute`
/// call resets the visited-state store and the configuration.
pub struct Engine<'g> {
    g: &'g Graph,
    max_exec: u32,
    output_actor: usize,
    output_rep: u64,
    store: StateStore,
    cur: CsdfState,
    prev: CsdfState,
}

impl<'g> Engine<'g> {
    pub fn new(g: &'g Graph, bounds: &Bounds) -> Result<Self, AnalysisError> {
        let rep = g.repetition_vector()?;
        let (output_actor, output_rep) = rep
            .iter()
            .enumerate()
            .fold((0usize, u64::MAX), |(best, min), (a, &r)| {
                if r < min {
                    (a, r)
                } else {
                    (best, min)
                }
            });
        let max_exec = g.max_exec_time();
        Ok(Engine {
            g,
            max_exec,
            output_actor,
            output_rep,
            store: StateStore::new(bounds),
            cur: CsdfState::new(g.n_actors(), g.n_channels(), max_exec),
            prev: CsdfState::new(g.n_actors(), g.n_channels(), max_exec),
        })
    }

    /// The actor whose firings delimit iterations: smallest repetition
    /// count, ties broken by lowest id.
    pub fn output_actor(&self) -> usize {
        self.output_actor
    }

    /// Verify that every bounded channel can hold its initial tokens.
    pub fn check_initial_space(&self, caps: &[Capacity]) -> Result<(), AnalysisError> {
        for ch in self.g.channels() {
            if let Capacity::Bounded(size) = caps[ch.id.index()] {
                if size < ch.initial_tokens {
                    return Err(AnalysisError::InsufficientInitialSpace(ch.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Execute the graph under the given storage assignment.
    ///
    /// A channel that cannot hold its initial tokens yields throughput 0
    /// with its dependency bit set (use `check_initial_space` to turn that
    /// case into an error instead).
    pub fn execute(&mut self, caps: &[Capacity]) -> Result<ExecOutcome, AnalysisError> {
        assert_eq!(caps.len(), self.g.n_channels());
        self.store.clear();
        self.cur.clear();
        self.prev.clear();
        let mut dep = vec![false; self.g.n_channels()];

        for ch in self.g.channels() {
            let c = ch.id.index();
            match caps[c] {
                Capacity::Bounded(size) => {
                    if size < ch.initial_tokens {
                        dep[c] = true;
                        return Ok(ExecOutcome {
                            throughput: 0.0,
                            dep,
                        });
                    }
                    self.cur.tokens[c] = ch.initial_tokens;
                    self.cur.space[c] = size - ch.initial_tokens;
                }
                Capacity::Unbounded => {
                    self.cur.tokens[c] = ch.initial_tokens;
                }
            }
        }

        let mut rep_cnt: u64 = 0;
        loop {
            self.prev.tokens.copy_from_slice(&self.cur.tokens);
            self.prev.space.copy_from_slice(&self.cur.space);

            // End phase.
            for a in 0..self.g.n_actors() {
                while self.cur.act_clk[a][0] != 0 {
                    if a == self.output_actor {
                        rep_cnt += 1;
                        if rep_cnt == self.output_rep {
                            if let Some(pos) = self.store.store(&self.cur)? {
                                self.analyze_periodic_phase(caps, &mut dep)?;
                                return Ok(ExecOutcome {
                                    throughput: self.compute_throughput(pos),
                                    dep,
                                });
                            }
                            self.cur.glb_clk = 0;
                            rep_cnt = 0;
                        }
                    }
                    self.end_firing(a, caps);
                }
            }

            // Start phase.
            for a in 0..self.g.n_actors() {
                while self.can_start(a, caps) {
                    self.start_firing(a, caps);
                }
            }

            // Time step.
            match self.min_time_step() {
                None => {
                    let deps = deadlock_dependencies(self.g, &self.cur, caps);
                    find_storage_dependencies(self.g, deps, &mut dep);
                    return Ok(ExecOutcome {
                        throughput: 0.0,
                        dep,
                    });
                }
                Some(0) => {
                    // A zero-length firing completed; end it before time moves.
                }
                Some(step) => {
                    self.lower_clocks(step);
                    self.cur.glb_clk += step as u64;
                }
            }
        }
    }

    // ── Macro-step pieces ───────────────────────────────────────────────

    /// Can actor `a` start a firing: tokens on every input, space on every
    /// bounded output.
    fn can_start(&self, a: usize, caps: &[Capacity]) -> bool {
        for p in &self.g.actors()[a].ports {
            let c = p.channel.index();
            match p.dir {
                PortDir::In => {
                    let want = p.rates.rate(self.cur.rate_pos[c][0] as usize) as u64;
                    if self.cur.tokens[c] < want {
                        return false;
                    }
                }
                PortDir::Out => {
                    if caps[c].is_bounded() {
                        let want = p.rates.rate(self.cur.rate_pos[c][1] as usize) as u64;
                        if self.cur.space[c] < want {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Consume inputs, reserve output space, and add the firing with the
    /// actor's next execution time. Input rate cursors advance here; output
    /// cursors advance when the firing ends.
    fn start_firing(&mut self, a: usize, caps: &[Capacity]) {
        for p in &self.g.actors()[a].ports {
            let c = p.channel.index();
            match p.dir {
                PortDir::In => {
                    let pos = self.cur.rate_pos[c][0] as usize;
                    self.cur.tokens[c] -= p.rates.rate(pos) as u64;
                    self.cur.rate_pos[c][0] = ((pos + 1) % p.rates.len()) as u16;
                }
                PortDir::Out => {
                    if caps[c].is_bounded() {
                        let pos = self.cur.rate_pos[c][1] as usize;
                        self.cur.space[c] -= p.rates.rate(pos) as u64;
                    }
                }
            }
        }
        let actor = &self.g.actors()[a];
        let pos = self.cur.exec_pos[a] as usize;
        let et = actor.exec_times[pos];
        self.cur.act_clk[a][et as usize] += 1;
        self.cur.exec_pos[a] = ((pos + 1) % actor.exec_times.len()) as u16;
    }

    /// Produce output tokens, release input space, and pop the firing.
    fn end_firing(&mut self, a: usize, caps: &[Capacity]) {
        for p in &self.g.actors()[a].ports {
            let c = p.channel.index();
            match p.dir {
                PortDir::Out => {
                    let pos = self.cur.rate_pos[c][1] as usize;
                    self.cur.tokens[c] += p.rates.rate(pos) as u64;
                    self.cur.rate_pos[c][1] = ((pos + 1) % p.rates.len()) as u16;
                }
                PortDir::In => {
                    if caps[c].is_bounded() {
                        let pos = self.cur.rate_pos[c][0] as usize;
                        self.cur.space[c] += p.rates.rate(pos) as u64;
                    }
                }
            }
        }
        self.cur.act_clk[a][0] -= 1;
    }

    /// Smallest remaining time over all in-flight firings: 0 when a firing
    /// already completed, `None` when nothing is in flight.
    fn min_time_step(&self) -> Option<u32> {
        let mut step: Option<u32> = None;
        for a in 0..self.g.n_actors() {
            if self.cur.act_clk[a][0] != 0 {
                return Some(0);
            }
            for t in 1..=self.max_exec {
                if self.cur.act_clk[a][t as usize] != 0 {
                    if step.map_or(true, |s| t < s) {
                        step = Some(t);
                    }
                    break;
                }
            }
        }
        step
    }

    fn lower_clocks(&mut self, step: u32) {
        let step = step as usize;
        let top = self.max_exec as usize;
        for a in 0..self.g.n_actors() {
            for t in 0..=(top - step) {
                self.cur.act_clk[a][t] = self.cur.act_clk[a][t + step];
            }
            for t in (top - step + 1)..=top {
                self.cur.act_clk[a][t] = 0;
            }
        }
    }

    /// Iteration completions per time unit over the recurrent cycle: each
    /// stacked state on the cycle carries the time since the previous
    /// iteration boundary.
    fn compute_throughput(&self, cycle_pos: StackPos) -> f64 {
        let mut fires = 0u64;
        let mut time = 0u64;
        for s in &self.store.stack()[cycle_pos..] {
            if s.act_clk[self.output_actor][0] > 0 {
                fires += 1;
            }
            time += s.glb_clk;
        }
        fires as f64 / time as f64
    }

    // ── Periodic-phase dependency analysis ──────────────────────────────

    /// Re-execute one period starting from the recurrent configuration and
    /// record which resolved token/space shortages enabled each firing; the
    /// circuits of that relation mark the storage-dependent channels.
    fn analyze_periodic_phase(
        &mut self,
        caps: &[Capacity],
        dep: &mut [bool],
    ) -> Result<(), AnalysisError> {
        let periodic = self.cur.clone();
        let mut deps = DependencyGraph::new(self.g.n_actors());
        self.cur.glb_clk = 0;
        // The output actor still has to complete the firing that closed the
        // period, so the first completion does not count.
        let mut rep_cnt: i64 = -1;

        // Complete the leftover end firings from the output actor onward.
        let mut output_found = false;
        for a in 0..self.g.n_actors() {
            if !output_found && a == self.output_actor {
                output_found = true;
            }
            while output_found && self.cur.act_clk[a][0] != 0 {
                if a == self.output_actor {
                    rep_cnt += 1;
                    if rep_cnt == self.output_rep as i64 {
                        self.cur.glb_clk = 0;
                        rep_cnt = 0;
                    }
                }
                self.end_firing(a, caps);
            }
        }

        loop {
            // Start phase, recording which shortages were resolved since
            // the previous snapshot.
            for a in 0..self.g.n_actors() {
                while self.can_start(a, caps) {
                    self.record_start_dependencies(a, caps, &mut deps);
                    self.start_firing(a, caps);
                }
            }

            match self.min_time_step() {
                None => {
                    // A recurrent execution cannot stall.
                    return Err(AnalysisError::Deadlock(self.g.name.clone()));
                }
                Some(0) => {}
                Some(step) => {
                    self.lower_clocks(step);
                    self.cur.glb_clk += step as u64;
                }
            }

            self.prev.tokens.copy_from_slice(&self.cur.tokens);
            self.prev.space.copy_from_slice(&self.cur.space);

            for a in 0..self.g.n_actors() {
                while self.cur.act_clk[a][0] != 0 {
                    if a == self.output_actor {
                        rep_cnt += 1;
                        if rep_cnt == self.output_rep as i64 {
                            if self.cur.equal(&periodic) {
                                find_storage_dependencies(self.g, deps, dep);
                                return Ok(());
                            }
                            self.cur.glb_clk = 0;
                            rep_cnt = 0;
                        }
                    }
                    self.end_firing(a, caps);
                }
            }
        }
    }

    /// The firing of `a` is possible now but was not against the previous
    /// channel snapshot: each input that lacked tokens blocks `a` on the
    /// producer, each bounded output that lacked space blocks `a` on the
    /// consumer.
    fn record_start_dependencies(&self, a: usize, caps: &[Capacity], deps: &mut DependencyGraph) {
        for p in &self.g.actors()[a].ports {
            let c = p.channel.index();
            let ch = self.g.channel(p.channel);
            match p.dir {
                PortDir::In => {
                    let want = p.rates.rate(self.cur.rate_pos[c][0] as usize) as u64;
                    if self.prev.tokens[c] < want {
                        deps.set(ch.dst.index(), ch.src.index());
                    }
                }
                PortDir::Out => {
                    if caps[c].is_bounded() {
                        let want = p.rates.rate(self.cur.rate_pos[c][1] as usize) as u64;
                        if self.prev.space[c] < want {
                            deps.set(ch.src.index(), ch.dst.index());
                        }
                    }
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

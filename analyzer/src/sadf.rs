// sadf.rs — Scenario-aware dataflow graph model
//
// Kernels and detectors connected by data and control channels. A kernel's
// behavior is switched per scenario by control tokens; a detector refines
// each scenario into sub-scenarios through a per-scenario Markov chain and
// emits control tokens carrying scenario tags. Execution times are drawn
// from weighted profiles.
//
// Preconditions: graphs are built through the `add_*` methods so channel
//                endpoint registrations stay consistent.
// Postconditions: analyses treat the graph as immutable shared input.
// Failure modes: none here; structural checks return plain booleans and the
//                analyses map them to `UnsupportedTopology`.
// Side effects: none.

use std::collections::HashMap;

// ── Identities ──────────────────────────────────────────────────────────────

/// Index of a scenario or sub-scenario within its owning process.
pub type ScenId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Kernel,
    Detector,
}

/// Reference to a process: kernels and detectors live in separate id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcRef {
    pub kind: ProcessKind,
    pub id: usize,
}

impl ProcRef {
    pub fn kernel(id: usize) -> Self {
        ProcRef {
            kind: ProcessKind::Kernel,
            id,
        }
    }

    pub fn detector(id: usize) -> Self {
        ProcRef {
            kind: ProcessKind::Detector,
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Data,
    Control,
}

// ── Stochastic pieces ───────────────────────────────────────────────────────

/// One execution-time alternative with its selection weight.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub execution_time: f64,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct McState {
    pub name: String,
    pub subscenario: ScenId,
}

/// Detector-local stochastic state machine selecting the next sub-scenario.
#[derive(Debug, Clone)]
pub struct MarkovChain {
    pub initial: usize,
    pub states: Vec<McState>,
    /// Transition probabilities, `transitions[from][to]`.
    pub transitions: Vec<Vec<f64>>,
}

impl MarkovChain {
    pub fn probability(&self, from: usize, to: usize) -> f64 {
        self.transitions[from][to]
    }

    /// True when every state reaches every other over positive-probability
    /// transitions.
    pub fn is_single_scc(&self) -> bool {
        let n = self.states.len();
        let reach = |transpose: bool| {
            let mut seen = vec![false; n];
            let mut work = vec![0usize];
            seen[0] = true;
            while let Some(s) = work.pop() {
                for t in 0..n {
                    let p = if transpose {
                        self.transitions[t][s]
                    } else {
                        self.transitions[s][t]
                    };
                    if p > 0.0 && !seen[t] {
                        seen[t] = true;
                        work.push(t);
                    }
                }
            }
            seen.into_iter().all(|v| v)
        };
        reach(false) && reach(true)
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────────

/// Per-(sub)scenario behavior of a process: rates, profiles, and for
/// controlled processes the expected control tags.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub name: String,
    pub profiles: Vec<Profile>,
    /// Tokens consumed per data input channel.
    pub consumption: HashMap<usize, u32>,
    /// Tokens produced per data output channel.
    pub production: HashMap<usize, u32>,
    /// Control tokens produced per control output channel, with the
    /// scenario tag they carry (detectors only).
    pub control_production: HashMap<usize, (u32, ScenId)>,
    /// Expected tag per control input channel, for processes that
    /// distinguish scenarios by explicit tag combinations.
    pub controls: HashMap<usize, ScenId>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Scenario {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, execution_time: f64, weight: f64) -> Self {
        self.profiles.push(Profile {
            execution_time,
            weight,
        });
        self
    }

    pub fn with_consumption(mut self, channel: usize, rate: u32) -> Self {
        self.consumption.insert(channel, rate);
        self
    }

    pub fn with_production(mut self, channel: usize, rate: u32) -> Self {
        self.production.insert(channel, rate);
        self
    }

    pub fn with_control_production(mut self, channel: usize, rate: u32, tag: ScenId) -> Self {
        self.control_production.insert(channel, (rate, tag));
        self
    }

    /// Any nonzero rate means the process participates in this scenario.
    fn active(&self) -> bool {
        self.consumption.values().any(|&r| r > 0)
            || self.production.values().any(|&r| r > 0)
            || self.control_production.values().any(|&(r, _)| r > 0)
    }
}

// ── Processes ───────────────────────────────────────────────────────────────

/// A kernel or detector.
///
/// Kernels carry their behavior in `scenarios`. Detectors pair each entry
/// of `scenarios` with a Markov chain over sub-scenarios, and carry rates
/// and profiles in `subscenarios`.
#[derive(Debug, Clone)]
pub struct Process {
    pub id: usize,
    pub name: String,
    pub kind: ProcessKind,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub control_inputs: Vec<usize>,
    pub control_outputs: Vec<usize>,
    pub scenarios: Vec<Scenario>,
    pub subscenarios: Vec<Scenario>,
    pub markov_chains: Vec<MarkovChain>,
    /// Whether scenarios are identified by explicit per-channel tag
    /// combinations rather than by the tag of the single control input.
    pub explicit_controls: bool,
}

impl Process {
    fn new(id: usize, name: String, kind: ProcessKind) -> Self {
        Process {
            id,
            name,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            control_inputs: Vec::new(),
            control_outputs: Vec::new(),
            scenarios: Vec::new(),
            subscenarios: Vec::new(),
            markov_chains: Vec::new(),
            explicit_controls: false,
        }
    }

    pub fn has_control_inputs(&self) -> bool {
        !self.control_inputs.is_empty()
    }

    /// Behavior table indexed by a kernel scenario.
    pub fn scenario(&self, s: ScenId) -> &Scenario {
        &self.scenarios[s]
    }

    /// Behavior table indexed by a detector sub-scenario.
    pub fn subscenario(&self, s: ScenId) -> &Scenario {
        &self.subscenarios[s]
    }

    /// Rate tables for this process: kernels act per scenario, detectors
    /// per sub-scenario.
    pub fn behavior(&self, s: ScenId) -> &Scenario {
        match self.kind {
            ProcessKind::Kernel => &self.scenarios[s],
            ProcessKind::Detector => &self.subscenarios[s],
        }
    }

    pub fn is_active(&self, s: ScenId) -> bool {
        self.behavior(s).active()
    }

    pub fn consumption(&self, channel: usize, s: ScenId) -> u32 {
        self.behavior(s).consumption.get(&channel).copied().unwrap_or(0)
    }

    pub fn production(&self, channel: usize, s: ScenId) -> u32 {
        self.behavior(s).production.get(&channel).copied().unwrap_or(0)
    }

    pub fn control_production(&self, channel: usize, s: ScenId) -> (u32, ScenId) {
        self.behavior(s)
            .control_production
            .get(&channel)
            .copied()
            .unwrap_or((0, 0))
    }

    /// Selection probabilities of the profiles of (sub-)scenario `s`;
    /// weights are normalized here so descriptions may carry raw weights.
    pub fn profile_probabilities(&self, s: ScenId) -> Vec<f64> {
        let profiles = &self.behavior(s).profiles;
        let total: f64 = profiles.iter().map(|p| p.weight).sum();
        profiles.iter().map(|p| p.weight / total).collect()
    }
}

// ── Channels ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SadfChannel {
    pub id: usize,
    pub name: String,
    pub kind: ChannelKind,
    pub src: ProcRef,
    pub dst: ProcRef,
    pub initial_tokens: u64,
    /// `None` means unbounded.
    pub capacity: Option<u64>,
    /// Tags of the initial tokens on a control channel, as (count, tag)
    /// runs; their counts must sum to `initial_tokens`.
    pub initial_queue: Vec<(u64, ScenId)>,
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SadfGraph {
    pub name: String,
    pub kernels: Vec<Process>,
    pub detectors: Vec<Process>,
    pub data_channels: Vec<SadfChannel>,
    pub control_channels: Vec<SadfChannel>,
}

impl SadfGraph {
    pub fn new(name: impl Into<String>) -> Self {
        SadfGraph {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_kernel(&mut self, name: impl Into<String>) -> usize {
        let id = self.kernels.len();
        self.kernels
            .push(Process::new(id, name.into(), ProcessKind::Kernel));
        id
    }

    pub fn add_detector(&mut self, name: impl Into<String>) -> usize {
        let id = self.detectors.len();
        self.detectors
            .push(Process::new(id, name.into(), ProcessKind::Detector));
        id
    }

    pub fn process(&self, r: ProcRef) -> &Process {
        match r.kind {
            ProcessKind::Kernel => &self.kernels[r.id],
            ProcessKind::Detector => &self.detectors[r.id],
        }
    }

    fn process_mut(&mut self, r: ProcRef) -> &mut Process {
        match r.kind {
            ProcessKind::Kernel => &mut self.kernels[r.id],
            ProcessKind::Detector => &mut self.detectors[r.id],
        }
    }

    pub fn add_data_channel(
        &mut self,
        name: impl Into<String>,
        src: ProcRef,
        dst: ProcRef,
        initial_tokens: u64,
        capacity: Option<u64>,
    ) -> usize {
        let id = self.data_channels.len();
        self.data_channels.push(SadfChannel {
            id,
            name: name.into(),
            kind: ChannelKind::Data,
            src,
            dst,
            initial_tokens,
            capacity,
            initial_queue: Vec::new(),
        });
        self.process_mut(src).outputs.push(id);
        self.process_mut(dst).inputs.push(id);
        id
    }

    /// Control channels originate at detectors; their tokens carry scenario
    /// tags read by the destination before every firing.
    pub fn add_control_channel(
        &mut self,
        name: impl Into<String>,
        src: ProcRef,
        dst: ProcRef,
        capacity: Option<u64>,
        initial_queue: Vec<(u64, ScenId)>,
    ) -> usize {
        let id = self.control_channels.len();
        let initial_tokens = initial_queue.iter().map(|&(n, _)| n).sum();
        self.control_channels.push(SadfChannel {
            id,
            name: name.into(),
            kind: ChannelKind::Control,
            src,
            dst,
            initial_tokens,
            capacity,
            initial_queue,
        });
        self.process_mut(src).control_outputs.push(id);
        self.process_mut(dst).control_inputs.push(id);
        id
    }

    pub fn n_processes(&self) -> usize {
        self.kernels.len() + self.detectors.len()
    }

    // ── Structural verification ─────────────────────────────────────────

    /// Every process reachable from the first one over channels in either
    /// direction.
    pub fn is_single_component(&self) -> bool {
        if self.n_processes() == 0 {
            return true;
        }
        let start = if self.kernels.is_empty() {
            ProcRef::detector(0)
        } else {
            ProcRef::kernel(0)
        };
        let mut seen_k = vec![false; self.kernels.len()];
        let mut seen_d = vec![false; self.detectors.len()];
        let mut mark = |r: ProcRef, seen_k: &mut Vec<bool>, seen_d: &mut Vec<bool>| -> bool {
            let slot = match r.kind {
                ProcessKind::Kernel => &mut seen_k[r.id],
                ProcessKind::Detector => &mut seen_d[r.id],
            };
            let fresh = !*slot;
            *slot = true;
            fresh
        };
        let mut work = vec![start];
        mark(start, &mut seen_k, &mut seen_d);
        while let Some(r) = work.pop() {
            for ch in self.data_channels.iter().chain(&self.control_channels) {
                let other = if ch.src == r {
                    ch.dst
                } else if ch.dst == r {
                    ch.src
                } else {
                    continue;
                };
                if mark(other, &mut seen_k, &mut seen_d) {
                    work.push(other);
                }
            }
        }
        seen_k.into_iter().all(|v| v) && seen_d.into_iter().all(|v| v)
    }

    /// At least one profile anywhere has a nonzero execution time.
    pub fn is_timed(&self) -> bool {
        let timed = |scenarios: &[Scenario]| {
            scenarios
                .iter()
                .any(|s| s.profiles.iter().any(|p| p.execution_time != 0.0))
        };
        self.kernels.iter().any(|k| timed(&k.scenarios))
            || self.detectors.iter().any(|d| timed(&d.subscenarios))
    }

    /// Sufficient ergodicity condition: every detector Markov chain is one
    /// strongly connected component. When this holds the long-run analyses
    /// skip the post-hoc reachability test on the reduced system.
    pub fn is_structurally_ergodic(&self) -> bool {
        self.detectors
            .iter()
            .all(|d| d.markov_chains.iter().all(|mc| mc.is_single_scc()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Detector D drives kernel K through one control channel; K's fast
    /// scenario runs in 2 time units, its slow scenario in 10.
    pub(crate) fn controlled_kernel_graph() -> SadfGraph {
        let mut g = SadfGraph::new("controlled");
        let d = g.add_detector("D");
        let k = g.add_kernel("K");
        let ctrl = g.add_control_channel(
            "ctrl",
            ProcRef::detector(d),
            ProcRef::kernel(k),
            Some(1),
            Vec::new(),
        );

        g.kernels[k].scenarios = vec![
            Scenario::new("fast").with_profile(2.0, 1.0),
            Scenario::new("slow").with_profile(10.0, 1.0),
        ];

        g.detectors[d].scenarios = vec![Scenario::new("run")];
        g.detectors[d].subscenarios = vec![
            Scenario::new("fast")
                .with_profile(0.0, 1.0)
                .with_control_production(ctrl, 1, 0),
            Scenario::new("slow")
                .with_profile(0.0, 1.0)
                .with_control_production(ctrl, 1, 1),
        ];
        g.detectors[d].markov_chains = vec![MarkovChain {
            initial: 0,
            states: vec![
                McState {
                    name: "fast".into(),
                    subscenario: 0,
                },
                McState {
                    name: "slow".into(),
                    subscenario: 1,
                },
            ],
            transitions: vec![vec![0.7, 0.3], vec![0.7, 0.3]],
        }];
        g
    }

    #[test]
    fn channel_registration() {
        let g = controlled_kernel_graph();
        assert_eq!(g.detectors[0].control_outputs, vec![0]);
        assert_eq!(g.kernels[0].control_inputs, vec![0]);
        assert!(g.kernels[0].has_control_inputs());
        assert!(!g.detectors[0].has_control_inputs());
    }

    #[test]
    fn single_component_holds() {
        let g = controlled_kernel_graph();
        assert!(g.is_single_component());
    }

    #[test]
    fn disconnected_kernel_detected() {
        let mut g = controlled_kernel_graph();
        g.add_kernel("stray");
        assert!(!g.is_single_component());
    }

    #[test]
    fn timedness() {
        let g = controlled_kernel_graph();
        assert!(g.is_timed());
        let mut untimed = SadfGraph::new("untimed");
        let k = untimed.add_kernel("K");
        untimed.kernels[k].scenarios = vec![Scenario::new("only").with_profile(0.0, 1.0)];
        assert!(!untimed.is_timed());
    }

    #[test]
    fn structural_ergodicity() {
        let g = controlled_kernel_graph();
        assert!(g.is_structurally_ergodic());
        let mut bad = controlled_kernel_graph();
        // Make "slow" absorbing: "fast" becomes unreachable from it.
        bad.detectors[0].markov_chains[0].transitions = vec![vec![0.7, 0.3], vec![0.0, 1.0]];
        assert!(!bad.is_structurally_ergodic());
    }

    #[test]
    fn markov_chain_scc() {
        let mc = MarkovChain {
            initial: 0,
            states: vec![
                McState {
                    name: "a".into(),
                    subscenario: 0,
                },
                McState {
                    name: "b".into(),
                    subscenario: 1,
                },
            ],
            transitions: vec![vec![0.5, 0.5], vec![1.0, 0.0]],
        };
        assert!(mc.is_single_scc());
    }

    #[test]
    fn profile_probabilities_normalize() {
        let mut g = SadfGraph::new("weights");
        let k = g.add_kernel("K");
        g.kernels[k].scenarios = vec![Scenario::new("s")
            .with_profile(1.0, 3.0)
            .with_profile(2.0, 1.0)];
        let p = g.kernels[k].profile_probabilities(0);
        assert!((p[0] - 0.75).abs() < 1e-12);
        assert!((p[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn activity_from_rates() {
        let g = controlled_kernel_graph();
        // The kernel has no data rates at all: inactive in every scenario.
        assert!(!g.kernels[0].is_active(0));
        // The detector produces control tokens in both sub-scenarios.
        assert!(g.detectors[0].is_active(0));
        assert!(g.detectors[0].is_active(1));
    }
}

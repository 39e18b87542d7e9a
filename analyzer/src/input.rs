// input.rs — Graph descriptions on disk
//
// Serde descriptors for (C)SDF and SADF graphs plus their translation into
// the in-memory models. Names are resolved to dense identities here;
// anything malformed surfaces as `InconsistentGraph`.
//
// Preconditions: none.
// Postconditions: a successfully built graph satisfies the structural
//                 invariants the analyses rely on (registered endpoints,
//                 resolved scenario tags, stochastic Markov rows).
// Failure modes: `InconsistentGraph` with a message naming the entity.
// Side effects: none.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::AnalysisError;
use crate::graph::Graph;
use crate::sadf::{
    MarkovChain, McState, ProcRef, ProcessKind, Profile, SadfGraph, Scenario,
};

fn bad(msg: impl Into<String>) -> AnalysisError {
    AnalysisError::InconsistentGraph(msg.into())
}

// ── Top-level description ───────────────────────────────────────────────────

/// A graph description file: either dialect, discriminated by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphDescription {
    Csdf(CsdfDescription),
    Sadf(SadfDescription),
}

impl GraphDescription {
    pub fn from_json(text: &str) -> Result<Self, AnalysisError> {
        serde_json::from_str(text).map_err(|e| bad(format!("cannot parse description: {e}")))
    }
}

// ── CSDF ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CsdfDescription {
    pub name: String,
    pub actors: Vec<ActorDescription>,
    pub channels: Vec<ChannelDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActorDescription {
    pub name: String,
    pub exec_times: Vec<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChannelDescription {
    pub name: String,
    pub src: String,
    pub src_rates: Vec<u32>,
    pub dst: String,
    pub dst_rates: Vec<u32>,
    #[serde(default)]
    pub initial_tokens: u64,
    #[serde(default)]
    pub capacity: Option<u64>,
}

impl CsdfDescription {
    pub fn build(&self) -> Result<Graph, AnalysisError> {
        let mut g = Graph::new(self.name.clone());
        let mut ids = HashMap::new();
        for a in &self.actors {
            if a.exec_times.is_empty() {
                return Err(bad(format!("actor '{}' has no execution times", a.name)));
            }
            let id = g.add_actor(a.name.clone(), a.exec_times.clone());
            if ids.insert(a.name.clone(), id).is_some() {
                return Err(bad(format!("duplicate actor name '{}'", a.name)));
            }
        }
        for c in &self.channels {
            let src = *ids
                .get(&c.src)
                .ok_or_else(|| bad(format!("channel '{}': unknown actor '{}'", c.name, c.src)))?;
            let dst = *ids
                .get(&c.dst)
                .ok_or_else(|| bad(format!("channel '{}': unknown actor '{}'", c.name, c.dst)))?;
            if c.src_rates.is_empty() || c.dst_rates.is_empty() {
                return Err(bad(format!("channel '{}' has an empty rate sequence", c.name)));
            }
            g.connect(
                c.name.clone(),
                src,
                c.src_rates.clone(),
                dst,
                c.dst_rates.clone(),
                c.initial_tokens,
                c.capacity,
            );
        }
        Ok(g)
    }
}

// ── SADF ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SadfDescription {
    pub name: String,
    #[serde(default)]
    pub kernels: Vec<KernelDescription>,
    #[serde(default)]
    pub detectors: Vec<DetectorDescription>,
    #[serde(default)]
    pub data_channels: Vec<SadfChannelDescription>,
    #[serde(default)]
    pub control_channels: Vec<ControlChannelDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KernelDescription {
    pub name: String,
    pub scenarios: Vec<ScenarioDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DetectorDescription {
    pub name: String,
    pub scenarios: Vec<DetectorScenarioDescription>,
    pub subscenarios: Vec<ScenarioDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DetectorScenarioDescription {
    pub name: String,
    pub markov_chain: MarkovChainDescription,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkovChainDescription {
    pub initial: String,
    pub states: Vec<McStateDescription>,
    pub transitions: Vec<McTransitionDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McStateDescription {
    pub name: String,
    pub subscenario: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct McTransitionDescription {
    pub from: String,
    pub to: String,
    pub probability: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioDescription {
    pub name: String,
    #[serde(default)]
    pub profiles: Vec<ProfileDescription>,
    /// Channel name → tokens consumed.
    #[serde(default)]
    pub consumption: HashMap<String, u32>,
    /// Channel name → tokens produced.
    #[serde(default)]
    pub production: HashMap<String, u32>,
    /// Control channel name → tokens produced with a scenario tag, which
    /// names a scenario of the receiving process.
    #[serde(default)]
    pub control_production: HashMap<String, ControlProductionDescription>,
    /// Control channel name → expected scenario tag (explicit controls).
    #[serde(default)]
    pub controls: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileDescription {
    pub execution_time: f64,
    #[serde(default = "unit_weight")]
    pub weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControlProductionDescription {
    pub rate: u32,
    pub scenario: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SadfChannelDescription {
    pub name: String,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub initial_tokens: u64,
    #[serde(default)]
    pub capacity: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControlChannelDescription {
    pub name: String,
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Runs of initial tokens as (count, scenario-tag) pairs.
    #[serde(default)]
    pub initial_tokens: Vec<InitialTokenRunDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitialTokenRunDescription {
    pub count: u64,
    pub scenario: String,
}

impl SadfDescription {
    pub fn build(&self) -> Result<SadfGraph, AnalysisError> {
        let mut g = SadfGraph::new(self.name.clone());
        let mut procs: HashMap<String, ProcRef> = HashMap::new();
        for k in &self.kernels {
            let id = g.add_kernel(k.name.clone());
            if procs.insert(k.name.clone(), ProcRef::kernel(id)).is_some() {
                return Err(bad(format!("duplicate process name '{}'", k.name)));
            }
        }
        for d in &self.detectors {
            let id = g.add_detector(d.name.clone());
            if procs.insert(d.name.clone(), ProcRef::detector(id)).is_some() {
                return Err(bad(format!("duplicate process name '{}'", d.name)));
            }
        }

        let lookup = |procs: &HashMap<String, ProcRef>,
                      chan: &str,
                      name: &str|
         -> Result<ProcRef, AnalysisError> {
            procs
                .get(name)
                .copied()
                .ok_or_else(|| bad(format!("channel '{chan}': unknown process '{name}'")))
        };

        let mut data_ids = HashMap::new();
        for c in &self.data_channels {
            let src = lookup(&procs, &c.name, &c.src)?;
            let dst = lookup(&procs, &c.name, &c.dst)?;
            let id = g.add_data_channel(c.name.clone(), src, dst, c.initial_tokens, c.capacity);
            data_ids.insert(c.name.clone(), id);
        }
        let mut control_ids = HashMap::new();
        for c in &self.control_channels {
            let src = lookup(&procs, &c.name, &c.src)?;
            let dst = lookup(&procs, &c.name, &c.dst)?;
            if src.kind != ProcessKind::Detector {
                return Err(bad(format!(
                    "control channel '{}' must originate at a detector",
                    c.name
                )));
            }
            // Tags resolve against the destination's scenario list below;
            // queue construction is deferred until those names are known.
            let id = g.add_control_channel(c.name.clone(), src, dst, c.capacity, Vec::new());
            control_ids.insert(c.name.clone(), id);
        }

        // Scenario name tables per process, for tag resolution.
        let scenario_index = |desc: &SadfDescription, p: ProcRef, name: &str| -> Option<usize> {
            match p.kind {
                ProcessKind::Kernel => desc.kernels[p.id]
                    .scenarios
                    .iter()
                    .position(|s| s.name == name),
                ProcessKind::Detector => desc.detectors[p.id]
                    .scenarios
                    .iter()
                    .position(|s| s.name == name),
            }
        };

        let build_scenario = |desc: &ScenarioDescription,
                              owner: &str|
         -> Result<Scenario, AnalysisError> {
            let mut s = Scenario::new(desc.name.clone());
            s.profiles = desc
                .profiles
                .iter()
                .map(|p| Profile {
                    execution_time: p.execution_time,
                    weight: p.weight,
                })
                .collect();
            if s.profiles.is_empty() {
                return Err(bad(format!(
                    "scenario '{}' of '{}' has no profiles",
                    desc.name, owner
                )));
            }
            for (chan, &rate) in &desc.consumption {
                let id = *data_ids
                    .get(chan)
                    .ok_or_else(|| bad(format!("'{owner}': unknown data channel '{chan}'")))?;
                s.consumption.insert(id, rate);
            }
            for (chan, &rate) in &desc.production {
                let id = *data_ids
                    .get(chan)
                    .ok_or_else(|| bad(format!("'{owner}': unknown data channel '{chan}'")))?;
                s.production.insert(id, rate);
            }
            for (chan, cp) in &desc.control_production {
                let id = *control_ids
                    .get(chan)
                    .ok_or_else(|| bad(format!("'{owner}': unknown control channel '{chan}'")))?;
                let dst = g.control_channels[id].dst;
                let tag = scenario_index(self, dst, &cp.scenario).ok_or_else(|| {
                    bad(format!(
                        "'{owner}': tag '{}' is not a scenario of the receiver",
                        cp.scenario
                    ))
                })?;
                s.control_production.insert(id, (cp.rate, tag));
            }
            Ok(s)
        };

        // Kernel scenarios; explicit control-tag tables when given.
        let mut kernel_scenarios = Vec::new();
        for (k, kd) in self.kernels.iter().enumerate() {
            let mut scenarios = Vec::new();
            let mut explicit = false;
            for sd in &kd.scenarios {
                let mut s = build_scenario(sd, &kd.name)?;
                for (chan, tag_name) in &sd.controls {
                    explicit = true;
                    let id = *control_ids.get(chan).ok_or_else(|| {
                        bad(format!("'{}': unknown control channel '{chan}'", kd.name))
                    })?;
                    let tag = scenario_index(self, ProcRef::kernel(k), tag_name)
                        .ok_or_else(|| {
                            bad(format!("'{}': unknown scenario tag '{tag_name}'", kd.name))
                        })?;
                    s.controls.insert(id, tag);
                }
                scenarios.push(s);
            }
            kernel_scenarios.push((scenarios, explicit));
        }

        // Detector scenarios, sub-scenarios, and Markov chains.
        let mut detector_parts = Vec::new();
        for dd in &self.detectors {
            let mut subscenarios = Vec::new();
            for sd in &dd.subscenarios {
                subscenarios.push(build_scenario(sd, &dd.name)?);
            }
            let sub_index = |name: &str| -> Result<usize, AnalysisError> {
                dd.subscenarios
                    .iter()
                    .position(|s| s.name == name)
                    .ok_or_else(|| bad(format!("'{}': unknown sub-scenario '{name}'", dd.name)))
            };
            let mut scenarios = Vec::new();
            let mut chains = Vec::new();
            for scen in &dd.scenarios {
                scenarios.push(Scenario::new(scen.name.clone()));
                let mc = &scen.markov_chain;
                let state_index = |name: &str| -> Result<usize, AnalysisError> {
                    mc.states.iter().position(|s| s.name == name).ok_or_else(|| {
                        bad(format!("'{}': unknown chain state '{name}'", dd.name))
                    })
                };
                let mut transitions = vec![vec![0.0; mc.states.len()]; mc.states.len()];
                for t in &mc.transitions {
                    transitions[state_index(&t.from)?][state_index(&t.to)?] = t.probability;
                }
                for (i, row) in transitions.iter().enumerate() {
                    let total: f64 = row.iter().sum();
                    if (total - 1.0).abs() > 1e-9 {
                        return Err(bad(format!(
                            "'{}': probabilities out of state '{}' sum to {total}",
                            dd.name, mc.states[i].name
                        )));
                    }
                }
                let states = mc
                    .states
                    .iter()
                    .map(|s| {
                        Ok(McState {
                            name: s.name.clone(),
                            subscenario: sub_index(&s.subscenario)?,
                        })
                    })
                    .collect::<Result<Vec<_>, AnalysisError>>()?;
                chains.push(MarkovChain {
                    initial: state_index(&mc.initial)?,
                    states,
                    transitions,
                });
            }
            detector_parts.push((scenarios, subscenarios, chains));
        }

        for (k, (scenarios, explicit)) in kernel_scenarios.into_iter().enumerate() {
            g.kernels[k].scenarios = scenarios;
            g.kernels[k].explicit_controls = explicit;
        }
        for (d, (scenarios, subscenarios, chains)) in detector_parts.into_iter().enumerate() {
            g.detectors[d].scenarios = scenarios;
            g.detectors[d].subscenarios = subscenarios;
            g.detectors[d].markov_chains = chains;
        }

        // Initial control tokens, with tags resolved at the destination.
        for cd in &self.control_channels {
            let id = control_ids[&cd.name];
            let dst = g.control_channels[id].dst;
            let mut queue = Vec::new();
            let mut total = 0;
            for run in &cd.initial_tokens {
                let tag = scenario_index(self, dst, &run.scenario).ok_or_else(|| {
                    bad(format!(
                        "channel '{}': tag '{}' is not a scenario of the receiver",
                        cd.name, run.scenario
                    ))
                })?;
                total += run.count;
                queue.push((run.count, tag));
            }
            g.control_channels[id].initial_queue = queue;
            g.control_channels[id].initial_tokens = total;
        }

        Ok(g)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

// asap.rs — ASAP / self-timed schedulers over the TPS
//
// Three expansion policies for one configuration: the full scheduler emits
// every enabled action as its own transition, the resolved scheduler takes
// the first enabled action in a fixed order, and the reduced schedulers
// keep only a designated process's events as labelled transitions and
// collapse everything in between.
//
// Preconditions: the source configuration is live.
// Postconditions: newly stored configurations are returned for further
//                 expansion; temporaries are released before returning.
// Failure modes: `Deadlock` when nothing is enabled and no process has
//                finite remaining time; `ResourceExhausted` at the
//                configuration bound.
// Side effects: none.

use crate::error::AnalysisError;
use crate::sadf::{ProcRef, ProcessKind};
use crate::tps::{ConfigId, StepKind, Tps};

// ── Full and resolved expansion ─────────────────────────────────────────────

/// Emit every enabled action of every process as a separate transition.
pub fn progress_full(tps: &mut Tps, source: ConfigId) -> Result<Vec<ConfigId>, AnalysisError> {
    let mut new_configs = Vec::new();
    let mut action_possible = false;

    for k in 0..tps.g.kernels.len() {
        if tps.kernel_ready_to_fire(source, k) {
            action_possible = true;
            new_configs.extend(tps.kernel_control(source, k, true)?);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_fire(source, d) {
            action_possible = true;
            new_configs.extend(tps.detector_detect(source, d, true)?);
        }
    }
    for k in 0..tps.g.kernels.len() {
        if tps.kernel_ready_to_start(source, k) {
            action_possible = true;
            new_configs.extend(tps.kernel_start(source, k, true)?);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_start(source, d) {
            action_possible = true;
            new_configs.extend(tps.detector_start(source, d, true)?);
        }
    }
    for k in 0..tps.g.kernels.len() {
        if tps.kernel_ready_to_end(source, k) {
            action_possible = true;
            new_configs.extend(tps.kernel_end(source, k, true)?);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_end(source, d) {
            action_possible = true;
            new_configs.extend(tps.detector_end(source, d, true)?);
        }
    }

    if !action_possible {
        check_progress(tps, source)?;
        new_configs.extend(tps.time_step(source, true)?);
    }
    Ok(new_configs)
}

/// Take the first enabled action in kernels-then-detectors order, with
/// control before detect before start before end.
pub fn progress_resolved(tps: &mut Tps, source: ConfigId) -> Result<Vec<ConfigId>, AnalysisError> {
    for k in 0..tps.g.kernels.len() {
        if tps.g.kernels[k].has_control_inputs() && tps.kernel_ready_to_fire(source, k) {
            return tps.kernel_control(source, k, true);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_fire(source, d) {
            return tps.detector_detect(source, d, true);
        }
    }
    for k in 0..tps.g.kernels.len() {
        if tps.kernel_ready_to_start(source, k) {
            return tps.kernel_start(source, k, true);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_start(source, d) {
            return tps.detector_start(source, d, true);
        }
    }
    for k in 0..tps.g.kernels.len() {
        if tps.kernel_ready_to_end(source, k) {
            return tps.kernel_end(source, k, true);
        }
    }
    for d in 0..tps.g.detectors.len() {
        if tps.detector_ready_to_end(source, d) {
            return tps.detector_end(source, d, true);
        }
    }
    check_progress(tps, source)?;
    Ok(tps.time_step(source, true)?.into_iter().collect())
}

fn check_progress(tps: &Tps, source: ConfigId) -> Result<(), AnalysisError> {
    let c = tps.config(source);
    if c.kind == StepKind::Time || c.min_remaining.is_infinite() {
        return Err(AnalysisError::Deadlock(tps.g.name.clone()));
    }
    Ok(())
}

// ── Reduced expansion ───────────────────────────────────────────────────────

/// Which events of which processes stay visible in a reduced system.
#[derive(Debug, Clone, Copy)]
pub enum ReducedPolicy {
    /// End steps of one measured process (latency and deadline metrics).
    ProcessEvents { process: ProcRef },
    /// Start steps of the writer and end steps of the reader of one
    /// channel (long-run occupancy).
    ChannelEvents { writer: ProcRef, reader: ProcRef },
    /// Start steps of the writer only; transitions are discarded
    /// (maximum occupancy).
    WriteEvents { writer: ProcRef },
}

impl ReducedPolicy {
    fn keeps_transitions(&self) -> bool {
        !matches!(self, ReducedPolicy::WriteEvents { .. })
    }
}

/// Result of expanding one configuration by a single scheduling decision.
struct Expansion {
    relevant: Vec<ConfigId>,
    irrelevant: Vec<ConfigId>,
}

fn ready_to_start(tps: &Tps, source: ConfigId, p: ProcRef) -> bool {
    match p.kind {
        ProcessKind::Kernel => tps.kernel_ready_to_start(source, p.id),
        ProcessKind::Detector => tps.detector_ready_to_start(source, p.id),
    }
}

fn ready_to_end(tps: &Tps, source: ConfigId, p: ProcRef) -> bool {
    match p.kind {
        ProcessKind::Kernel => tps.kernel_ready_to_end(source, p.id),
        ProcessKind::Detector => tps.detector_ready_to_end(source, p.id),
    }
}

fn do_start(
    tps: &mut Tps,
    source: ConfigId,
    p: ProcRef,
    relevant: bool,
) -> Result<Vec<ConfigId>, AnalysisError> {
    match p.kind {
        ProcessKind::Kernel => tps.kernel_start(source, p.id, relevant),
        ProcessKind::Detector => tps.detector_start(source, p.id, relevant),
    }
}

fn do_end(
    tps: &mut Tps,
    source: ConfigId,
    p: ProcRef,
    relevant: bool,
) -> Result<Vec<ConfigId>, AnalysisError> {
    match p.kind {
        ProcessKind::Kernel => tps.kernel_end(source, p.id, relevant),
        ProcessKind::Detector => tps.detector_end(source, p.id, relevant),
    }
}

/// One scheduling decision for `source`: either a relevant event of the
/// measured process(es), or the first enabled action as an irrelevant
/// intermediate, or a time step.
fn expand_reduced(
    tps: &mut Tps,
    source: ConfigId,
    policy: &ReducedPolicy,
) -> Result<Expansion, AnalysisError> {
    // Relevant events first.
    match *policy {
        ReducedPolicy::ProcessEvents { process } => {
            if ready_to_end(tps, source, process) {
                return Ok(Expansion {
                    relevant: do_end(tps, source, process, true)?,
                    irrelevant: Vec::new(),
                });
            }
        }
        ReducedPolicy::ChannelEvents { writer, reader } => {
            if ready_to_start(tps, source, writer) {
                return Ok(Expansion {
                    relevant: do_start(tps, source, writer, true)?,
                    irrelevant: Vec::new(),
                });
            }
            if ready_to_end(tps, source, reader) {
                return Ok(Expansion {
                    relevant: do_end(tps, source, reader, true)?,
                    irrelevant: Vec::new(),
                });
            }
        }
        ReducedPolicy::WriteEvents { writer } => {
            if ready_to_start(tps, source, writer) {
                return Ok(Expansion {
                    relevant: do_start(tps, source, writer, true)?,
                    irrelevant: Vec::new(),
                });
            }
        }
    }

    // Otherwise the first enabled action, as an irrelevant intermediate.
    let irrelevant = 'action: {
        for k in 0..tps.g.kernels.len() {
            if tps.kernel_ready_to_fire(source, k) {
                break 'action tps.kernel_control(source, k, false)?;
            }
        }
        for d in 0..tps.g.detectors.len() {
            if tps.detector_ready_to_fire(source, d) {
                break 'action tps.detector_detect(source, d, false)?;
            }
        }
        for k in 0..tps.g.kernels.len() {
            if tps.kernel_ready_to_start(source, k) {
                break 'action tps.kernel_start(source, k, false)?;
            }
        }
        for d in 0..tps.g.detectors.len() {
            if tps.detector_ready_to_start(source, d) {
                break 'action tps.detector_start(source, d, false)?;
            }
        }
        for k in 0..tps.g.kernels.len() {
            if tps.kernel_ready_to_end(source, k) {
                break 'action tps.kernel_end(source, k, false)?;
            }
        }
        for d in 0..tps.g.detectors.len() {
            if tps.detector_ready_to_end(source, d) {
                break 'action tps.detector_end(source, d, false)?;
            }
        }
        check_progress(tps, source)?;
        tps.time_step(source, false)?.into_iter().collect()
    };
    Ok(Expansion {
        relevant: Vec::new(),
        irrelevant,
    })
}

/// Fold the transitions of the intermediates into `source`: a time step
/// adds its duration to the onward samples, a probabilistic branch scales
/// the onward probabilities, everything else passes through.
fn collapse(tps: &mut Tps, source: ConfigId, intermediates: &[ConfigId]) {
    for &i in intermediates {
        let kind = tps.config(i).kind;
        let step_value = tps.config(i).step_value;
        let onward = tps.config(i).transitions.clone();
        match kind {
            StepKind::Time => {
                for t in onward {
                    tps.add_transition(source, t.dest, t.probability, step_value + t.time_sample);
                }
            }
            StepKind::Detect | StepKind::Start => {
                let branch = tps.probability_to(source, i);
                for t in onward {
                    tps.add_transition(source, t.dest, t.probability * branch, t.time_sample);
                }
            }
            _ => {
                for t in onward {
                    tps.add_transition(source, t.dest, t.probability, t.time_sample);
                }
            }
        }
    }
    tps.drop_transitions_to_temporaries(source);
}

/// Expand from `source` until the next relevant configurations, collapsing
/// and deleting every intermediate. Depth-first with an explicit frame
/// stack; the spine of intermediates between two relevant events can be
/// long, and the native call stack must not bound it.
pub fn progress_reduced(
    tps: &mut Tps,
    source: ConfigId,
    policy: &ReducedPolicy,
) -> Result<Vec<ConfigId>, AnalysisError> {
    struct Frame {
        source: ConfigId,
        intermediates: Vec<ConfigId>,
        next: usize,
        relevant: Vec<ConfigId>,
    }

    let first = expand_reduced(tps, source, policy)?;
    if first.irrelevant.is_empty() {
        if !policy.keeps_transitions() {
            tps.config_mut(source).transitions.clear();
        }
        return Ok(first.relevant);
    }
    let mut stack = vec![Frame {
        source,
        intermediates: first.irrelevant,
        next: 0,
        relevant: first.relevant,
    }];
    let mut result = Vec::new();

    while let Some(top) = stack.last_mut() {
        if top.next < top.intermediates.len() {
            let child = top.intermediates[top.next];
            top.next += 1;
            let e = expand_reduced(tps, child, policy)?;
            if e.irrelevant.is_empty() {
                stack.last_mut().expect("frame").relevant.extend(e.relevant);
            } else {
                stack.push(Frame {
                    source: child,
                    intermediates: e.irrelevant,
                    next: 0,
                    relevant: e.relevant,
                });
            }
        } else {
            let frame = stack.pop().expect("frame");
            if policy.keeps_transitions() {
                collapse(tps, frame.source, &frame.intermediates);
            } else {
                tps.config_mut(frame.source).transitions.clear();
            }
            for i in frame.intermediates {
                tps.free_config(i);
            }
            match stack.last_mut() {
                Some(parent) => parent.relevant.extend(frame.relevant),
                None => result = frame.relevant,
            }
        }
    }
    Ok(result)
}

// ── Tests ───────────────────────────────────────────────────────────────────

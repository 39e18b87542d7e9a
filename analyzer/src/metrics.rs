// metrics.rs — Long-run and transient SADF performance metrics
//
// Entry points that build a (reduced) TPS, eliminate transients, solve for
// the equilibrium distribution, and derive scalar metrics: inter-firing
// latency moments, deadline-miss probabilities, buffer occupancy, and
// state-space sizes.
//
// Preconditions: long-run analyses require a single weak component and at
//                least one timed action.
// Postconditions: the input graph is not mutated.
// Failure modes: `UnsupportedTopology`, `NonErgodic`, `Deadlock`,
//                `SingularSystem`, `ResourceExhausted`.
// Side effects: none.

use crate::asap::{progress_full, progress_reduced, progress_resolved, ReducedPolicy};
use crate::error::AnalysisError;
use crate::sadf::{ChannelKind, ProcRef, SadfGraph};
use crate::tps::{ConfigId, Tps};

// ── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub average: f64,
    pub variance: f64,
    pub configurations: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtremeLatency {
    pub minimum: f64,
    pub maximum: f64,
    pub configurations: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OccupancyStats {
    pub average: f64,
    pub variance: f64,
    pub configurations: usize,
}

// ── Preconditions ───────────────────────────────────────────────────────────

fn verify_long_run(g: &SadfGraph) -> Result<(), AnalysisError> {
    if !g.is_single_component() {
        return Err(AnalysisError::UnsupportedTopology(format!(
            "graph '{}' does not consist of a single component",
            g.name
        )));
    }
    if !g.is_timed() {
        return Err(AnalysisError::UnsupportedTopology(format!(
            "graph '{}' is not timed",
            g.name
        )));
    }
    Ok(())
}

fn verify_connected(g: &SadfGraph) -> Result<(), AnalysisError> {
    if !g.is_single_component() {
        return Err(AnalysisError::UnsupportedTopology(format!(
            "graph '{}' does not consist of a single component",
            g.name
        )));
    }
    Ok(())
}

// ── Construction drivers ────────────────────────────────────────────────────

/// Expand the reduced system to a fixpoint, running `post` on every
/// configuration right after its expansion (its outgoing transitions still
/// carry the collapsed per-path time samples at that point).
fn construct_reduced<F>(
    tps: &mut Tps,
    policy: ReducedPolicy,
    mut post: F,
) -> Result<(), AnalysisError>
where
    F: FnMut(&mut Tps, ConfigId),
{
    let mut work = vec![tps.initial];
    while let Some(cfg) = work.pop() {
        let new = progress_reduced(tps, cfg, &policy)?;
        post(tps, cfg);
        work.extend(new);
    }
    Ok(())
}

/// Latency moments of one configuration, taken from its outgoing samples,
/// after which parallel transitions are merged (the samples are given up).
fn latency_post(tps: &mut Tps, cfg: ConfigId) {
    let c = tps.config(cfg);
    let mut average = 0.0;
    let mut squared = 0.0;
    let mut minimum = f64::INFINITY;
    let mut maximum = 0.0f64;
    for t in &c.transitions {
        average += t.probability * t.time_sample;
        squared += t.probability * t.time_sample * t.time_sample;
        minimum = minimum.min(t.time_sample);
        maximum = maximum.max(t.time_sample);
    }
    tps.config_mut(cfg).local_results = vec![average, squared, minimum, maximum];
    tps.merge_parallel_transitions(cfg);
}

// ── Inter-firing latency ────────────────────────────────────────────────────

/// Long-run average and variance of the time between consecutive firings
/// of `process`.
pub fn long_run_inter_firing_latency(
    g: &SadfGraph,
    process: ProcRef,
    max_configs: usize,
) -> Result<LatencyStats, AnalysisError> {
    verify_long_run(g)?;
    let ergodic = g.is_structurally_ergodic();

    let mut tps = Tps::with_limit(g, max_configs);
    construct_reduced(&mut tps, ReducedPolicy::ProcessEvents { process }, latency_post)?;
    tps.drop_status_content();
    tps.remove_transient_configurations();

    if !ergodic && !tps.is_single_scc() {
        return Err(AnalysisError::NonErgodic(g.name.clone()));
    }

    let configurations = tps.stored_count;
    let pi = tps.equilibrium_distribution()?;
    let mut average = 0.0;
    let mut squared = 0.0;
    for c in tps.stored_configs() {
        average += pi[c.id] * c.local_results[0];
        squared += pi[c.id] * c.local_results[1];
    }
    // Clip rounding residue below zero.
    let variance = (squared - average * average).max(0.0);
    Ok(LatencyStats {
        average,
        variance,
        configurations,
    })
}

/// Best- and worst-case inter-firing latency over the whole (unreduced in
/// time, reduced in events) state space.
pub fn extreme_inter_firing_latency(
    g: &SadfGraph,
    process: ProcRef,
    max_configs: usize,
) -> Result<ExtremeLatency, AnalysisError> {
    verify_long_run(g)?;

    let mut tps = Tps::with_limit(g, max_configs);
    construct_reduced(&mut tps, ReducedPolicy::ProcessEvents { process }, latency_post)?;

    let mut minimum = f64::INFINITY;
    let mut maximum = 0.0f64;
    for c in tps.stored_configs() {
        minimum = minimum.min(c.local_results[2]);
        maximum = maximum.max(c.local_results[3]);
    }
    Ok(ExtremeLatency {
        minimum,
        maximum,
        configurations: tps.stored_count,
    })
}

// ── Deadline miss probabilities ─────────────────────────────────────────────

/// Long-run probability that an inter-firing interval of `process` exceeds
/// `deadline`.
pub fn periodic_deadline_miss_probability(
    g: &SadfGraph,
    process: ProcRef,
    deadline: f64,
    max_configs: usize,
) -> Result<(f64, usize), AnalysisError> {
    verify_long_run(g)?;
    let ergodic = g.is_structurally_ergodic();

    let mut tps = Tps::with_limit(g, max_configs);
    construct_reduced(
        &mut tps,
        ReducedPolicy::ProcessEvents { process },
        |tps: &mut Tps, cfg| {
            let miss: f64 = tps
                .config(cfg)
                .transitions
                .iter()
                .filter(|t| t.time_sample > deadline)
                .map(|t| t.probability)
                .sum();
            tps.config_mut(cfg).local_results = vec![miss];
            tps.merge_parallel_transitions(cfg);
        },
    )?;
    tps.drop_status_content();
    tps.remove_transient_configurations();

    if !ergodic && !tps.is_single_scc() {
        return Err(AnalysisError::NonErgodic(g.name.clone()));
    }

    let configurations = tps.stored_count;
    let pi = tps.equilibrium_distribution()?;
    let miss = tps
        .stored_configs()
        .map(|c| pi[c.id] * c.local_results[0])
        .sum();
    Ok((miss, configurations))
}

/// Probability that the first firing of `process` completes later than
/// `deadline` after system start.
pub fn response_deadline_miss_probability(
    g: &SadfGraph,
    process: ProcRef,
    deadline: f64,
    max_configs: usize,
) -> Result<(f64, usize), AnalysisError> {
    verify_long_run(g)?;

    let mut tps = Tps::with_limit(g, max_configs);
    let initial = tps.initial;
    progress_reduced(&mut tps, initial, &ReducedPolicy::ProcessEvents { process })?;

    let miss = tps
        .config(initial)
        .transitions
        .iter()
        .filter(|t| t.time_sample > deadline)
        .map(|t| t.probability)
        .sum();
    Ok((miss, tps.stored_count))
}

// ── Buffer occupancy ────────────────────────────────────────────────────────

fn channel_endpoints(g: &SadfGraph, kind: ChannelKind, channel: usize) -> (ProcRef, ProcRef) {
    let ch = match kind {
        ChannelKind::Data => &g.data_channels[channel],
        ChannelKind::Control => &g.control_channels[channel],
    };
    (ch.src, ch.dst)
}

fn occupancy_of(tps: &Tps, cfg: ConfigId, kind: ChannelKind, channel: usize) -> u64 {
    let c = tps.config(cfg);
    match kind {
        ChannelKind::Data => c.channel_status[channel].occupation(),
        ChannelKind::Control => c.control_status[channel].occupation(),
    }
}

/// Long-run time-weighted average and variance of a channel's occupancy,
/// observed at the writer's starts and the reader's ends.
pub fn long_run_buffer_occupancy(
    g: &SadfGraph,
    kind: ChannelKind,
    channel: usize,
    max_configs: usize,
) -> Result<OccupancyStats, AnalysisError> {
    verify_long_run(g)?;
    let ergodic = g.is_structurally_ergodic();
    let (writer, reader) = channel_endpoints(g, kind, channel);

    let mut tps = Tps::with_limit(g, max_configs);
    construct_reduced(
        &mut tps,
        ReducedPolicy::ChannelEvents { writer, reader },
        |tps: &mut Tps, cfg| {
            let residence: f64 = tps
                .config(cfg)
                .transitions
                .iter()
                .map(|t| t.probability * t.time_sample)
                .sum();
            let occupancy = occupancy_of(tps, cfg, kind, channel) as f64;
            tps.config_mut(cfg).local_results = vec![residence, occupancy];
            tps.merge_parallel_transitions(cfg);
        },
    )?;
    tps.drop_status_content();
    tps.remove_transient_configurations();

    if !ergodic && !tps.is_single_scc() {
        return Err(AnalysisError::NonErgodic(g.name.clone()));
    }

    let configurations = tps.stored_count;
    let pi = tps.equilibrium_distribution()?;
    let mut time = 0.0;
    let mut occupancy = 0.0;
    let mut squared = 0.0;
    for c in tps.stored_configs() {
        let weighted = pi[c.id] * c.local_results[0];
        time += weighted;
        occupancy += weighted * c.local_results[1];
        squared += weighted * c.local_results[1] * c.local_results[1];
    }
    if time == 0.0 {
        return Err(AnalysisError::UnsupportedTopology(format!(
            "graph '{}' performs no scenarios that imply progress in time",
            g.name
        )));
    }
    let average = occupancy / time;
    let variance = (squared / time - average * average).max(0.0);
    Ok(OccupancyStats {
        average,
        variance,
        configurations,
    })
}

/// Largest occupancy the channel ever reaches under writes-before-reads
/// scheduling.
pub fn maximum_buffer_occupancy(
    g: &SadfGraph,
    kind: ChannelKind,
    channel: usize,
    max_configs: usize,
) -> Result<(u64, usize), AnalysisError> {
    verify_connected(g)?;
    let (writer, _) = channel_endpoints(g, kind, channel);

    let mut tps = Tps::with_limit(g, max_configs);
    tps.store_initial()?;
    construct_reduced(
        &mut tps,
        ReducedPolicy::WriteEvents { writer },
        |tps: &mut Tps, cfg| {
            tps.config_mut(cfg).transitions.clear();
        },
    )?;

    let maximum = tps
        .stored_configs()
        .map(|c| match kind {
            ChannelKind::Data => c.channel_status[channel].occupation(),
            ChannelKind::Control => c.control_status[channel].occupation(),
        })
        .max()
        .unwrap_or(0);
    Ok((maximum, tps.stored_count))
}

// ── State-space size ────────────────────────────────────────────────────────

/// Number of configurations reached by the full ASAP policy.
pub fn state_space_size(g: &SadfGraph, max_configs: usize) -> Result<usize, AnalysisError> {
    let mut tps = Tps::with_limit(g, max_configs);
    tps.store_initial()?;
    let mut work = vec![tps.initial];
    while let Some(cfg) = work.pop() {
        work.extend(progress_full(&mut tps, cfg)?);
    }
    // The initial configuration is entered without performing any action.
    Ok(tps.stored_count + 1)
}

/// Number of configurations reached when nondeterminism is resolved to the
/// first enabled action.
pub fn state_space_size_resolved(
    g: &SadfGraph,
    max_configs: usize,
) -> Result<usize, AnalysisError> {
    let mut tps = Tps::with_limit(g, max_configs);
    tps.store_initial()?;
    let mut work = vec![tps.initial];
    while let Some(cfg) = work.pop() {
        work.extend(progress_resolved(&mut tps, cfg)?);
    }
    Ok(tps.stored_count + 1)
}

// ── Tests ───────────────────────────────────────────────────────────────────

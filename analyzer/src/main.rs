use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use dpa::error::Bounds;
use dpa::input::GraphDescription;
use dpa::metrics;
use dpa::sadf::{ChannelKind, ProcRef, SadfGraph};

const EXIT_ANALYSIS_ERROR: u8 = 1;
const EXIT_USAGE_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "dpa",
    version,
    about = "Dataflow Performance Analyzer — state-space throughput, buffer, and long-run metrics"
)]
struct Cli {
    /// Graph description file (JSON)
    graph: PathBuf,

    /// Maximum number of stacked configurations
    #[arg(long, default_value_t = 1 << 20)]
    max_stack: usize,

    /// Number of hash buckets for the visited-state store
    #[arg(long, default_value_t = 1 << 16)]
    max_hash: usize,

    /// Maximum number of stored configurations for SADF analyses
    #[arg(long, default_value_t = 1 << 22)]
    max_configs: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Throughput under unconstrained storage
    Throughput,
    /// Throughput/storage Pareto front
    Buffer {
        /// Stop once this throughput is reached
        #[arg(long)]
        thr_bound: Option<f64>,
    },
    /// Long-run inter-firing latency of a process
    Latency {
        /// Process name (kernel or detector)
        #[arg(long)]
        process: String,
        /// Report the best/worst case instead of the long-run moments
        #[arg(long)]
        extreme: bool,
    },
    /// Deadline-miss probability of a process
    Deadline {
        #[arg(long)]
        process: String,
        #[arg(long)]
        deadline: f64,
        /// First-firing response instead of the periodic long run
        #[arg(long)]
        response: bool,
    },
    /// Buffer occupancy of a channel
    Occupancy {
        /// Channel name (data or control)
        #[arg(long)]
        channel: String,
        /// Report the maximum instead of the long-run average
        #[arg(long)]
        maximum: bool,
    },
    /// Number of reachable configurations
    States {
        /// Resolve nondeterminism to the first enabled action
        #[arg(long)]
        resolved: bool,
    },
}

fn find_process(g: &SadfGraph, name: &str) -> Option<ProcRef> {
    if let Some(k) = g.kernels.iter().position(|p| p.name == name) {
        return Some(ProcRef::kernel(k));
    }
    g.detectors
        .iter()
        .position(|p| p.name == name)
        .map(ProcRef::detector)
}

fn find_channel(g: &SadfGraph, name: &str) -> Option<(ChannelKind, usize)> {
    if let Some(c) = g.data_channels.iter().position(|c| c.name == name) {
        return Some((ChannelKind::Data, c));
    }
    g.control_channels
        .iter()
        .position(|c| c.name == name)
        .map(|c| (ChannelKind::Control, c))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let text = match std::fs::read_to_string(&cli.graph) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}: {}", cli.graph.display(), e);
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };
    let description = match GraphDescription::from_json(&text) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_ANALYSIS_ERROR);
        }
    };

    let bounds = Bounds {
        max_stack_size: cli.max_stack,
        max_hash_size: cli.max_hash,
    };

    match run(&cli, description, &bounds) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Analysis(e)) => {
            eprintln!("error: {e}");
            ExitCode::from(EXIT_ANALYSIS_ERROR)
        }
        Err(RunError::Usage(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_USAGE_ERROR)
        }
    }
}

enum RunError {
    Analysis(dpa::AnalysisError),
    Usage(String),
}

impl From<dpa::AnalysisError> for RunError {
    fn from(e: dpa::AnalysisError) -> Self {
        RunError::Analysis(e)
    }
}

fn run(cli: &Cli, description: GraphDescription, bounds: &Bounds) -> Result<(), RunError> {
    match (&cli.command, description) {
        (Command::Throughput, GraphDescription::Csdf(d)) => {
            let g = d.build()?;
            let thr = dpa::state_space_throughput(&g, bounds)?;
            println!("throughput: {thr}");
            Ok(())
        }
        (Command::Buffer { thr_bound }, GraphDescription::Csdf(d)) => {
            let g = d.build()?;
            let bound = thr_bound.unwrap_or(f64::INFINITY);
            let front = dpa::state_space_buffer_analysis(&g, bound, bounds)?;
            print!("{front}");
            Ok(())
        }
        (Command::Latency { process, extreme }, GraphDescription::Sadf(d)) => {
            let g = d.build()?;
            let p = find_process(&g, process)
                .ok_or_else(|| RunError::Usage(format!("unknown process '{process}'")))?;
            if *extreme {
                let ext = metrics::extreme_inter_firing_latency(&g, p, cli.max_configs)?;
                println!("minimum: {}", ext.minimum);
                println!("maximum: {}", ext.maximum);
                println!("configurations: {}", ext.configurations);
            } else {
                let stats = metrics::long_run_inter_firing_latency(&g, p, cli.max_configs)?;
                println!("average: {}", stats.average);
                println!("variance: {}", stats.variance);
                println!("configurations: {}", stats.configurations);
            }
            Ok(())
        }
        (
            Command::Deadline {
                process,
                deadline,
                response,
            },
            GraphDescription::Sadf(d),
        ) => {
            let g = d.build()?;
            let p = find_process(&g, process)
                .ok_or_else(|| RunError::Usage(format!("unknown process '{process}'")))?;
            let (miss, n) = if *response {
                metrics::response_deadline_miss_probability(&g, p, *deadline, cli.max_configs)?
            } else {
                metrics::periodic_deadline_miss_probability(&g, p, *deadline, cli.max_configs)?
            };
            println!("miss probability: {miss}");
            println!("configurations: {n}");
            Ok(())
        }
        (Command::Occupancy { channel, maximum }, GraphDescription::Sadf(d)) => {
            let g = d.build()?;
            let (kind, id) = find_channel(&g, channel)
                .ok_or_else(|| RunError::Usage(format!("unknown channel '{channel}'")))?;
            if *maximum {
                let (max, n) = metrics::maximum_buffer_occupancy(&g, kind, id, cli.max_configs)?;
                println!("maximum occupancy: {max}");
                println!("configurations: {n}");
            } else {
                let stats = metrics::long_run_buffer_occupancy(&g, kind, id, cli.max_configs)?;
                println!("average: {}", stats.average);
                println!("variance: {}", stats.variance);
                println!("configurations: {}", stats.configurations);
            }
            Ok(())
        }
        (Command::States { resolved }, GraphDescription::Sadf(d)) => {
            let g = d.build()?;
            let n = if *resolved {
                metrics::state_space_size_resolved(&g, cli.max_configs)?
            } else {
                metrics::state_space_size(&g, cli.max_configs)?
            };
            println!("configurations: {n}");
            Ok(())
        }
        (Command::Throughput | Command::Buffer { .. }, GraphDescription::Sadf(_)) => Err(
            RunError::Usage("this analysis needs a csdf graph description".into()),
        ),
        (_, GraphDescription::Csdf(_)) => Err(RunError::Usage(
            "this analysis needs a sadf graph description".into(),
        )),
    }
}

// dpa — Dataflow Performance Analyzer
//
// Library root. State-space analyses for timed (C)SDF graphs and the
// stochastic SADF dialect: throughput, buffer sizing, latency, deadline
// miss, and occupancy metrics.

pub mod asap;
pub mod buffer;
pub mod depend;
pub mod engine;
pub mod error;
pub mod fraction;
pub mod graph;
pub mod input;
pub mod metrics;
pub mod sadf;
pub mod sparse;
pub mod state;
pub mod store;
pub mod throughput;
pub mod tps;

pub use buffer::{state_space_buffer_analysis, ParetoFront};
pub use error::{AnalysisError, Bounds};
pub use throughput::state_space_throughput;

/*!
* # Tephra2-batch - a library for orchestrating multiphase tephra-dispersal simulation batches.
* A multi-phase volcanic eruption is modeled as an ordered timeline of phases, each with an
* emission policy (impulsive-repeating, continuous, or a single pulse spread over its days),
* a duration, and a following quiescence.  The crate expands such a timeline into a dated
* sequence of discrete eruptive events, draws a fresh simulator parameter set per event from
* a stochastic template grammar (with inter-parameter back-references resolved per run),
* dispatches one external Tephra2 invocation per event across a rayon worker pool, and folds
* the collected outputs into one queryable binary archive per phase with wind, config and
* aggregated deposit datasets cross-referenced by date.
*
* The external simulator is an opaque process reading three file inputs (config, grid, wind)
* and writing a tabular result to standard output.  Any binary honoring that contract works;
* the tests use a shell stub.
*
*  ## Quick Start
*
* To use tephra2-batch, add it to your `Cargo.toml`
* ```toml
* [dependencies]
* tephra2-batch = "^0.1.0"
* ```
*
*  - Load the crate prelude in the preamble of your `main.rs`.
*  - Expand a timeline and run the batch:
* ```no_run
* use tephra2_batch::prelude::*;
* use std::path::Path;
*
* fn main() -> Result<(), BatchError> {
*     // eagerly reject missing/invalid inputs before any work happens
*     validate_inputs(
*         Path::new("phases.csv"),
*         Path::new("winds.csv"),
*         Path::new("grid.csv"),
*         Path::new("tephra2"),
*         Path::new("work"),
*     )?;
*
*     // expand the eruption timeline into dated events
*     let phases = read_timeline("phases.csv")?;
*     let registry = FunctionRegistry::with_defaults();
*     let generator = EventGenerator::new(&phases, "templates", &registry)?;
*     let start = chrono::NaiveDate::from_ymd(2020, 1, 1);
*     let events = generator.generate(start, &mut rand::thread_rng())?;
*
*     // one simulator run per event, one archive per phase
*     let winds = WindTable::read("winds.csv")?;
*     let orchestrator = Orchestrator::new("tephra2", "grid.csv", "work");
*     let archives = orchestrator.run_batch(&events, &winds, Path::new("archives"))?;
*     println!("wrote {} phase archives", archives.len());
*
*     Ok(())
* }
* ```
*
* Parameter templates use a line-oriented grammar, one directive per line:
* ```text
* # fixed value
* VENT_ELEVATION 1500.0
* # sampled per run
* PLUME_HEIGHT {unif} [10000, 25000]
* # sampled per run from another parameter's realized value
* ERUPTION_MASS {mastin_mass} [|PLUME_HEIGHT|, 2700, 1000, -5, 5, 0, 1.5, 10]
* ```
* Sampling functions resolve against a [`FunctionRegistry`](sample::FunctionRegistry):
* well-known distributions ship by default and extensions register under their
* own names.  Unknown names and malformed back-references are rejected when the
* template loads, before any simulation work begins.
*/

#![warn(missing_docs)]
pub mod archive;
pub mod config;
pub mod errors;
pub mod phases;
pub mod runner;
pub mod sample;
pub mod wind;

/// Convenience re-exports of the main batch pipeline types.
pub mod prelude {
    pub use crate::archive::{aggregate, OutputTable, PhaseArchive};
    pub use crate::config::ParameterTable;
    pub use crate::errors::BatchError;
    pub use crate::phases::{read_timeline, Event, EventGenerator, Phase, PhaseType};
    pub use crate::runner::{validate_inputs, Orchestrator, SimOutput};
    pub use crate::sample::{generate_runs, FunctionRegistry, RunRecord, RunTable, SampleFn};
    pub use crate::wind::{WindCache, WindSlice, WindSource, WindTable};
}

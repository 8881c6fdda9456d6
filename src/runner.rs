//! Batch orchestration of external simulator runs.
//!
//! For each event the orchestrator materializes a per-run config file and a
//! cached per-date wind file, then fans the phase's events out over a rayon
//! worker pool.  Each worker invokes the simulator as a synchronous child
//! process with three positional file arguments (config, grid, wind) and
//! captures stdout.  A non-zero exit aborts the whole batch after the
//! failing command line is logged verbatim for manual reproduction.
use crate::archive::{self, OutputTable};
use crate::errors::BatchError;
use crate::phases::Event;
use crate::wind::{WindCache, WindSlice, WindSource};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Eagerly validate batch inputs before any expensive setup.
///
/// The timeline, wind table and grid files must exist and carry a `.csv`
/// extension; the simulator must exist and be executable; the working
/// directory must exist.
pub fn validate_inputs(
    timeline: &Path,
    wind_table: &Path,
    grid: &Path,
    simulator: &Path,
    work_dir: &Path,
) -> Result<(), BatchError> {
    for (path, label) in &[
        (timeline, "Multiphase timeline"),
        (wind_table, "Wind table"),
        (grid, "Grid"),
    ] {
        if !path.is_file() {
            return Err(BatchError::Validation(format!(
                "{} file {} not found.",
                label,
                path.display()
            )));
        }
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            return Err(BatchError::Validation(format!(
                "{} file {} must be a CSV file.",
                label,
                path.display()
            )));
        }
    }
    if !simulator.is_file() {
        return Err(BatchError::Validation(format!(
            "Simulator path {} not found.",
            simulator.display()
        )));
    }
    if !is_executable(simulator) {
        return Err(BatchError::Validation(format!(
            "Simulator path {} is invalid or not executable.",
            simulator.display()
        )));
    }
    if !work_dir.is_dir() {
        return Err(BatchError::Validation(format!(
            "Working directory {} not found.",
            work_dir.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// One completed simulator invocation, with the artifacts it owns.
#[derive(Debug, Clone)]
pub struct SimOutput {
    /// Batch-wide sequence number, fixed at submission.
    pub seq: usize,
    /// The generating event.
    pub event: Event,
    /// The per-event config file, removed after archiving.
    pub config_path: PathBuf,
    /// The shared per-date wind file.
    pub wind_path: PathBuf,
    /// The parsed simulator result.
    pub table: OutputTable,
}

struct PreparedRun {
    seq: usize,
    event: Event,
    config_path: PathBuf,
    wind_path: PathBuf,
}

/// Dispatches external simulator runs for a batch of events.
pub struct Orchestrator {
    simulator: PathBuf,
    grid: PathBuf,
    work_dir: PathBuf,
}

impl Orchestrator {
    /// An orchestrator writing per-run artifacts under `work_dir`.
    pub fn new<P: AsRef<Path>>(simulator: P, grid: P, work_dir: P) -> Self {
        Orchestrator {
            simulator: simulator.as_ref().to_path_buf(),
            grid: grid.as_ref().to_path_buf(),
            work_dir: work_dir.as_ref().to_path_buf(),
        }
    }

    /// Run one phase's events and collect their outputs.
    ///
    /// Wind files materialize through the cache before pool dispatch, so
    /// concurrent tasks only ever read them.  Collection short-circuits on
    /// the first failure.
    pub fn run_phase(
        &self,
        events: &[Event],
        seq_start: usize,
        cache: &mut WindCache,
    ) -> Result<Vec<SimOutput>, BatchError> {
        let mut prepared = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let seq = seq_start + offset;
            let wind_path = cache.materialize(event.date)?;
            let config_path = self.work_dir.join(format!(
                "config{:06}_phase{:03}_{}.dat",
                seq,
                event.phase,
                event.date.format("%Y-%m-%d")
            ));
            write_simulator_config(&config_path, event)?;
            prepared.push(PreparedRun {
                seq,
                event: event.clone(),
                config_path,
                wind_path,
            });
        }
        prepared
            .into_par_iter()
            .map(|run| {
                let stdout = self.invoke(&run.config_path, &run.wind_path)?;
                let table = OutputTable::parse(&stdout)?;
                log::debug!(
                    "Run {:06} (phase {}, {}) returned {} grid points.",
                    run.seq,
                    run.event.phase,
                    run.event.date,
                    table.rows.len()
                );
                Ok(SimOutput {
                    seq: run.seq,
                    event: run.event,
                    config_path: run.config_path,
                    wind_path: run.wind_path,
                    table,
                })
            })
            .collect()
    }

    /// Run a whole batch: group events by phase, execute each group, fold
    /// its outputs into a phase archive under `archive_dir`, and remove the
    /// per-event temporaries.  Returns the written archive paths.
    pub fn run_batch(
        &self,
        events: &[Event],
        source: &dyn WindSource,
        archive_dir: &Path,
    ) -> Result<Vec<PathBuf>, BatchError> {
        let mut cache = WindCache::new(source, &self.work_dir);
        let mut paths = Vec::new();
        let mut seq = 0;
        for group in group_by_phase(events) {
            let phase = group[0].phase;
            let phase_type = group[0].phase_type;
            log::info!(
                "Dispatching {} runs for phase {} ({}).",
                group.len(),
                phase,
                phase_type.as_str()
            );
            let outputs = self.run_phase(group, seq, &mut cache)?;
            seq += group.len();
            let winds = phase_winds(&outputs, &cache)?;
            let archive = archive::build_phase_archive(phase, phase_type, &outputs, &winds)?;
            paths.push(archive::write_phase_archive(archive_dir, &archive, &outputs)?);
        }
        log::info!("Batch complete: {} runs across {} phases.", seq, paths.len());
        Ok(paths)
    }

    /// Invoke the simulator synchronously and capture stdout.
    fn invoke(&self, config: &Path, wind: &Path) -> Result<String, BatchError> {
        let output = Command::new(&self.simulator)
            .arg(config)
            .arg(&self.grid)
            .arg(wind)
            .output()?;
        if !output.status.success() {
            let command = format!(
                "{} {} {} {}",
                self.simulator.display(),
                config.display(),
                self.grid.display(),
                wind.display()
            );
            log::error!(
                "Simulator failed with status {:?}. Here is the failed command in case you want to try it yourself:\n{}",
                output.status.code(),
                command
            );
            return Err(BatchError::Simulator {
                command,
                status: output.status.code(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Write one event's parameter/value pairs as the simulator config file:
/// tab-delimited lines in run-table column order.
fn write_simulator_config(path: &Path, event: &Event) -> Result<(), BatchError> {
    let mut out = BufWriter::new(File::create(path)?);
    for (name, value) in event.record.iter() {
        writeln!(out, "{}\t{}", name, value)?;
    }
    out.flush()?;
    Ok(())
}

/// Split an event sequence into runs of equal phase index, preserving order.
fn group_by_phase(events: &[Event]) -> Vec<&[Event]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=events.len() {
        if i == events.len() || events[i].phase != events[start].phase {
            groups.push(&events[start..i]);
            start = i;
        }
    }
    groups
}

/// Wind slices for the dates one phase's outputs reference.
fn phase_winds(
    outputs: &[SimOutput],
    cache: &WindCache,
) -> Result<BTreeMap<String, WindSlice>, BatchError> {
    let mut winds = BTreeMap::new();
    for output in outputs {
        let key = output.event.date.format("%Y-%m-%d").to_string();
        if !winds.contains_key(&key) {
            let slice = cache
                .slice(&key)
                .ok_or_else(|| BatchError::MissingWind(key.clone()))?;
            winds.insert(key, slice.clone());
        }
    }
    Ok(winds)
}

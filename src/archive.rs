//! Output aggregation and the per-phase binary archive.
//!
//! The simulator emits a tabular text result per event: a `#`-marked header
//! of space-delimited column names, then one space-delimited row per grid
//! point.  Besides the coordinate columns it carries a total mass column
//! (`Kg/m^2`) and one column per grain-size interval, named by its phi
//! bounds (e.g. `[-4->-3)`).
//!
//! Aggregation groups results by explicit (phase, date) keys, never by
//! completion order: tables sharing a date sum column-wise over the mass and
//! grain-size columns, then the grain-size fractions renormalize to 100 per
//! row.  Each phase persists as one bincode container holding a `wind`
//! group, a `configs` group and a `sims` group, cross-referenced by
//! `wind/<date>` dataset names.
use crate::errors::BatchError;
use crate::phases::PhaseType;
use crate::runner::SimOutput;
use crate::wind::WindSlice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Marker character opening the simulator's header line.
const HEADER_MARKER: char = '#';

/// One simulator result table, fully coerced to numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputTable {
    /// Column names from the header, marker stripped.
    pub columns: Vec<String>,
    /// One row per grid point.
    pub rows: Vec<Vec<f64>>,
}

impl OutputTable {
    /// Parse captured simulator stdout.
    ///
    /// The first non-blank line must begin with `#`; every data cell must
    /// coerce to `f64` or the batch fails with a data error, since silent
    /// coercion would corrupt downstream sums.
    pub fn parse(text: &str) -> Result<Self, BatchError> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| BatchError::Validation("Simulator output was empty.".to_string()))?;
        let header = header.trim();
        let stripped = header.strip_prefix(HEADER_MARKER).ok_or_else(|| {
            BatchError::Validation(format!(
                "Simulator output header does not start with '{}': \"{}\"",
                HEADER_MARKER, header
            ))
        })?;
        let columns: Vec<String> = stripped.split_whitespace().map(String::from).collect();
        if columns.is_empty() {
            return Err(BatchError::Validation(
                "Simulator output header names no columns.".to_string(),
            ));
        }
        let mut rows = Vec::new();
        for (i, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != columns.len() {
                return Err(BatchError::Validation(format!(
                    "Simulator output row {} has {} fields, header names {}.",
                    i + 1,
                    fields.len(),
                    columns.len()
                )));
            }
            let mut row = Vec::with_capacity(fields.len());
            for (j, field) in fields.iter().enumerate() {
                let value = field.parse::<f64>().map_err(|_| BatchError::Data {
                    row: i + 1,
                    column: columns[j].clone(),
                    value: field.to_string(),
                })?;
                row.push(value);
            }
            rows.push(row);
        }
        Ok(OutputTable { columns, rows })
    }

    /// Index of the total mass column (`Kg/m^2`).
    pub fn mass_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.contains("Kg/m"))
    }

    /// Indices of the grain-size interval columns, named by phi bounds.
    pub fn grain_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.starts_with('['))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Column-wise merge of tables sharing one (phase, date) key.
///
/// The mass and grain-size columns sum; every other column must agree across
/// the tables and carries over.  After summing, grain-size fractions
/// renormalize so each row's intervals total 100.  A single table is a no-op
/// merge apart from the renormalization, which leaves already-normalized
/// fractions unchanged.
pub fn aggregate(tables: &[OutputTable]) -> Result<OutputTable, BatchError> {
    let first = tables
        .first()
        .ok_or_else(|| BatchError::Validation("No output tables to aggregate.".to_string()))?;
    let mass = first.mass_column().ok_or_else(|| {
        BatchError::Validation("Simulator output lacks a Kg/m^2 mass column.".to_string())
    })?;
    let grains = first.grain_columns();
    let mut merged = first.clone();
    for table in &tables[1..] {
        if table.columns != first.columns {
            return Err(BatchError::Validation(
                "Cannot aggregate simulator outputs with differing columns.".to_string(),
            ));
        }
        if table.rows.len() != first.rows.len() {
            return Err(BatchError::Validation(
                "Cannot aggregate simulator outputs with differing row counts.".to_string(),
            ));
        }
        for (i, row) in table.rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                if j == mass || grains.contains(&j) {
                    merged.rows[i][j] += value;
                } else if (merged.rows[i][j] - value).abs() > 1e-9 {
                    return Err(BatchError::Validation(format!(
                        "Grid column {} disagrees across outputs for one date (row {}).",
                        first.columns[j],
                        i + 1
                    )));
                }
            }
        }
    }
    for row in &mut merged.rows {
        let total: f64 = grains.iter().map(|&j| row[j]).sum();
        if total > 0.0 {
            for &j in &grains {
                row[j] *= 100.0 / total;
            }
        }
    }
    Ok(merged)
}

/// Attribute block shared by config and sim datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetAttrs {
    /// 0-based phase index.
    pub phase: usize,
    /// Phase type label.
    pub phase_type: String,
    /// Event date, `%Y-%m-%d`.
    pub date: String,
    /// Back-reference to the wind dataset, `wind/<date>`.
    pub wind: String,
}

/// One event's parameter set as persisted in the `configs` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDataset {
    /// Dataset name, `config<seq>` with the batch-wide sequence number.
    pub name: String,
    /// Phase/type/date attributes plus the wind back-reference.
    pub attrs: DatasetAttrs,
    /// Parameter name/value pairs in run-table column order.
    pub parameters: Vec<(String, f64)>,
}

/// One aggregated output table as persisted in the `sims` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimDataset {
    /// Phase/type/date attributes plus the wind back-reference.
    pub attrs: DatasetAttrs,
    /// The merged, renormalized output table.
    pub table: OutputTable,
}

/// The persisted container for one phase: `wind`, `configs` and `sims`
/// groups keyed the way the downstream query tooling expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseArchive {
    /// 0-based phase index.
    pub phase: usize,
    /// Phase type label.
    pub phase_type: String,
    /// One wind dataset per distinct date, keyed by `%Y-%m-%d`.
    pub wind: BTreeMap<String, WindSlice>,
    /// One config dataset per event, in dispatch order.
    pub configs: Vec<ConfigDataset>,
    /// One aggregated dataset per date, keyed by `%Y-%m-%d`.
    pub sims: BTreeMap<String, SimDataset>,
}

impl PhaseArchive {
    /// Serialize the archive to `path`.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), BatchError> {
        let out = BufWriter::new(File::create(path)?);
        bincode::serialize_into(out, self)?;
        Ok(())
    }

    /// Deserialize an archive from `path`.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, BatchError> {
        let input = BufReader::new(File::open(path)?);
        let archive = bincode::deserialize_from(input)?;
        Ok(archive)
    }

    /// Conventional file name for this archive.
    pub fn file_name(&self) -> String {
        format!("phase{:03}.bin", self.phase)
    }
}

/// Fold one phase's collected outputs into an archive.
///
/// Wind datasets deduplicate by date; config datasets carry one entry per
/// event; outputs sharing a date merge through [`aggregate`].  Grouping is
/// by explicit date key, so the order the pool completed in is irrelevant.
pub fn build_phase_archive(
    phase: usize,
    phase_type: PhaseType,
    outputs: &[SimOutput],
    winds: &BTreeMap<String, WindSlice>,
) -> Result<PhaseArchive, BatchError> {
    let mut archive = PhaseArchive {
        phase,
        phase_type: phase_type.as_str().to_string(),
        wind: BTreeMap::new(),
        configs: Vec::with_capacity(outputs.len()),
        sims: BTreeMap::new(),
    };
    let mut by_date: BTreeMap<String, Vec<&SimOutput>> = BTreeMap::new();
    for output in outputs {
        let date = output.event.date.format("%Y-%m-%d").to_string();
        let slice = winds
            .get(&date)
            .ok_or_else(|| BatchError::MissingWind(date.clone()))?;
        archive
            .wind
            .entry(date.clone())
            .or_insert_with(|| slice.clone());
        archive.configs.push(ConfigDataset {
            name: format!("config{:06}", output.seq),
            attrs: DatasetAttrs {
                phase,
                phase_type: archive.phase_type.clone(),
                date: date.clone(),
                wind: format!("wind/{}", date),
            },
            parameters: output.event.record.iter().map(|(n, v)| (n.to_string(), v)).collect(),
        });
        by_date.entry(date).or_insert_with(Vec::new).push(output);
    }
    for (date, group) in by_date {
        let tables: Vec<OutputTable> = group.iter().map(|o| o.table.clone()).collect();
        let merged = aggregate(&tables)?;
        archive.sims.insert(
            date.clone(),
            SimDataset {
                attrs: DatasetAttrs {
                    phase,
                    phase_type: archive.phase_type.clone(),
                    date: date.clone(),
                    wind: format!("wind/{}", date),
                },
                table: merged,
            },
        );
    }
    Ok(archive)
}

/// Write a phase archive into `dir` and remove the per-event config files
/// the folded outputs own.  Cached wind files are batch-level and remain.
pub fn write_phase_archive<P: AsRef<Path>>(
    dir: P,
    archive: &PhaseArchive,
    outputs: &[SimOutput],
) -> Result<PathBuf, BatchError> {
    let path = dir.as_ref().join(archive.file_name());
    archive.write(&path)?;
    for output in outputs {
        std::fs::remove_file(&output.config_path)?;
    }
    log::info!(
        "Archived phase {}: {} configs, {} dates, {} wind slices -> {}",
        archive.phase,
        archive.configs.len(),
        archive.sims.len(),
        archive.wind.len(),
        path.display()
    );
    Ok(path)
}

//! Wind slices, sources and the per-date file cache.
//!
//! The upstream NetCDF reanalysis decoding lives outside this crate; what
//! arrives here is a date-indexed table of per-level speed and direction.
//! The simulator consumes one whitespace-delimited wind file per event date
//! (`elevation speed direction` rows, no header); [`WindCache`] guarantees a
//! date's file materializes at most once per batch and is only ever read
//! afterward.
use crate::errors::BatchError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One vertical level of a wind slice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindLevel {
    /// Level elevation in meters.
    pub elevation: f64,
    /// Wind speed in m/s.
    pub speed: f64,
    /// Wind direction in degrees clockwise from north.
    pub direction: f64,
}

/// The wind column for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindSlice {
    /// Levels ordered bottom to top.
    pub levels: Vec<WindLevel>,
}

impl WindSlice {
    /// Write the slice in the simulator's wind-file format: one
    /// space-delimited `elevation speed direction` row per level, no header.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), BatchError> {
        let mut out = BufWriter::new(File::create(path)?);
        for level in &self.levels {
            writeln!(out, "{} {} {}", level.elevation, level.speed, level.direction)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read a wind file written by [`write`](WindSlice::write).
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, BatchError> {
        let reader = BufReader::new(File::open(path)?);
        let mut levels = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(BatchError::Validation(format!(
                    "Wind file row {} has {} fields, expected 3.",
                    i + 1,
                    fields.len()
                )));
            }
            let parse = |s: &str| {
                s.parse::<f64>().map_err(|_| BatchError::Data {
                    row: i + 1,
                    column: "wind".to_string(),
                    value: s.to_string(),
                })
            };
            levels.push(WindLevel {
                elevation: parse(fields[0])?,
                speed: parse(fields[1])?,
                direction: parse(fields[2])?,
            });
        }
        Ok(WindSlice { levels })
    }
}

/// A provider of per-date wind slices.
pub trait WindSource {
    /// The wind column for `date`, or an error when the date is not covered.
    fn slice_for(&self, date: NaiveDate) -> Result<WindSlice, BatchError>;
}

#[derive(Debug, Deserialize)]
struct WindTableRow {
    date: String,
    elevation: f64,
    speed: f64,
    direction: f64,
}

/// A date-indexed wind table loaded from a CSV export
/// (`date, elevation, speed, direction` columns, one row per level).
#[derive(Debug, Clone)]
pub struct WindTable {
    by_date: BTreeMap<String, WindSlice>,
}

impl WindTable {
    /// Read the table from a csv file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, BatchError> {
        let file = File::open(path)?;
        let mut rdr = csv::Reader::from_reader(file);
        let mut by_date: BTreeMap<String, WindSlice> = BTreeMap::new();
        for result in rdr.deserialize() {
            let row: WindTableRow = result?;
            // Keys normalize through chrono so odd but valid spellings of
            // the same day cannot split a slice.
            let date = NaiveDate::parse_from_str(row.date.trim(), "%Y-%m-%d")?;
            by_date
                .entry(date.format("%Y-%m-%d").to_string())
                .or_insert_with(|| WindSlice { levels: Vec::new() })
                .levels
                .push(WindLevel {
                    elevation: row.elevation,
                    speed: row.speed,
                    direction: row.direction,
                });
        }
        log::debug!("Wind table covers {} dates.", by_date.len());
        Ok(WindTable { by_date })
    }

    /// Number of dates covered by the table.
    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    /// True when the table covers no dates.
    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}

impl WindSource for WindTable {
    fn slice_for(&self, date: NaiveDate) -> Result<WindSlice, BatchError> {
        let key = date.format("%Y-%m-%d").to_string();
        self.by_date
            .get(&key)
            .cloned()
            .ok_or(BatchError::MissingWind(key))
    }
}

/// Per-date wind file cache for one batch.
///
/// The first request for a date extracts the slice and writes
/// `wind_<date>.dat` into the cache directory; later requests return the
/// recorded path without touching the source.  Bookkeeping is an in-process
/// map, never a filesystem probe.
pub struct WindCache<'a> {
    source: &'a dyn WindSource,
    dir: PathBuf,
    entries: BTreeMap<String, (PathBuf, WindSlice)>,
}

impl<'a> WindCache<'a> {
    /// A cache materializing files under `dir`.
    pub fn new<P: AsRef<Path>>(source: &'a dyn WindSource, dir: P) -> Self {
        WindCache {
            source,
            dir: dir.as_ref().to_path_buf(),
            entries: BTreeMap::new(),
        }
    }

    /// The wind file for `date`, materializing it on first use.
    pub fn materialize(&mut self, date: NaiveDate) -> Result<PathBuf, BatchError> {
        let key = date.format("%Y-%m-%d").to_string();
        if let Some((path, _)) = self.entries.get(&key) {
            return Ok(path.clone());
        }
        log::info!("Extracting wind data for date {}", key);
        let slice = self.source.slice_for(date)?;
        let path = self.dir.join(format!("wind_{}.dat", key));
        slice.write(&path)?;
        self.entries.insert(key, (path.clone(), slice));
        Ok(path)
    }

    /// The cached slice for a date key, if materialized.
    pub fn slice(&self, key: &str) -> Option<&WindSlice> {
        self.entries.get(key).map(|(_, slice)| slice)
    }

    /// Date keys materialized so far, in order.
    pub fn dates(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of materialized dates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has materialized yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

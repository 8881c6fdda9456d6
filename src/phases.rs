//! Eruption timeline and phase event generation.
//!
//! A multiphase timeline is a comma-separated file with columns
//! `Phase Type, Phase Duration, Following Quiescence, Description`; the last
//! phase's quiescence carries the sentinel `END`.  The event generator walks
//! the timeline with a single forward-only clock and emits one [`Event`] per
//! simulated eruptive pulse, each carrying a freshly generated parameter set
//! from the phase type's template.
use crate::config::ParameterTable;
use crate::errors::BatchError;
use crate::sample::{self, fisk, FunctionRegistry, RunRecord};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::RngCore;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

/// Parameter rescaled when a single-pulse phase expands into daily events.
pub const MASS_PARAMETER: &str = "ERUPTION_MASS";

/// Location of the log10 daily explosion-count model for impulsive phases.
const EXP_PER_DAY_LOC: f64 = -0.4772;
/// Scale of the log10 daily explosion-count model for impulsive phases.
const EXP_PER_DAY_SCALE: f64 = 1.92;
/// Shape parameter of the log-logistic repose model for impulsive phases.
const INTEXP_FISK_SHAPE: f64 = 4.0;
/// Log-mean of the repose model for continuous phases.
const CONT_REPOSE_K: f64 = 2.37;

/// Emission policy of an eruption phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseType {
    /// Impulsive, repeating explosions with repose intervals in hours.
    IntExp,
    /// Continuous emission stepped by repose intervals in days.
    Cont,
    /// A single pulse spread evenly over the phase's calendar days.
    Default,
}

impl PhaseType {
    /// Map a timeline label to a policy.  Unrecognized labels take the
    /// single-pulse policy, matching the generator's default arm.
    pub fn from_label(label: &str) -> Self {
        match label {
            "IntExp" => PhaseType::IntExp,
            "Cont" => PhaseType::Cont,
            _ => PhaseType::Default,
        }
    }

    /// The canonical label, used in template file names and archive attrs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::IntExp => "IntExp",
            PhaseType::Cont => "Cont",
            PhaseType::Default => "default",
        }
    }

    /// Template file name for this phase type.
    pub fn template_file(&self) -> String {
        format!("{}_template.conf", self.as_str())
    }
}

/// Days of repose after a phase, or the end of the eruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiescence {
    /// Quiescent days before the next phase begins.
    Days(i64),
    /// Terminal marker on the final phase.
    End,
}

/// One labeled segment of the eruption timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// Emission policy.
    pub phase_type: PhaseType,
    /// Eruptive duration in days.
    pub duration: i64,
    /// Repose after the phase, or the terminal marker.
    pub quiescence: Quiescence,
    /// Free-text description from the timeline file.
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct TimelineRow {
    #[serde(rename = "Phase Type")]
    phase_type: String,
    #[serde(rename = "Phase Duration")]
    duration: i64,
    #[serde(rename = "Following Quiescence")]
    quiescence: String,
    #[serde(rename = "Description")]
    description: String,
}

/// Read a multiphase timeline from a comma-separated file.
///
/// Every phase but the last must carry a numeric quiescence; the last must
/// carry the sentinel `END`.  Durations must be positive.
pub fn read_timeline<P: AsRef<Path>>(path: P) -> Result<Vec<Phase>, BatchError> {
    let file = File::open(path)?;
    let mut rdr = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row: TimelineRow = result?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(BatchError::Timeline("timeline holds no phases".to_string()));
    }
    let last = rows.len() - 1;
    let mut phases = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if row.duration <= 0 {
            return Err(BatchError::Timeline(format!(
                "phase {} has non-positive duration {}",
                i, row.duration
            )));
        }
        let quiescence = if row.quiescence.trim() == "END" {
            if i != last {
                return Err(BatchError::Timeline(format!(
                    "END marker on phase {} of {}",
                    i,
                    last + 1
                )));
            }
            Quiescence::End
        } else {
            let days: i64 = row.quiescence.trim().parse().map_err(|_| {
                BatchError::Timeline(format!(
                    "phase {} quiescence \"{}\" is neither days nor END",
                    i, row.quiescence
                ))
            })?;
            if i == last {
                return Err(BatchError::Timeline(format!(
                    "final phase must carry END, found \"{}\"",
                    row.quiescence
                )));
            }
            if days < 0 {
                return Err(BatchError::Timeline(format!(
                    "phase {} has negative quiescence {}",
                    i, days
                )));
            }
            Quiescence::Days(days)
        };
        let phase_type = PhaseType::from_label(row.phase_type.trim());
        if phase_type == PhaseType::Default && row.phase_type.trim() != "default" {
            log::warn!(
                "Unrecognized phase type \"{}\" on phase {}; using single-pulse policy.",
                row.phase_type,
                i
            );
        }
        phases.push(Phase {
            phase_type,
            duration: row.duration,
            quiescence,
            description: row.description,
        });
    }
    Ok(phases)
}

/// Total calendar span of a timeline in days, eruptive plus quiescent.
pub fn timeline_span(phases: &[Phase]) -> i64 {
    phases
        .iter()
        .map(|p| {
            p.duration
                + match p.quiescence {
                    Quiescence::Days(d) => d,
                    Quiescence::End => 0,
                }
        })
        .sum()
}

/// One discrete simulated eruptive pulse.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Calendar day of the pulse.
    pub date: NaiveDate,
    /// 0-based index of the generating phase.
    pub phase: usize,
    /// Policy of the generating phase.
    pub phase_type: PhaseType,
    /// The pulse's resolved parameter assignment.
    pub record: RunRecord,
}

/// State machine expanding a timeline into a dated event sequence.
///
/// Templates for every phase type present in the timeline load eagerly at
/// construction, so a missing template file fails before any sampling.
pub struct EventGenerator<'a> {
    phases: &'a [Phase],
    templates: Vec<ParameterTable>,
    registry: &'a FunctionRegistry,
}

impl<'a> std::fmt::Debug for EventGenerator<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGenerator")
            .field("phases", &self.phases)
            .field("templates", &self.templates)
            .finish()
    }
}

impl<'a> EventGenerator<'a> {
    /// Build a generator, loading `<dir>/<type>_template.conf` per phase.
    pub fn new<P: AsRef<Path>>(
        phases: &'a [Phase],
        template_dir: P,
        registry: &'a FunctionRegistry,
    ) -> Result<Self, BatchError> {
        let dir = template_dir.as_ref();
        let mut templates = Vec::with_capacity(phases.len());
        for phase in phases {
            let path = dir.join(phase.phase_type.template_file());
            if !path.exists() {
                return Err(BatchError::MissingTemplate(path.display().to_string()));
            }
            let table = ParameterTable::read(&path)?;
            registry.validate(&table)?;
            templates.push(table);
        }
        Ok(EventGenerator {
            phases,
            templates,
            registry,
        })
    }

    /// Expand the timeline into a chronologically ordered event sequence
    /// starting at `start`.
    pub fn generate(
        &self,
        start: NaiveDate,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Event>, BatchError> {
        let span = timeline_span(self.phases);
        let start_dt = start.and_hms(0, 0, 0);
        log::info!(
            "Timeline: {} phases, {} total days. Start date: {}. End date: {}.",
            self.phases.len(),
            span,
            start,
            start + Duration::days(span)
        );
        let mut events = Vec::new();
        let mut clock = start_dt;
        for (i, phase) in self.phases.iter().enumerate() {
            let template = &self.templates[i];
            let phase_start = clock;
            let phase_end = phase_start + Duration::days(phase.duration);
            log::info!(
                "PHASE {} ({}): {}. Start date: {}; end date: {}; duration: {} days.",
                i,
                phase.phase_type.as_str(),
                phase.description,
                phase_start.date(),
                phase_end.date(),
                phase.duration
            );
            let bangs = match phase.phase_type {
                PhaseType::IntExp => {
                    self.impulsive(i, phase, template, phase_start, phase_end, &mut events, rng)?
                }
                PhaseType::Cont => {
                    self.continuous(i, phase, template, phase_start, phase_end, &mut events, rng)?
                }
                PhaseType::Default => {
                    self.single_pulse(i, phase, template, phase_start, phase_end, &mut events, rng)?
                }
            };
            log::info!("Generated {} bangs over {} days.", bangs, phase.duration);
            clock = phase_end;
            if let Quiescence::Days(days) = phase.quiescence {
                log::info!("Quiescent for {} days.", days);
                clock = clock + Duration::days(days);
            }
        }
        Ok(events)
    }

    fn draw_record(
        &self,
        template: &ParameterTable,
        rng: &mut dyn RngCore,
    ) -> Result<RunRecord, BatchError> {
        let table = sample::generate_runs(template, 1, self.registry, rng)?;
        table
            .record(0)
            .ok_or_else(|| BatchError::Validation("empty run table".to_string()))
    }

    /// Impulsive-repeating policy: one event per burst, repose in hours
    /// drawn from a log-logistic model parameterized by the phase's daily
    /// explosion-count rate.
    #[allow(clippy::too_many_arguments)]
    fn impulsive(
        &self,
        index: usize,
        phase: &Phase,
        template: &ParameterTable,
        phase_start: NaiveDateTime,
        phase_end: NaiveDateTime,
        events: &mut Vec<Event>,
        rng: &mut dyn RngCore,
    ) -> Result<usize, BatchError> {
        let rate_dist = Normal::new(EXP_PER_DAY_LOC, EXP_PER_DAY_SCALE)?;
        let n_per_day = 10f64.powf(rate_dist.sample(rng));
        let mut clock = phase_start;
        let mut bangs = 0;
        while clock < phase_end {
            let record = self.draw_record(template, rng)?;
            bang_log(index, phase, clock, phase_start, &record);
            events.push(Event {
                date: clock.date(),
                phase: index,
                phase_type: phase.phase_type,
                record,
            });
            bangs += 1;
            let repose_hours = (fisk(INTEXP_FISK_SHAPE, n_per_day, 1.0, rng) / 24.0)
                .ceil()
                .max(1.0) as i64;
            clock = clock + Duration::hours(repose_hours);
        }
        Ok(bangs)
    }

    /// Continuous policy: repose in whole days from a log-normal model; the
    /// per-event mass is not pre-divided.
    #[allow(clippy::too_many_arguments)]
    fn continuous(
        &self,
        index: usize,
        phase: &Phase,
        template: &ParameterTable,
        phase_start: NaiveDateTime,
        phase_end: NaiveDateTime,
        events: &mut Vec<Event>,
        rng: &mut dyn RngCore,
    ) -> Result<usize, BatchError> {
        let step_dist = Normal::new(0.0, 1.0)?;
        let mut clock = phase_start;
        let mut bangs = 0;
        while clock < phase_end {
            let record = self.draw_record(template, rng)?;
            bang_log(index, phase, clock, phase_start, &record);
            events.push(Event {
                date: clock.date(),
                phase: index,
                phase_type: phase.phase_type,
                record,
            });
            bangs += 1;
            let repose_days = (CONT_REPOSE_K + step_dist.sample(rng)).exp().ceil().max(1.0) as i64;
            clock = clock + Duration::days(repose_days);
        }
        Ok(bangs)
    }

    /// Single-pulse policy: one record drawn for the phase, expanded into
    /// one event per calendar day with the mass parameter divided by the
    /// day count so total phase mass is conserved.
    #[allow(clippy::too_many_arguments)]
    fn single_pulse(
        &self,
        index: usize,
        phase: &Phase,
        template: &ParameterTable,
        phase_start: NaiveDateTime,
        phase_end: NaiveDateTime,
        events: &mut Vec<Event>,
        rng: &mut dyn RngCore,
    ) -> Result<usize, BatchError> {
        let base = self.draw_record(template, rng)?;
        let days = (phase_end - phase_start).num_days();
        let total_mass = base.get(MASS_PARAMETER).ok_or_else(|| {
            BatchError::Validation(format!(
                "Single-pulse phase {} template lacks the {} parameter.",
                index, MASS_PARAMETER
            ))
        })?;
        let mut clock = phase_start;
        let mut bangs = 0;
        while clock < phase_end {
            let mut record = base.clone();
            record.set(MASS_PARAMETER, total_mass / days as f64)?;
            bang_log(index, phase, clock, phase_start, &record);
            events.push(Event {
                date: clock.date(),
                phase: index,
                phase_type: phase.phase_type,
                record,
            });
            bangs += 1;
            clock = clock + Duration::days(1);
        }
        Ok(bangs)
    }
}

fn bang_log(
    index: usize,
    phase: &Phase,
    clock: NaiveDateTime,
    phase_start: NaiveDateTime,
    record: &RunRecord,
) {
    let day = (clock - phase_start).num_days();
    let height = record.get("PLUME_HEIGHT").unwrap_or(f64::NAN);
    let mass = record.get(MASS_PARAMETER).unwrap_or(f64::NAN);
    log::debug!(
        "BANG\tphase={}\ttype={}\tday={}/{}\tdate={}\theight={:.2}km\tmass={:.2e}kg",
        index,
        phase.phase_type.as_str(),
        day,
        phase.duration,
        clock.date(),
        height / 1000.0,
        mass
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    const TEMPLATE: &str = "PLUME_HEIGHT {unif} [10000, 25000]\n\
                            ERUPTION_MASS {unif} [1e9, 1e11]\n\
                            ALPHA 2.4\n";

    fn template_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in &["IntExp_template.conf", "Cont_template.conf", "default_template.conf"] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(TEMPLATE.as_bytes()).unwrap();
        }
        dir
    }

    fn timeline_file(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("phases.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn timeline_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = timeline_file(
            dir.path(),
            "Phase Type,Phase Duration,Following Quiescence,Description\n\
             Cont,5,2,effusive onset\n\
             IntExp,3,END,explosive finale\n",
        );
        let phases = read_timeline(&path).unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].phase_type, PhaseType::Cont);
        assert_eq!(phases[0].quiescence, Quiescence::Days(2));
        assert_eq!(phases[1].quiescence, Quiescence::End);
        assert_eq!(timeline_span(&phases), 10);
    }

    #[test]
    fn early_end_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = timeline_file(
            dir.path(),
            "Phase Type,Phase Duration,Following Quiescence,Description\n\
             Cont,5,END,early end\n\
             IntExp,3,END,finale\n",
        );
        assert!(matches!(read_timeline(&path), Err(BatchError::Timeline(_))));
    }

    #[test]
    fn missing_end_marker_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = timeline_file(
            dir.path(),
            "Phase Type,Phase Duration,Following Quiescence,Description\n\
             Cont,5,2,no terminal marker\n",
        );
        assert!(matches!(read_timeline(&path), Err(BatchError::Timeline(_))));
    }

    #[test]
    fn missing_template_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let phases = vec![Phase {
            phase_type: PhaseType::IntExp,
            duration: 3,
            quiescence: Quiescence::End,
            description: "no template on disk".to_string(),
        }];
        let registry = FunctionRegistry::with_defaults();
        let err = EventGenerator::new(&phases, dir.path(), &registry).unwrap_err();
        assert!(matches!(err, BatchError::MissingTemplate(_)));
    }

    #[test]
    fn events_stay_inside_eruptive_windows() {
        let templates = template_dir();
        let phases = vec![
            Phase {
                phase_type: PhaseType::Cont,
                duration: 5,
                quiescence: Quiescence::Days(2),
                description: "effusive".to_string(),
            },
            Phase {
                phase_type: PhaseType::IntExp,
                duration: 3,
                quiescence: Quiescence::End,
                description: "explosive".to_string(),
            },
        ];
        let registry = FunctionRegistry::with_defaults();
        let gen = EventGenerator::new(&phases, templates.path(), &registry).unwrap();
        let start = NaiveDate::from_ymd(2020, 1, 1);
        let mut rng = StdRng::seed_from_u64(11);
        let events = gen.generate(start, &mut rng).unwrap();
        assert!(!events.is_empty());
        let p0_end = start + Duration::days(5);
        let p1_start = p0_end + Duration::days(2);
        let p1_end = p1_start + Duration::days(3);
        for event in &events {
            match event.phase {
                0 => assert!(event.date >= start && event.date < p0_end),
                1 => assert!(event.date >= p1_start && event.date < p1_end),
                other => panic!("unexpected phase index {}", other),
            }
            // No event on a quiescence day.
            assert!(!(event.date >= p0_end && event.date < p1_start));
        }
        // Phases arrive in order and dates never move backward within one.
        for pair in events.windows(2) {
            assert!(pair[0].phase <= pair[1].phase);
            if pair[0].phase == pair[1].phase {
                assert!(pair[0].date <= pair[1].date);
            }
        }
    }

    #[test]
    fn single_pulse_conserves_mass() {
        let templates = template_dir();
        let phases = vec![Phase {
            phase_type: PhaseType::Default,
            duration: 7,
            quiescence: Quiescence::End,
            description: "single pulse".to_string(),
        }];
        let registry = FunctionRegistry::with_defaults();
        let gen = EventGenerator::new(&phases, templates.path(), &registry).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let events = gen
            .generate(NaiveDate::from_ymd(2020, 3, 1), &mut rng)
            .unwrap();
        assert_eq!(events.len(), 7);
        let daily: Vec<f64> = events
            .iter()
            .map(|e| e.record.get(MASS_PARAMETER).unwrap())
            .collect();
        let total: f64 = daily.iter().sum();
        // All daily events share the non-mass parameters.
        for event in &events[1..] {
            assert_eq!(
                event.record.get("PLUME_HEIGHT"),
                events[0].record.get("PLUME_HEIGHT")
            );
        }
        let original = daily[0] * 7.0;
        assert!((total - original).abs() < 1e-6 * original.abs());
    }

    #[test]
    fn impulsive_and_continuous_draw_fresh_records() {
        let templates = template_dir();
        let phases = vec![Phase {
            phase_type: PhaseType::Cont,
            duration: 60,
            quiescence: Quiescence::End,
            description: "continuous".to_string(),
        }];
        let registry = FunctionRegistry::with_defaults();
        let gen = EventGenerator::new(&phases, templates.path(), &registry).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let events = gen
            .generate(NaiveDate::from_ymd(2021, 6, 1), &mut rng)
            .unwrap();
        if events.len() > 1 {
            let first = events[0].record.get("PLUME_HEIGHT").unwrap();
            let distinct = events
                .iter()
                .any(|e| e.record.get("PLUME_HEIGHT").unwrap() != first);
            assert!(distinct);
        }
    }
}
